use beacon_core::geo::distance_m;
use beacon_core::{LocationCoordinate, LocationUpdate, Proximity};

/// A position fix together with the clock and route estimate at that moment.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationFix {
    pub update: LocationUpdate,
    /// Current time in milliseconds since the Unix epoch.
    pub now_ms: f64,
    /// Estimated arrival time at the active destination, if a route is known.
    pub estimated_arrival_ms: Option<f64>,
}

impl LocationFix {
    pub fn new(update: LocationUpdate, now_ms: f64) -> Self {
        Self {
            update,
            now_ms,
            estimated_arrival_ms: None,
        }
    }

    pub fn with_estimated_arrival(mut self, estimated_arrival_ms: f64) -> Self {
        self.estimated_arrival_ms = Some(estimated_arrival_ms);
        self
    }

    pub fn position(&self) -> LocationCoordinate {
        self.update.location.coordinate
    }
}

/// Whether `threshold` is satisfied. Missing destination or ETA yields
/// `false`.
pub fn is_threshold_reached(
    threshold: &Proximity,
    current_position: LocationCoordinate,
    current_time_ms: f64,
    destination: Option<LocationCoordinate>,
    estimated_arrival_time_ms: Option<f64>,
) -> bool {
    match *threshold {
        Proximity::Spatial { meters } => destination
            .map(|destination| distance_m(current_position, destination) < meters)
            .unwrap_or(false),
        Proximity::Temporal { millis } => estimated_arrival_time_ms
            .map(|eta| eta - current_time_ms < millis)
            .unwrap_or(false),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProximityHandlerId(u64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProximityEvent {
    Reached {
        handler: ProximityHandlerId,
        threshold: Proximity,
    },
    Cancelled {
        handler: ProximityHandlerId,
    },
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    handler: ProximityHandlerId,
    threshold: Proximity,
    reached: bool,
}

/// Edge-triggered watcher over at most one proximity threshold.
///
/// Each registration gets a fresh handler id; `Reached` fires at most once
/// per registration, and events carrying a superseded id are stale.
#[derive(Debug, Default)]
pub struct ProximityMonitor {
    next_handler: u64,
    registration: Option<Registration>,
}

impl ProximityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any current registration. Returns the new handler id and the
    /// cancellation of the previous one, if any.
    pub fn register(
        &mut self,
        threshold: Proximity,
    ) -> (ProximityHandlerId, Option<ProximityEvent>) {
        let cancelled = self.cancel();
        self.next_handler += 1;
        let handler = ProximityHandlerId(self.next_handler);
        self.registration = Some(Registration {
            handler,
            threshold,
            reached: false,
        });
        (handler, cancelled)
    }

    pub fn cancel(&mut self) -> Option<ProximityEvent> {
        self.registration
            .take()
            .map(|registration| ProximityEvent::Cancelled {
                handler: registration.handler,
            })
    }

    pub fn is_current(&self, handler: ProximityHandlerId) -> bool {
        self.registration
            .is_some_and(|registration| registration.handler == handler)
    }

    pub fn threshold(&self) -> Option<Proximity> {
        self.registration.map(|registration| registration.threshold)
    }

    /// Checks the registered threshold; returns `Reached` on the first fix
    /// that satisfies it and nothing afterwards.
    pub fn evaluate(
        &mut self,
        position: LocationCoordinate,
        now_ms: f64,
        destination: Option<LocationCoordinate>,
        estimated_arrival_ms: Option<f64>,
    ) -> Option<ProximityEvent> {
        let registration = self.registration.as_mut()?;
        if registration.reached {
            return None;
        }
        if !is_threshold_reached(
            &registration.threshold,
            position,
            now_ms,
            destination,
            estimated_arrival_ms,
        ) {
            return None;
        }
        registration.reached = true;
        Some(ProximityEvent::Reached {
            handler: registration.handler,
            threshold: registration.threshold,
        })
    }
}
