use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use beacon_core::{Resolution, ResolutionConstraints, Trackable};
use tracing::trace;

use crate::battery::BatteryLevelProvider;
use crate::proximity::{LocationFix, ProximityEvent, ProximityMonitor};

/// Inputs for resolving one trackable.
#[derive(Debug, Clone, Copy)]
pub struct TrackableResolutionRequest<'a> {
    pub trackable: &'a Trackable,
    /// Resolutions currently requested by remote subscribers.
    pub remote_requests: &'a HashSet<Resolution>,
}

/// Policy interface for per-trackable and location-engine resolutions.
///
/// The hooks are invoked by the publisher session on its serial queue.
pub trait ResolutionPolicy: Send {
    fn on_trackable_added(&mut self, _trackable: &Trackable) {}
    fn on_trackable_removed(&mut self, _trackable: &Trackable) {}
    fn on_active_trackable_changed(&mut self, _trackable: Option<&Trackable>) {}
    fn on_subscriber_added(&mut self, _trackable_id: &str, _member_key: &str) {}
    fn on_subscriber_removed(&mut self, _trackable_id: &str, _member_key: &str) {}
    /// Returns true when resolutions must be recomputed.
    fn on_location_fix(&mut self, _fix: &LocationFix) -> bool {
        false
    }

    /// Resolution for one trackable.
    fn resolve_request(&self, request: &TrackableResolutionRequest<'_>) -> Resolution;
    /// Resolution for the location engine serving every trackable.
    fn resolve(&self, resolutions: &HashSet<Resolution>) -> Resolution;
}

/// Default policy: constraint table, subscriber requests, proximity to the
/// active destination, and low-battery interval stretching.
pub struct ResolutionPolicyEngine {
    default_resolution: Resolution,
    battery: Arc<dyn BatteryLevelProvider>,
    subscribers: HashMap<String, HashSet<String>>,
    active: Option<Trackable>,
    proximity: ProximityMonitor,
    near: bool,
}

impl ResolutionPolicyEngine {
    pub fn new(default_resolution: Resolution, battery: Arc<dyn BatteryLevelProvider>) -> Self {
        Self {
            default_resolution,
            battery,
            subscribers: HashMap::new(),
            active: None,
            proximity: ProximityMonitor::new(),
            near: false,
        }
    }

    /// Whether the active trackable has crossed its proximity threshold.
    pub fn is_near(&self) -> bool {
        self.near
    }

    pub fn has_subscriber(&self, trackable_id: &str) -> bool {
        self.subscribers
            .get(trackable_id)
            .is_some_and(|members| !members.is_empty())
    }

    fn is_near_for(&self, trackable: &Trackable) -> bool {
        self.near && self.active.as_ref() == Some(trackable)
    }

    fn adjust_for_battery(
        &self,
        resolution: Resolution,
        constraints: &ResolutionConstraints,
    ) -> Resolution {
        match self.battery.current_percentage() {
            Some(level) if level < constraints.battery_level_threshold => {
                let stretched = (resolution.desired_interval_ms as f64
                    * f64::from(constraints.low_battery_multiplier))
                .round() as u64;
                resolution.with_desired_interval_ms(stretched)
            }
            _ => resolution,
        }
    }

    fn handle_proximity_event(&mut self, event: ProximityEvent) -> bool {
        match event {
            ProximityEvent::Reached { handler, .. } if self.proximity.is_current(handler) => {
                self.near = true;
                true
            }
            ProximityEvent::Reached { .. } => false,
            ProximityEvent::Cancelled { .. } => {
                self.near = false;
                false
            }
        }
    }
}

impl ResolutionPolicy for ResolutionPolicyEngine {
    fn on_trackable_removed(&mut self, trackable: &Trackable) {
        self.subscribers.remove(&trackable.id);
    }

    fn on_active_trackable_changed(&mut self, trackable: Option<&Trackable>) {
        let threshold = trackable
            .and_then(|trackable| trackable.constraints)
            .map(|constraints| constraints.proximity_threshold);
        let cancelled = match threshold {
            Some(threshold) => self.proximity.register(threshold).1,
            None => self.proximity.cancel(),
        };
        if let Some(event) = cancelled {
            self.handle_proximity_event(event);
        }
        self.near = false;
        self.active = trackable.cloned();
    }

    fn on_subscriber_added(&mut self, trackable_id: &str, member_key: &str) {
        self.subscribers
            .entry(trackable_id.to_owned())
            .or_default()
            .insert(member_key.to_owned());
    }

    fn on_subscriber_removed(&mut self, trackable_id: &str, member_key: &str) {
        if let Some(members) = self.subscribers.get_mut(trackable_id) {
            members.remove(member_key);
            if members.is_empty() {
                self.subscribers.remove(trackable_id);
            }
        }
    }

    fn on_location_fix(&mut self, fix: &LocationFix) -> bool {
        let destination = self.active.as_ref().and_then(|trackable| trackable.destination);
        match self.proximity.evaluate(
            fix.position(),
            fix.now_ms,
            destination,
            fix.estimated_arrival_ms,
        ) {
            Some(event) => self.handle_proximity_event(event),
            None => false,
        }
    }

    fn resolve_request(&self, request: &TrackableResolutionRequest<'_>) -> Resolution {
        let trackable = request.trackable;
        let Some(constraints) = trackable.constraints.as_ref() else {
            return Resolution::combine(request.remote_requests).unwrap_or(self.default_resolution);
        };

        let near = self.is_near_for(trackable);
        let has_subscriber = self.has_subscriber(&trackable.id);
        let base = constraints.resolutions.select(near, has_subscriber);
        let merged = Resolution::combine(std::iter::once(&base).chain(request.remote_requests))
            .unwrap_or(base);
        let resolution = self.adjust_for_battery(merged, constraints);
        trace!(
            trackable_id = %trackable.id,
            near,
            has_subscriber,
            ?resolution,
            "resolved trackable resolution"
        );
        resolution
    }

    fn resolve(&self, resolutions: &HashSet<Resolution>) -> Resolution {
        Resolution::combine(resolutions).unwrap_or(self.default_resolution)
    }
}
