use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use beacon_core::{LocationKind, LocationUpdate, PresenceAction, PresenceData, PresenceMessage};
use tokio::sync::oneshot;
use tracing::debug;

use crate::adapter::{
    Transport, TransportError, TransportEvent, TransportEventSink, TransportFuture,
    TransportHealthSnapshot,
};

/// In-process transport for tests and simulations.
///
/// Clones share state, so a test keeps one handle for scripting and
/// inspection while a session owns another.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    inner: Arc<Mutex<InMemoryState>>,
}

#[derive(Default)]
struct InMemoryState {
    sinks: Vec<Arc<dyn TransportEventSink>>,
    joined: HashMap<String, PresenceData>,
    published: Vec<(String, LocationKind, LocationUpdate)>,
    presence_updates: Vec<(String, PresenceData)>,
    scripted_publish_failures: HashMap<String, u32>,
    fail_connect: bool,
    fail_presence_updates: bool,
    hold_publishes: bool,
    held: VecDeque<oneshot::Sender<()>>,
    in_flight: usize,
    max_in_flight: usize,
    publish_attempts: u64,
    next_member: u64,
    closed: bool,
    health: TransportHealthSnapshot,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `count` publishes for `trackable_id` fail.
    pub fn fail_next_publishes(&self, trackable_id: impl Into<String>, count: u32) {
        *self
            .lock()
            .scripted_publish_failures
            .entry(trackable_id.into())
            .or_insert(0) += count;
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    pub fn set_fail_presence_updates(&self, fail: bool) {
        self.lock().fail_presence_updates = fail;
    }

    /// While enabled, publishes stay in flight until released one by one.
    /// Disabling releases everything still held.
    pub fn set_hold_publishes(&self, hold: bool) {
        let released = {
            let mut state = self.lock();
            state.hold_publishes = hold;
            if hold {
                Vec::new()
            } else {
                state.held.drain(..).collect::<Vec<_>>()
            }
        };
        for gate in released {
            let _ = gate.send(());
        }
    }

    /// Lets the oldest held publish complete. Returns false if none is held.
    pub fn release_next_publish(&self) -> bool {
        let gate = self.lock().held.pop_front();
        match gate {
            Some(gate) => {
                let _ = gate.send(());
                true
            }
            None => false,
        }
    }

    pub fn held_publishes(&self) -> usize {
        self.lock().held.len()
    }

    /// Successfully published enhanced updates, in completion order.
    pub fn published(&self) -> Vec<(String, LocationUpdate)> {
        self.published_on(LocationKind::Enhanced)
    }

    /// Successfully published raw updates, in completion order.
    pub fn published_raw(&self) -> Vec<(String, LocationUpdate)> {
        self.published_on(LocationKind::Raw)
    }

    fn published_on(&self, lane: LocationKind) -> Vec<(String, LocationUpdate)> {
        self.lock()
            .published
            .iter()
            .filter(|(_, kind, _)| *kind == lane)
            .map(|(trackable_id, _, update)| (trackable_id.clone(), update.clone()))
            .collect()
    }

    /// Drains successfully published updates of both lanes.
    pub fn take_published(&self) -> Vec<(String, LocationKind, LocationUpdate)> {
        std::mem::take(&mut self.lock().published)
    }

    /// Presence data sent via enter/update, in call order.
    pub fn presence_updates(&self) -> Vec<(String, PresenceData)> {
        self.lock().presence_updates.clone()
    }

    /// Drains recorded presence enter/update calls.
    pub fn take_presence_updates(&self) -> Vec<(String, PresenceData)> {
        std::mem::take(&mut self.lock().presence_updates)
    }

    pub fn publish_attempts(&self) -> u64 {
        self.lock().publish_attempts
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Highest number of publishes observed in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    pub fn is_joined(&self, trackable_id: &str) -> bool {
        self.lock().joined.contains_key(trackable_id)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Pushes an event to every subscribed sink.
    pub fn inject(&self, event: TransportEvent) {
        let sinks = self.lock().sinks.clone();
        for sink in sinks {
            sink.emit(event.clone());
        }
    }
}

/// Replays presence data recorded on `from` into `to` as presence updates
/// made by `member_key`.
pub fn route_presence_updates(
    from: &InMemoryTransport,
    to: &InMemoryTransport,
    member_key: &str,
) -> usize {
    let updates = from.take_presence_updates();
    let moved = updates.len();
    for (trackable_id, data) in updates {
        to.inject(TransportEvent::Presence {
            trackable_id,
            messages: vec![PresenceMessage::new(
                PresenceAction::Update,
                data,
                member_key,
            )],
        });
    }
    moved
}

/// Replays locations published on `from` into `to` as received locations.
pub fn route_published_locations(from: &InMemoryTransport, to: &InMemoryTransport) -> usize {
    let published = from.take_published();
    let moved = published.len();
    for (trackable_id, kind, update) in published {
        to.inject(TransportEvent::Location {
            trackable_id,
            kind,
            update,
        });
    }
    moved
}

impl Transport for InMemoryTransport {
    fn connect(
        &self,
        trackable_id: &str,
        presence: PresenceData,
        use_rewind: bool,
    ) -> TransportFuture<String> {
        let mut state = self.lock();
        state.health.connect_attempts += 1;
        let result = if state.closed {
            Err(TransportError::Closed)
        } else if state.fail_connect {
            let err = TransportError::Connection(format!("scripted failure for {trackable_id}"));
            state.health.last_error = Some(err.to_string());
            Err(err)
        } else {
            state.next_member += 1;
            state.joined.insert(trackable_id.to_owned(), presence);
            debug!(trackable_id, use_rewind, "in-memory transport: joined channel");
            Ok(format!("member-{}", state.next_member))
        };
        Box::pin(async move { result })
    }

    fn disconnect(&self, trackable_id: &str, _presence: PresenceData) -> TransportFuture<bool> {
        let was_joined = self.lock().joined.remove(trackable_id).is_some();
        Box::pin(async move { Ok(was_joined) })
    }

    fn publish(
        &self,
        trackable_id: &str,
        kind: LocationKind,
        update: LocationUpdate,
    ) -> TransportFuture<()> {
        let inner = Arc::clone(&self.inner);
        let trackable_id = trackable_id.to_owned();
        let gate = {
            let mut state = self.lock();
            if state.closed {
                return Box::pin(async { Err(TransportError::Closed) });
            }
            state.publish_attempts += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            if state.hold_publishes {
                let (tx, rx) = oneshot::channel();
                state.held.push_back(tx);
                Some(rx)
            } else {
                None
            }
        };

        Box::pin(async move {
            if let Some(gate) = gate {
                // A dropped sender also counts as released.
                let _ = gate.await;
            }
            let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
            let state = &mut *guard;
            state.in_flight -= 1;
            let scripted = state
                .scripted_publish_failures
                .get_mut(&trackable_id)
                .filter(|remaining| **remaining > 0);
            if let Some(remaining) = scripted {
                *remaining -= 1;
                let err = TransportError::Publish(format!("scripted failure for {trackable_id}"));
                state.health.publish_err += 1;
                state.health.last_error = Some(err.to_string());
                return Err(err);
            }
            state.health.publish_ok += 1;
            state.published.push((trackable_id, kind, update));
            Ok(())
        })
    }

    fn enter_presence(&self, trackable_id: &str, presence: PresenceData) -> TransportFuture<()> {
        self.update_presence(trackable_id, presence)
    }

    fn update_presence(&self, trackable_id: &str, presence: PresenceData) -> TransportFuture<()> {
        let mut state = self.lock();
        let result = if state.closed {
            Err(TransportError::Closed)
        } else if state.fail_presence_updates {
            let err = TransportError::Presence(format!("scripted failure for {trackable_id}"));
            state.health.last_error = Some(err.to_string());
            Err(err)
        } else {
            state.health.presence_updates += 1;
            state
                .presence_updates
                .push((trackable_id.to_owned(), presence));
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn leave_presence(&self, trackable_id: &str, _presence: PresenceData) -> TransportFuture<()> {
        self.lock().joined.remove(trackable_id);
        Box::pin(async { Ok(()) })
    }

    fn close(&self, _presence: PresenceData) -> TransportFuture<()> {
        let mut state = self.lock();
        state.closed = true;
        state.joined.clear();
        Box::pin(async { Ok(()) })
    }

    fn subscribe_events(&self, sink: Arc<dyn TransportEventSink>) {
        self.lock().sinks.push(sink);
    }

    fn health_snapshot(&self) -> TransportHealthSnapshot {
        self.lock().health.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use beacon_core::{
        ConnectionState, Location, LocationCoordinate, LocationKind, LocationUpdate, PresenceData,
    };

    use super::{route_published_locations, InMemoryTransport};
    use crate::adapter::{Transport, TransportError, TransportEvent, TransportEventSink};

    fn update(ts: f64) -> LocationUpdate {
        LocationUpdate::new(Location::new(LocationCoordinate::new(1.0, 2.0), ts))
    }

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<TransportEvent>>);

    impl TransportEventSink for CollectingSink {
        fn emit(&self, event: TransportEvent) {
            self.0.lock().expect("sink lock").push(event);
        }
    }

    #[tokio::test]
    async fn scripted_failures_apply_per_trackable() {
        let transport = InMemoryTransport::new();
        transport.fail_next_publishes("a", 1);

        let first = transport.publish("a", LocationKind::Enhanced, update(1.0)).await;
        assert_eq!(
            first,
            Err(TransportError::Publish("scripted failure for a".into()))
        );
        transport
            .publish("a", LocationKind::Enhanced, update(2.0))
            .await
            .expect("second publish succeeds");
        transport
            .publish("b", LocationKind::Enhanced, update(3.0))
            .await
            .expect("other trackable unaffected");

        let health = transport.health_snapshot();
        assert_eq!(health.publish_ok, 2);
        assert_eq!(health.publish_err, 1);
        assert_eq!(transport.published().len(), 2);
    }

    #[tokio::test]
    async fn held_publishes_complete_on_release() {
        let transport = InMemoryTransport::new();
        transport.set_hold_publishes(true);
        let pending = tokio::spawn(transport.publish("a", LocationKind::Enhanced, update(1.0)));
        tokio::task::yield_now().await;

        assert_eq!(transport.in_flight(), 1);
        assert_eq!(transport.held_publishes(), 1);
        assert!(transport.release_next_publish());
        pending.await.expect("join").expect("publish");
        assert_eq!(transport.in_flight(), 0);
        assert_eq!(transport.max_in_flight(), 1);
        assert!(!transport.release_next_publish());
    }

    #[tokio::test]
    async fn connect_assigns_distinct_member_keys() {
        let transport = InMemoryTransport::new();
        let a = transport
            .connect("a", PresenceData::publisher(None), false)
            .await
            .expect("connect a");
        let b = transport
            .connect("b", PresenceData::publisher(None), false)
            .await
            .expect("connect b");
        assert_ne!(a, b);
        assert!(transport.is_joined("a"));
        assert!(transport
            .disconnect("a", PresenceData::publisher(None))
            .await
            .expect("disconnect"));
        assert!(!transport.is_joined("a"));
    }

    #[tokio::test]
    async fn closed_transport_rejects_work() {
        let transport = InMemoryTransport::new();
        transport.close(PresenceData::publisher(None)).await.expect("close");
        assert_eq!(
            transport.publish("a", LocationKind::Enhanced, update(1.0)).await,
            Err(TransportError::Closed)
        );
        assert!(transport.is_closed());
    }

    #[test]
    fn injected_events_reach_every_sink() {
        let transport = InMemoryTransport::new();
        let first = Arc::new(CollectingSink::default());
        let second = Arc::new(CollectingSink::default());
        transport.subscribe_events(first.clone());
        transport.subscribe_events(second.clone());

        transport.inject(TransportEvent::ConnectionStateChanged(ConnectionState::Online));
        assert_eq!(first.0.lock().expect("lock").len(), 1);
        assert_eq!(second.0.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn lanes_are_recorded_and_routed_with_their_kind() {
        let publisher_side = InMemoryTransport::new();
        let subscriber_side = InMemoryTransport::new();
        let sink = Arc::new(CollectingSink::default());
        subscriber_side.subscribe_events(sink.clone());

        publisher_side
            .publish("a", LocationKind::Raw, update(1.0))
            .await
            .expect("raw publish");
        publisher_side
            .publish("a", LocationKind::Enhanced, update(2.0))
            .await
            .expect("enhanced publish");
        assert_eq!(publisher_side.published(), vec![("a".to_owned(), update(2.0))]);
        assert_eq!(publisher_side.published_raw(), vec![("a".to_owned(), update(1.0))]);

        assert_eq!(route_published_locations(&publisher_side, &subscriber_side), 2);
        let kinds: Vec<LocationKind> = sink
            .0
            .lock()
            .expect("lock")
            .iter()
            .filter_map(|event| match event {
                TransportEvent::Location { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![LocationKind::Raw, LocationKind::Enhanced]);
        assert!(publisher_side.published().is_empty());
    }
}
