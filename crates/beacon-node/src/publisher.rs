use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use beacon_core::{
    LocationKind, LocationUpdate, PresenceData, PresenceMessage, PresenceRole, Resolution,
    Trackable,
};
use beacon_transport::{Transport, TransportError, TransportEvent};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::config::PublisherConfig;
use crate::delivery::{should_send_location, DeliveryState, FailureOutcome};
use crate::error::SessionError;
use crate::listener::{CallbackDispatcher, EventListener, ListenerId, PublisherEvent};
use crate::policy::{ResolutionPolicy, TrackableResolutionRequest};
use crate::proximity::LocationFix;
use crate::queue::{spawn_completion, QueueSink};
use crate::state::{PublisherState, SessionLifecycle};

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum PublisherMessage {
    Add {
        trackable: Trackable,
        activate: bool,
        reply: Reply<()>,
    },
    Remove {
        trackable_id: String,
        reply: Reply<bool>,
    },
    LocationFix(LocationFix),
    RawLocationFix(LocationUpdate),
    RefreshResolutions,
    ResolutionOf {
        trackable_id: String,
        reply: oneshot::Sender<Option<Resolution>>,
    },
    Stop {
        reply: Reply<()>,
    },
    ConnectCompleted {
        trackable_id: String,
        result: Result<String, TransportError>,
    },
    DisconnectCompleted {
        trackable_id: String,
        result: Result<bool, TransportError>,
        reply: Reply<bool>,
    },
    PublishCompleted {
        trackable_id: String,
        kind: LocationKind,
        send: u64,
        update: LocationUpdate,
        result: Result<(), TransportError>,
    },
    PresenceUpdateCompleted {
        trackable_id: String,
        result: Result<(), TransportError>,
    },
    CloseCompleted {
        result: Result<(), TransportError>,
    },
    Transport(TransportEvent),
}

/// Cloneable handle to a running publisher session.
#[derive(Clone)]
pub struct PublisherHandle {
    queue: UnboundedSender<PublisherMessage>,
    listeners: CallbackDispatcher<PublisherEvent>,
}

/// Starts a publisher session on the current tokio runtime.
///
/// The session runs until every handle is dropped. All state changes happen
/// on its task, one message at a time.
pub fn spawn_publisher(
    config: PublisherConfig,
    transport: Arc<dyn Transport>,
    policy: Box<dyn ResolutionPolicy>,
) -> PublisherHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let listeners = CallbackDispatcher::spawn();
    transport.subscribe_events(Arc::new(QueueSink::new(
        tx.downgrade(),
        PublisherMessage::Transport,
    )));

    let session = PublisherSession {
        delivery: DeliveryState::new(config.delivery),
        raw_delivery: DeliveryState::new(config.delivery),
        config,
        transport,
        policy,
        state: PublisherState::default(),
        connecting: HashMap::new(),
        stop_waiters: Vec::new(),
        listeners: listeners.clone(),
        queue: tx.downgrade(),
    };
    tokio::spawn(session.run(rx));

    PublisherHandle {
        queue: tx,
        listeners,
    }
}

impl PublisherHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PublisherMessage,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.queue
            .send(build(reply))
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }

    /// Joins the trackable's channel without making it active.
    pub async fn add(&self, trackable: Trackable) -> Result<(), SessionError> {
        self.request(|reply| PublisherMessage::Add {
            trackable,
            activate: false,
            reply,
        })
        .await?
    }

    /// Adds the trackable if needed and makes it the active one.
    pub async fn track(&self, trackable: Trackable) -> Result<(), SessionError> {
        self.request(|reply| PublisherMessage::Add {
            trackable,
            activate: true,
            reply,
        })
        .await?
    }

    /// Leaves the trackable's channel. Returns false if it was not added.
    pub async fn remove(&self, trackable_id: impl Into<String>) -> Result<bool, SessionError> {
        let trackable_id = trackable_id.into();
        self.request(|reply| PublisherMessage::Remove {
            trackable_id,
            reply,
        })
        .await?
    }

    /// Feeds a new position fix to every added trackable.
    pub fn location_fix(&self, fix: LocationFix) -> Result<(), SessionError> {
        self.queue
            .send(PublisherMessage::LocationFix(fix))
            .map_err(|_| SessionError::Closed)
    }

    /// Feeds an unprocessed fix to the raw lane of every added trackable.
    /// Ignored unless raw locations are enabled.
    pub fn raw_location_fix(&self, update: LocationUpdate) -> Result<(), SessionError> {
        self.queue
            .send(PublisherMessage::RawLocationFix(update))
            .map_err(|_| SessionError::Closed)
    }

    pub fn refresh_resolutions(&self) -> Result<(), SessionError> {
        self.queue
            .send(PublisherMessage::RefreshResolutions)
            .map_err(|_| SessionError::Closed)
    }

    pub async fn resolution_of(
        &self,
        trackable_id: impl Into<String>,
    ) -> Result<Option<Resolution>, SessionError> {
        let trackable_id = trackable_id.into();
        self.request(|reply| PublisherMessage::ResolutionOf {
            trackable_id,
            reply,
        })
        .await
    }

    pub fn register_listener(
        &self,
        listener: impl EventListener<PublisherEvent> + 'static,
    ) -> ListenerId {
        self.listeners.register(listener)
    }

    pub fn unregister_listener(&self, id: ListenerId) {
        self.listeners.unregister(id);
    }

    /// Closes the transport and releases all delivery state. Stopping an
    /// already stopped session succeeds.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.request(|reply| PublisherMessage::Stop { reply }).await?
    }
}

struct PendingConnect {
    trackable: Trackable,
    activate: bool,
    waiters: Vec<Reply<()>>,
}

struct PublisherSession {
    config: PublisherConfig,
    transport: Arc<dyn Transport>,
    policy: Box<dyn ResolutionPolicy>,
    state: PublisherState,
    delivery: DeliveryState<LocationUpdate>,
    raw_delivery: DeliveryState<LocationUpdate>,
    connecting: HashMap<String, PendingConnect>,
    stop_waiters: Vec<Reply<()>>,
    listeners: CallbackDispatcher<PublisherEvent>,
    queue: WeakUnboundedSender<PublisherMessage>,
}

impl PublisherSession {
    async fn run(mut self, mut rx: UnboundedReceiver<PublisherMessage>) {
        while let Some(message) = rx.recv().await {
            if self.state.is_working() {
                self.handle(message);
            } else {
                self.handle_when_stopped(message);
            }
        }
        debug!("publisher session: all handles dropped");
    }

    fn emit(&self, event: PublisherEvent) {
        self.listeners.dispatch(event);
    }

    fn lane(&self, kind: LocationKind) -> &DeliveryState<LocationUpdate> {
        match kind {
            LocationKind::Enhanced => &self.delivery,
            LocationKind::Raw => &self.raw_delivery,
        }
    }

    fn lane_mut(&mut self, kind: LocationKind) -> &mut DeliveryState<LocationUpdate> {
        match kind {
            LocationKind::Enhanced => &mut self.delivery,
            LocationKind::Raw => &mut self.raw_delivery,
        }
    }

    fn presence(&self, resolution: Option<Resolution>) -> PresenceData {
        PresenceData::publisher(resolution).with_raw_locations(self.config.raw_locations_enabled)
    }

    fn handle(&mut self, message: PublisherMessage) {
        match message {
            PublisherMessage::Add {
                trackable,
                activate,
                reply,
            } => self.add(trackable, activate, reply),
            PublisherMessage::Remove {
                trackable_id,
                reply,
            } => self.remove(trackable_id, reply),
            PublisherMessage::LocationFix(fix) => self.on_location_fix(fix),
            PublisherMessage::RawLocationFix(update) => self.on_raw_location_fix(update),
            PublisherMessage::RefreshResolutions => self.refresh_all_resolutions(),
            PublisherMessage::ResolutionOf {
                trackable_id,
                reply,
            } => {
                let _ = reply.send(self.state.resolutions.get(&trackable_id).copied());
            }
            PublisherMessage::Stop { reply } => self.begin_stop(reply),
            PublisherMessage::ConnectCompleted {
                trackable_id,
                result,
            } => self.on_connect_completed(trackable_id, result),
            PublisherMessage::DisconnectCompleted {
                trackable_id,
                result,
                reply,
            } => match result {
                Ok(_) => {
                    // Only the first of several concurrent removes forgets it.
                    let removed = self.forget_trackable(&trackable_id);
                    if removed {
                        info!(trackable_id = %trackable_id, "publisher: trackable removed");
                    }
                    let _ = reply.send(Ok(removed));
                }
                Err(err) => {
                    warn!(
                        trackable_id = %trackable_id,
                        error = %err,
                        "publisher: disconnect failed"
                    );
                    let _ = reply.send(Err(err.into()));
                }
            },
            PublisherMessage::PublishCompleted {
                trackable_id,
                kind,
                send,
                update,
                result,
            } => self.on_publish_completed(trackable_id, kind, send, update, result),
            PublisherMessage::PresenceUpdateCompleted {
                trackable_id,
                result,
            } => {
                if let Err(err) = result {
                    warn!(
                        trackable_id = %trackable_id,
                        error = %err,
                        "publisher: presence update failed"
                    );
                    self.emit(PublisherEvent::Error(err.into()));
                }
            }
            PublisherMessage::CloseCompleted { result } => self.finish_stop(result),
            PublisherMessage::Transport(event) => self.on_transport_event(event),
        }
    }

    fn handle_when_stopped(&mut self, message: PublisherMessage) {
        match message {
            PublisherMessage::Add { reply, .. } => {
                let _ = reply.send(Err(SessionError::Stopped));
            }
            PublisherMessage::Remove { reply, .. }
            | PublisherMessage::DisconnectCompleted { reply, .. } => {
                let _ = reply.send(Err(SessionError::Stopped));
            }
            PublisherMessage::ResolutionOf { reply, .. } => {
                let _ = reply.send(None);
            }
            PublisherMessage::Stop { reply } => {
                if self.state.lifecycle == SessionLifecycle::Stopping {
                    self.stop_waiters.push(reply);
                } else {
                    let _ = reply.send(Ok(()));
                }
            }
            PublisherMessage::CloseCompleted { result } => self.finish_stop(result),
            _ => trace!("publisher: dropping message after stop"),
        }
    }

    fn add(&mut self, trackable: Trackable, activate: bool, reply: Reply<()>) {
        if let Some(existing) = self.state.trackables.get(&trackable.id) {
            if activate {
                let existing = existing.clone();
                self.set_active(Some(existing));
                let _ = reply.send(Ok(()));
            } else {
                let _ = reply.send(Err(SessionError::TrackableAlreadyExists(trackable.id)));
            }
            return;
        }

        if let Some(pending) = self.connecting.get_mut(&trackable.id) {
            debug!(trackable_id = %trackable.id, "publisher: joining in-progress connect");
            pending.activate |= activate;
            pending.waiters.push(reply);
            return;
        }

        let trackable_id = trackable.id.clone();
        let future = self
            .transport
            .connect(&trackable_id, self.presence(None), false);
        let completed_id = trackable_id.clone();
        spawn_completion(&self.queue, future, move |result| {
            PublisherMessage::ConnectCompleted {
                trackable_id: completed_id,
                result,
            }
        });
        self.connecting.insert(
            trackable_id,
            PendingConnect {
                trackable,
                activate,
                waiters: vec![reply],
            },
        );
    }

    fn on_connect_completed(
        &mut self,
        trackable_id: String,
        result: Result<String, TransportError>,
    ) {
        let Some(pending) = self.connecting.remove(&trackable_id) else {
            return;
        };
        let outcome = match result {
            Ok(_member_key) => {
                info!(trackable_id = %trackable_id, "publisher: trackable added");
                self.state
                    .trackables
                    .insert(trackable_id.clone(), pending.trackable.clone());
                self.policy.on_trackable_added(&pending.trackable);
                if pending.activate {
                    self.set_active(Some(pending.trackable));
                } else {
                    self.resolve_trackable(&trackable_id);
                    self.refresh_location_engine_resolution();
                }
                Ok(())
            }
            Err(err) => {
                warn!(trackable_id = %trackable_id, error = %err, "publisher: connect failed");
                Err(SessionError::from(err))
            }
        };
        for waiter in pending.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn remove(&mut self, trackable_id: String, reply: Reply<bool>) {
        if !self.state.trackables.contains_key(&trackable_id) {
            let _ = reply.send(Ok(false));
            return;
        }
        let presence = self.presence(self.state.resolutions.get(&trackable_id).copied());
        let future = self.transport.disconnect(&trackable_id, presence);
        spawn_completion(&self.queue, future, move |result| {
            PublisherMessage::DisconnectCompleted {
                trackable_id,
                result,
                reply,
            }
        });
    }

    /// Returns false if the trackable was already gone.
    fn forget_trackable(&mut self, trackable_id: &str) -> bool {
        let was_active = self.state.active_trackable.as_deref() == Some(trackable_id);
        let Some(trackable) = self.state.forget(trackable_id) else {
            return false;
        };
        for member_key in self
            .state
            .subscribers
            .remove(trackable_id)
            .unwrap_or_default()
            .into_keys()
        {
            self.policy.on_subscriber_removed(trackable_id, &member_key);
        }
        self.policy.on_trackable_removed(&trackable);
        self.delivery.remove(trackable_id);
        self.raw_delivery.remove(trackable_id);
        if was_active {
            self.policy.on_active_trackable_changed(None);
        }
        self.refresh_location_engine_resolution();
        true
    }

    fn set_active(&mut self, trackable: Option<Trackable>) {
        self.state.active_trackable = trackable.as_ref().map(|trackable| trackable.id.clone());
        self.policy.on_active_trackable_changed(trackable.as_ref());
        self.refresh_all_resolutions();
    }

    fn on_location_fix(&mut self, fix: LocationFix) {
        if self.policy.on_location_fix(&fix) {
            debug!("publisher: proximity threshold reached");
            self.refresh_all_resolutions();
        }
        self.offer_to_all(LocationKind::Enhanced, fix.update);
    }

    fn on_raw_location_fix(&mut self, update: LocationUpdate) {
        if !self.config.raw_locations_enabled {
            trace!("publisher: raw locations disabled, dropping fix");
            return;
        }
        self.offer_to_all(LocationKind::Raw, update);
    }

    fn offer_to_all(&mut self, kind: LocationKind, update: LocationUpdate) {
        let trackable_ids: Vec<String> = self.state.trackables.keys().cloned().collect();
        for trackable_id in trackable_ids {
            self.offer_update(&trackable_id, kind, update.clone());
        }
    }

    /// Sends now, queues behind the in-flight send, or records as skipped
    /// when the resolution does not call for a new location yet. Each lane
    /// throttles against its own last sent location.
    fn offer_update(
        &mut self,
        trackable_id: &str,
        kind: LocationKind,
        mut update: LocationUpdate,
    ) {
        update.skipped_locations.clear();
        if self.lane(kind).has_pending(trackable_id) {
            self.lane_mut(kind).enqueue_waiting(trackable_id, update);
            return;
        }
        if !should_send_location(
            &update.location,
            self.state.last_sent_on(kind).get(trackable_id),
            self.state.resolutions.get(trackable_id),
        ) {
            trace!(trackable_id, ?kind, "publisher: location throttled");
            self.lane_mut(kind).record_skipped(trackable_id, update);
            return;
        }
        self.transmit(trackable_id, kind, update);
    }

    fn transmit(&mut self, trackable_id: &str, kind: LocationKind, mut update: LocationUpdate) {
        update.skipped_locations = self
            .lane(kind)
            .list_skipped(trackable_id)
            .iter()
            .map(|skipped| skipped.location.clone())
            .collect();
        self.state
            .last_sent_on_mut(kind)
            .insert(trackable_id.to_owned(), update.location.clone());
        let send = self.lane_mut(kind).mark_pending(trackable_id);

        let future = self.transport.publish(trackable_id, kind, update.clone());
        let trackable_id = trackable_id.to_owned();
        spawn_completion(&self.queue, future, move |result| {
            PublisherMessage::PublishCompleted {
                trackable_id,
                kind,
                send,
                update,
                result,
            }
        });
    }

    fn on_publish_completed(
        &mut self,
        trackable_id: String,
        kind: LocationKind,
        send: u64,
        mut update: LocationUpdate,
        result: Result<(), TransportError>,
    ) {
        // Removal drops the lane entry; a re-added trackable gets new tokens.
        if !self.lane(kind).is_in_flight(&trackable_id, send) {
            trace!(trackable_id = %trackable_id, send, "publisher: stale send completion");
            return;
        }
        match result {
            Ok(()) => {
                let skipped_locations = update.skipped_locations.len();
                let next = self.lane_mut(kind).complete_success(&trackable_id);
                match kind {
                    LocationKind::Enhanced => {
                        self.state.delivered.insert(trackable_id.clone());
                        self.emit(PublisherEvent::DeliverySucceeded {
                            trackable_id: trackable_id.clone(),
                            skipped_locations,
                        });
                        self.refresh_trackable_state(&trackable_id);
                    }
                    LocationKind::Raw => {
                        trace!(trackable_id = %trackable_id, "publisher: raw location sent");
                    }
                }
                self.offer_waiting(&trackable_id, kind, next);
            }
            Err(err) => {
                // The attached list still lives in the skipped buffer.
                update.skipped_locations.clear();
                match self.lane_mut(kind).complete_failure(&trackable_id, update) {
                    FailureOutcome::Retry { update, attempt } => {
                        debug!(
                            trackable_id = %trackable_id,
                            ?kind,
                            attempt,
                            error = %err,
                            "publisher: retrying send"
                        );
                        self.transmit(&trackable_id, kind, update);
                    }
                    FailureOutcome::Exhausted { attempts, next } => {
                        warn!(
                            trackable_id = %trackable_id,
                            ?kind,
                            attempts,
                            error = %err,
                            "publisher: send failed"
                        );
                        if kind == LocationKind::Enhanced {
                            self.emit(PublisherEvent::DeliveryFailed {
                                trackable_id: trackable_id.clone(),
                                attempts,
                                error: err,
                            });
                        }
                        self.offer_waiting(&trackable_id, kind, next);
                    }
                }
            }
        }
    }

    /// Offers queued updates until one is in flight again. Throttled ones
    /// land in the skipped buffer instead of stalling the queue.
    fn offer_waiting(
        &mut self,
        trackable_id: &str,
        kind: LocationKind,
        mut next: Option<LocationUpdate>,
    ) {
        while let Some(update) = next.take() {
            self.offer_update(trackable_id, kind, update);
            if self.lane(kind).has_pending(trackable_id) {
                break;
            }
            next = self.lane_mut(kind).dequeue_next_waiting(trackable_id);
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionStateChanged(state) => {
                self.state.client_state = state;
                let trackable_ids: Vec<String> = self.state.trackables.keys().cloned().collect();
                for trackable_id in trackable_ids {
                    self.refresh_trackable_state(&trackable_id);
                }
            }
            TransportEvent::ChannelStateChanged {
                trackable_id,
                state,
            } => {
                if self.state.trackables.contains_key(&trackable_id) {
                    self.state.channel_states.insert(trackable_id.clone(), state);
                    self.refresh_trackable_state(&trackable_id);
                }
            }
            TransportEvent::Presence {
                trackable_id,
                messages,
            } => {
                if !self.state.trackables.contains_key(&trackable_id) {
                    return;
                }
                for message in messages
                    .iter()
                    .filter(|message| message.data.role == PresenceRole::Subscriber)
                {
                    self.apply_subscriber_presence(&trackable_id, message);
                }
                self.resolve_trackable(&trackable_id);
                self.refresh_location_engine_resolution();
            }
            TransportEvent::Location { .. } => {}
        }
    }

    fn apply_subscriber_presence(&mut self, trackable_id: &str, message: &PresenceMessage) {
        let members = self
            .state
            .subscribers
            .entry(trackable_id.to_owned())
            .or_default();
        match message.action.membership() {
            Some(true) => {
                let is_new = members
                    .insert(message.member_key.clone(), message.data.resolution)
                    .is_none();
                if is_new {
                    debug!(
                        trackable_id,
                        member_key = %message.member_key,
                        "publisher: subscriber joined"
                    );
                    self.policy
                        .on_subscriber_added(trackable_id, &message.member_key);
                }
            }
            Some(false) => {
                if members.remove(&message.member_key).is_some() {
                    debug!(
                        trackable_id,
                        member_key = %message.member_key,
                        "publisher: subscriber left"
                    );
                    self.policy
                        .on_subscriber_removed(trackable_id, &message.member_key);
                }
            }
            None => {}
        }
    }

    fn refresh_trackable_state(&mut self, trackable_id: &str) {
        if let Some(state) = self.state.refresh_trackable_state(trackable_id) {
            self.emit(PublisherEvent::TrackableStateChanged {
                trackable_id: trackable_id.to_owned(),
                state,
            });
        }
    }

    fn refresh_all_resolutions(&mut self) {
        let trackable_ids: Vec<String> = self.state.trackables.keys().cloned().collect();
        for trackable_id in trackable_ids {
            self.resolve_trackable(&trackable_id);
        }
        self.refresh_location_engine_resolution();
    }

    fn resolve_trackable(&mut self, trackable_id: &str) {
        let Some(trackable) = self.state.trackables.get(trackable_id) else {
            return;
        };
        let remote_requests = self.state.remote_requests(trackable_id);
        let resolution = self.policy.resolve_request(&TrackableResolutionRequest {
            trackable,
            remote_requests: &remote_requests,
        });
        let previous = self
            .state
            .resolutions
            .insert(trackable_id.to_owned(), resolution);
        if previous == Some(resolution) {
            return;
        }

        debug!(trackable_id, ?resolution, "publisher: trackable resolution changed");
        self.emit(PublisherEvent::TrackableResolutionChanged {
            trackable_id: trackable_id.to_owned(),
            resolution,
        });
        if self.config.send_resolution_enabled {
            let future = self
                .transport
                .update_presence(trackable_id, self.presence(Some(resolution)));
            let trackable_id = trackable_id.to_owned();
            spawn_completion(&self.queue, future, move |result| {
                PublisherMessage::PresenceUpdateCompleted {
                    trackable_id,
                    result,
                }
            });
        }
    }

    fn refresh_location_engine_resolution(&mut self) {
        let resolution = match self.config.constant_location_engine_resolution {
            Some(constant) => constant,
            None => {
                let all: HashSet<Resolution> = self.state.resolutions.values().copied().collect();
                self.policy.resolve(&all)
            }
        };
        if self.state.location_engine_resolution != Some(resolution) {
            self.state.location_engine_resolution = Some(resolution);
            self.emit(PublisherEvent::ResolutionChanged(resolution));
        }
    }

    fn begin_stop(&mut self, reply: Reply<()>) {
        info!("publisher: stopping");
        self.state.lifecycle = SessionLifecycle::Stopping;
        for (_, pending) in self.connecting.drain() {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(SessionError::Stopped));
            }
        }
        self.stop_waiters.push(reply);
        let future = self.transport.close(self.presence(None));
        spawn_completion(&self.queue, future, |result| PublisherMessage::CloseCompleted {
            result,
        });
    }

    fn finish_stop(&mut self, result: Result<(), TransportError>) {
        if self.state.lifecycle != SessionLifecycle::Stopping {
            return;
        }
        if let Err(err) = &result {
            warn!(error = %err, "publisher: transport close failed");
        }
        self.delivery.remove_all();
        self.raw_delivery.remove_all();
        if self.state.active_trackable.is_some() {
            self.policy.on_active_trackable_changed(None);
        }
        self.state = PublisherState {
            lifecycle: SessionLifecycle::Stopped,
            ..PublisherState::default()
        };
        info!("publisher: stopped");

        let outcome = result.map_err(SessionError::from);
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use beacon_core::{
        Accuracy, ConnectionState, Location, LocationCoordinate, LocationUpdate, PresenceAction,
        PresenceData, PresenceMessage, Resolution, Trackable, TrackableState,
    };
    use beacon_transport::{InMemoryTransport, Transport, TransportEvent};
    use tokio::sync::mpsc;

    use super::{spawn_publisher, PublisherHandle};
    use crate::battery::NoBatteryLevel;
    use crate::config::PublisherConfig;
    use crate::error::SessionError;
    use crate::listener::PublisherEvent;
    use crate::policy::ResolutionPolicyEngine;
    use crate::proximity::LocationFix;

    const DEFAULT: Resolution = Resolution::new(Accuracy::Balanced, 1_000, 10.0);

    type Events = mpsc::UnboundedReceiver<PublisherEvent>;

    fn start(transport: &InMemoryTransport) -> (PublisherHandle, Events) {
        start_with(PublisherConfig::new(DEFAULT), transport)
    }

    fn start_with(
        config: PublisherConfig,
        transport: &InMemoryTransport,
    ) -> (PublisherHandle, Events) {
        let handle = spawn_publisher(
            config,
            Arc::new(transport.clone()),
            Box::new(ResolutionPolicyEngine::new(DEFAULT, Arc::new(NoBatteryLevel))),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        handle.register_listener(move |event: PublisherEvent| {
            let _ = tx.send(event);
        });
        (handle, rx)
    }

    fn fix(timestamp_ms: f64) -> LocationFix {
        let location = Location::new(LocationCoordinate::new(51.5, -0.12), timestamp_ms);
        LocationFix::new(LocationUpdate::new(location), timestamp_ms)
    }

    async fn next_matching(
        events: &mut Events,
        matches: impl Fn(&PublisherEvent) -> bool,
    ) -> PublisherEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.expect("event stream open");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event in time")
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition reached in time");
    }

    fn is_delivery(event: &PublisherEvent) -> bool {
        matches!(event, PublisherEvent::DeliverySucceeded { .. })
    }

    #[tokio::test]
    async fn add_resolves_default_and_publishes_presence() {
        let transport = InMemoryTransport::new();
        let (publisher, mut events) = start(&transport);

        publisher.add(Trackable::new("parcel")).await.expect("add");
        assert!(transport.is_joined("parcel"));
        assert_eq!(publisher.resolution_of("parcel").await.expect("query"), Some(DEFAULT));

        let event =
            next_matching(&mut events, |e| matches!(e, PublisherEvent::ResolutionChanged(_))).await;
        assert_eq!(event, PublisherEvent::ResolutionChanged(DEFAULT));
        assert!(transport
            .presence_updates()
            .contains(&("parcel".to_owned(), PresenceData::publisher(Some(DEFAULT)))));
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected_but_track_activates() {
        let transport = InMemoryTransport::new();
        let (publisher, _events) = start(&transport);

        publisher.add(Trackable::new("parcel")).await.expect("add");
        assert_eq!(
            publisher.add(Trackable::new("parcel")).await,
            Err(SessionError::TrackableAlreadyExists("parcel".into()))
        );
        publisher.track(Trackable::new("parcel")).await.expect("track existing");
    }

    #[tokio::test]
    async fn concurrent_adds_share_one_connect() {
        let transport = InMemoryTransport::new();
        let (publisher, _events) = start(&transport);

        let (first, second) = tokio::join!(
            publisher.add(Trackable::new("parcel")),
            publisher.track(Trackable::new("parcel"))
        );
        first.expect("first add");
        second.expect("second add");
        assert_eq!(transport.health_snapshot().connect_attempts, 1);
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let transport = InMemoryTransport::new();
        transport.set_fail_connect(true);
        let (publisher, _events) = start(&transport);

        let err = publisher.add(Trackable::new("parcel")).await.expect_err("connect fails");
        assert!(matches!(err, SessionError::Transport(_)));
        assert_eq!(publisher.resolution_of("parcel").await.expect("query"), None);
    }

    #[tokio::test]
    async fn subscriber_request_raises_resolution() {
        let transport = InMemoryTransport::new();
        let (publisher, mut events) = start(&transport);
        publisher.add(Trackable::new("parcel")).await.expect("add");

        let wanted = Resolution::new(Accuracy::Maximum, 250, 1.0);
        transport.inject(TransportEvent::Presence {
            trackable_id: "parcel".into(),
            messages: vec![PresenceMessage::new(
                PresenceAction::Enter,
                PresenceData::subscriber(Some(wanted)),
                "sub-1",
            )],
        });

        let raised = PublisherEvent::TrackableResolutionChanged {
            trackable_id: "parcel".into(),
            resolution: wanted,
        };
        assert_eq!(next_matching(&mut events, |e| *e == raised).await, raised);
        assert_eq!(publisher.resolution_of("parcel").await.expect("query"), Some(wanted));

        transport.inject(TransportEvent::Presence {
            trackable_id: "parcel".into(),
            messages: vec![PresenceMessage::new(
                PresenceAction::Leave,
                PresenceData::subscriber(None),
                "sub-1",
            )],
        });
        next_matching(&mut events, |e| {
            *e == PublisherEvent::TrackableResolutionChanged {
                trackable_id: "parcel".into(),
                resolution: DEFAULT,
            }
        })
        .await;
    }

    #[tokio::test]
    async fn trackable_state_follows_channel_and_first_delivery() {
        let transport = InMemoryTransport::new();
        let (publisher, mut events) = start(&transport);
        publisher.add(Trackable::new("parcel")).await.expect("add");

        transport.inject(TransportEvent::ConnectionStateChanged(ConnectionState::Online));
        transport.inject(TransportEvent::ChannelStateChanged {
            trackable_id: "parcel".into(),
            state: ConnectionState::Online,
        });
        publisher.location_fix(fix(1_000.0)).expect("fix");

        let event = next_matching(&mut events, |e| {
            matches!(e, PublisherEvent::TrackableStateChanged { .. })
        })
        .await;
        assert_eq!(
            event,
            PublisherEvent::TrackableStateChanged {
                trackable_id: "parcel".into(),
                state: TrackableState::Online,
            }
        );
    }

    #[tokio::test]
    async fn remove_releases_trackable() {
        let transport = InMemoryTransport::new();
        let (publisher, _events) = start(&transport);
        publisher.add(Trackable::new("parcel")).await.expect("add");

        assert!(publisher.remove("parcel").await.expect("remove"));
        assert!(!transport.is_joined("parcel"));
        assert!(!publisher.remove("parcel").await.expect("second remove"));
        assert_eq!(publisher.resolution_of("parcel").await.expect("query"), None);
    }

    #[tokio::test]
    async fn concurrent_removes_report_a_single_removal() {
        let transport = InMemoryTransport::new();
        let (publisher, _events) = start(&transport);
        publisher.add(Trackable::new("parcel")).await.expect("add");

        let (first, second) = tokio::join!(publisher.remove("parcel"), publisher.remove("parcel"));
        let removed = [first.expect("first remove"), second.expect("second remove")];
        assert_eq!(removed.iter().filter(|removed| **removed).count(), 1);
        assert_eq!(publisher.resolution_of("parcel").await.expect("query"), None);
    }

    #[tokio::test]
    async fn raw_fixes_travel_on_their_own_lane() {
        let transport = InMemoryTransport::new();
        let config = PublisherConfig::new(DEFAULT).with_raw_locations();
        let (publisher, mut events) = start_with(config, &transport);
        publisher.add(Trackable::new("parcel")).await.expect("add");
        assert!(transport.presence_updates().contains(&(
            "parcel".to_owned(),
            PresenceData::publisher(Some(DEFAULT)).with_raw_locations(true)
        )));

        publisher.raw_location_fix(fix(0.0).update).expect("raw fix");
        publisher.location_fix(fix(0.0)).expect("fix");
        next_matching(&mut events, is_delivery).await;
        wait_until(|| transport.published_raw().len() == 1).await;
        assert_eq!(transport.published().len(), 1);

        // The raw lane throttles against its own last sent fix.
        publisher.raw_location_fix(fix(100.0).update).expect("raw fix");
        publisher.raw_location_fix(fix(1_000.0).update).expect("raw fix");
        wait_until(|| transport.published_raw().len() == 2).await;
        let raw = transport.published_raw();
        assert_eq!(raw[1].1.location.timestamp_ms, 1_000.0);
        let skipped: Vec<f64> = raw[1]
            .1
            .skipped_locations
            .iter()
            .map(|location| location.timestamp_ms)
            .collect();
        assert_eq!(skipped, vec![100.0]);
        assert_eq!(transport.published().len(), 1);
    }

    #[tokio::test]
    async fn raw_fixes_are_dropped_when_disabled() {
        let transport = InMemoryTransport::new();
        let (publisher, mut events) = start(&transport);
        publisher.add(Trackable::new("parcel")).await.expect("add");

        publisher.raw_location_fix(fix(0.0).update).expect("raw fix");
        publisher.location_fix(fix(0.0)).expect("fix");
        next_matching(&mut events, is_delivery).await;
        assert!(transport.published_raw().is_empty());
        assert_eq!(transport.publish_attempts(), 1);
    }

    #[tokio::test]
    async fn stop_is_terminal_and_idempotent() {
        let transport = InMemoryTransport::new();
        let (publisher, _events) = start(&transport);
        publisher.add(Trackable::new("parcel")).await.expect("add");

        publisher.stop().await.expect("stop");
        assert!(transport.is_closed());
        publisher.stop().await.expect("second stop");
        assert_eq!(
            publisher.add(Trackable::new("other")).await,
            Err(SessionError::Stopped)
        );
        assert_eq!(publisher.remove("parcel").await, Err(SessionError::Stopped));
    }
}
