use std::sync::Arc;

use beacon_core::{LocationKind, PresenceData, PresenceMessage, PresenceRole, Resolution};
use beacon_transport::{Transport, TransportError, TransportEvent};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::config::SubscriberConfig;
use crate::error::SessionError;
use crate::listener::{CallbackDispatcher, EventListener, ListenerId, SubscriberEvent};
use crate::negotiation::{Acknowledgement, ResolutionNegotiationTracker};
use crate::presence::{AggregatedEvent, PresenceStateAggregator};
use crate::queue::{spawn_completion, QueueSink};
use crate::state::SessionLifecycle;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum SubscriberMessage {
    Start {
        reply: Reply<()>,
    },
    RequestResolution {
        resolution: Resolution,
        reply: Reply<()>,
    },
    Stop {
        reply: Reply<()>,
    },
    ConnectCompleted {
        result: Result<String, TransportError>,
    },
    PresenceUpdateCompleted {
        resolution: Resolution,
        result: Result<(), TransportError>,
        reply: Reply<()>,
    },
    DisconnectCompleted {
        result: Result<bool, TransportError>,
    },
    Transport(TransportEvent),
}

/// Cloneable handle to a running subscriber session.
#[derive(Clone)]
pub struct SubscriberHandle {
    queue: UnboundedSender<SubscriberMessage>,
    listeners: CallbackDispatcher<SubscriberEvent>,
}

/// Starts a subscriber session for one trackable on the current tokio
/// runtime. Call [`SubscriberHandle::start`] to join the channel.
pub fn spawn_subscriber(
    config: SubscriberConfig,
    transport: Arc<dyn Transport>,
) -> SubscriberHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let listeners = CallbackDispatcher::spawn();
    transport.subscribe_events(Arc::new(QueueSink::new(
        tx.downgrade(),
        SubscriberMessage::Transport,
    )));

    let session = SubscriberSession {
        config,
        transport,
        lifecycle: SessionLifecycle::Working,
        aggregator: None,
        negotiation: ResolutionNegotiationTracker::new(),
        member_key: None,
        start_waiters: Vec::new(),
        stop_waiters: Vec::new(),
        listeners: listeners.clone(),
        queue: tx.downgrade(),
    };
    tokio::spawn(session.run(rx));

    SubscriberHandle {
        queue: tx,
        listeners,
    }
}

impl SubscriberHandle {
    async fn request(
        &self,
        build: impl FnOnce(Reply<()>) -> SubscriberMessage,
    ) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.queue
            .send(build(reply))
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)?
    }

    /// Joins the trackable's channel and enters presence as a subscriber.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.request(|reply| SubscriberMessage::Start { reply }).await
    }

    /// Asks the publisher for a different resolution. `None` is a no-op.
    pub async fn request_resolution(
        &self,
        resolution: Option<Resolution>,
    ) -> Result<(), SessionError> {
        let Some(resolution) = resolution else {
            return Ok(());
        };
        self.request(|reply| SubscriberMessage::RequestResolution { resolution, reply })
            .await
    }

    pub fn register_listener(
        &self,
        listener: impl EventListener<SubscriberEvent> + 'static,
    ) -> ListenerId {
        self.listeners.register(listener)
    }

    pub fn unregister_listener(&self, id: ListenerId) {
        self.listeners.unregister(id);
    }

    /// Leaves the channel and drops the aggregated state. Stopping an
    /// already stopped session succeeds.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.request(|reply| SubscriberMessage::Stop { reply }).await
    }
}

struct SubscriberSession {
    config: SubscriberConfig,
    transport: Arc<dyn Transport>,
    lifecycle: SessionLifecycle,
    /// Exists from `start` until `stop`.
    aggregator: Option<PresenceStateAggregator>,
    negotiation: ResolutionNegotiationTracker,
    member_key: Option<String>,
    /// Callers waiting on the connect in flight, if any.
    start_waiters: Vec<Reply<()>>,
    stop_waiters: Vec<Reply<()>>,
    listeners: CallbackDispatcher<SubscriberEvent>,
    queue: WeakUnboundedSender<SubscriberMessage>,
}

impl SubscriberSession {
    async fn run(mut self, mut rx: UnboundedReceiver<SubscriberMessage>) {
        while let Some(message) = rx.recv().await {
            if self.lifecycle == SessionLifecycle::Working {
                self.handle(message);
            } else {
                self.handle_when_stopped(message);
            }
        }
        debug!(
            trackable_id = %self.config.trackable_id,
            "subscriber session: all handles dropped"
        );
    }

    fn trackable_id(&self) -> &str {
        &self.config.trackable_id
    }

    fn emit(&self, event: SubscriberEvent) {
        self.listeners.dispatch(event);
    }

    fn handle(&mut self, message: SubscriberMessage) {
        match message {
            SubscriberMessage::Start { reply } => self.start(reply),
            SubscriberMessage::RequestResolution { resolution, reply } => {
                self.request_resolution(resolution, reply)
            }
            SubscriberMessage::Stop { reply } => self.begin_stop(reply),
            SubscriberMessage::ConnectCompleted { result } => self.on_connect_completed(result),
            SubscriberMessage::PresenceUpdateCompleted {
                resolution,
                result,
                reply,
            } => {
                if let Err(err) = &result {
                    warn!(
                        trackable_id = %self.config.trackable_id,
                        error = %err,
                        "subscriber: resolution request failed"
                    );
                    self.negotiation.remove(&self.config.trackable_id, &resolution);
                }
                let _ = reply.send(result.map_err(SessionError::from));
            }
            SubscriberMessage::DisconnectCompleted { .. } => {}
            SubscriberMessage::Transport(event) => self.on_transport_event(event),
        }
    }

    fn handle_when_stopped(&mut self, message: SubscriberMessage) {
        match message {
            SubscriberMessage::Start { reply }
            | SubscriberMessage::RequestResolution { reply, .. }
            | SubscriberMessage::PresenceUpdateCompleted { reply, .. } => {
                let _ = reply.send(Err(SessionError::Stopped));
            }
            // Its waiters were answered when the stop began.
            SubscriberMessage::ConnectCompleted { .. } => {}
            SubscriberMessage::Stop { reply } => {
                if self.lifecycle == SessionLifecycle::Stopping {
                    self.stop_waiters.push(reply);
                } else {
                    let _ = reply.send(Ok(()));
                }
            }
            SubscriberMessage::DisconnectCompleted { result } => self.finish_stop(result),
            SubscriberMessage::Transport(_) => trace!("subscriber: dropping event after stop"),
        }
    }

    fn start(&mut self, reply: Reply<()>) {
        if self.member_key.is_some() {
            let _ = reply.send(Ok(()));
            return;
        }
        self.start_waiters.push(reply);
        if self.start_waiters.len() > 1 {
            debug!(
                trackable_id = %self.config.trackable_id,
                "subscriber: joining in-progress start"
            );
            return;
        }
        self.aggregator = Some(PresenceStateAggregator::new());
        if let Some(initial) = self.config.initial_resolution {
            self.negotiation.add(&self.config.trackable_id, initial);
        }
        let future = self.transport.connect(
            self.trackable_id(),
            PresenceData::subscriber(self.config.initial_resolution),
            true,
        );
        spawn_completion(&self.queue, future, |result| {
            SubscriberMessage::ConnectCompleted { result }
        });
    }

    fn on_connect_completed(&mut self, result: Result<String, TransportError>) {
        let outcome = match result {
            Ok(member_key) => {
                info!(
                    trackable_id = %self.config.trackable_id,
                    member_key = %member_key,
                    "subscriber: started"
                );
                self.member_key = Some(member_key);
                Ok(())
            }
            Err(err) => {
                warn!(
                    trackable_id = %self.config.trackable_id,
                    error = %err,
                    "subscriber: connect failed"
                );
                if let Some(initial) = self.config.initial_resolution {
                    self.negotiation.remove(&self.config.trackable_id, &initial);
                }
                self.aggregator = None;
                Err(SessionError::from(err))
            }
        };
        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn request_resolution(&mut self, resolution: Resolution, reply: Reply<()>) {
        self.negotiation.add(&self.config.trackable_id, resolution);
        let future = self
            .transport
            .update_presence(self.trackable_id(), PresenceData::subscriber(Some(resolution)));
        spawn_completion(&self.queue, future, move |result| {
            SubscriberMessage::PresenceUpdateCompleted {
                resolution,
                result,
                reply,
            }
        });
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        let Some(aggregator) = self.aggregator.as_mut() else {
            trace!("subscriber: event before start");
            return;
        };
        let aggregated = match event {
            TransportEvent::ConnectionStateChanged(state) => {
                aggregator.on_client_connection_state(state)
            }
            TransportEvent::ChannelStateChanged {
                trackable_id,
                state,
            } if trackable_id == self.config.trackable_id => {
                aggregator.on_channel_connection_state(state)
            }
            TransportEvent::Presence {
                trackable_id,
                messages,
            } if trackable_id == self.config.trackable_id => {
                let (own, others): (Vec<PresenceMessage>, Vec<PresenceMessage>) =
                    messages.into_iter().partition(|message| {
                        message.data.role == PresenceRole::Subscriber
                            && self.member_key.as_deref() == Some(message.member_key.as_str())
                    });
                let aggregated = aggregator.on_presence_messages(&others);
                for message in own {
                    self.on_own_presence(&message);
                }
                aggregated
            }
            TransportEvent::Location {
                trackable_id,
                kind,
                update,
            } if trackable_id == self.config.trackable_id => {
                self.emit(match kind {
                    LocationKind::Enhanced => SubscriberEvent::LocationReceived(update),
                    LocationKind::Raw => SubscriberEvent::RawLocationReceived(update),
                });
                return;
            }
            _ => return,
        };

        for event in aggregated {
            match event {
                AggregatedEvent::TrackableStateChanged(state) => {
                    self.emit(SubscriberEvent::TrackableStateChanged(state))
                }
                AggregatedEvent::PublisherVisibilityChanged(visible) => {
                    self.emit(SubscriberEvent::PublisherVisibilityChanged(visible))
                }
                AggregatedEvent::ResolutionReceived(resolution) => {
                    self.emit(SubscriberEvent::ResolutionReceived(resolution));
                    self.emit(SubscriberEvent::DesiredIntervalReceived(
                        resolution.desired_interval_ms,
                    ));
                }
            }
        }
    }

    fn on_own_presence(&mut self, message: &PresenceMessage) {
        let Some(resolution) = message.data.resolution else {
            return;
        };
        match self
            .negotiation
            .acknowledge(&self.config.trackable_id, &resolution)
        {
            Acknowledgement::Latest => {
                debug!(
                    trackable_id = %self.config.trackable_id,
                    ?resolution,
                    "subscriber: resolution request confirmed"
                );
                self.emit(SubscriberEvent::ResolutionRequestConfirmed(resolution));
            }
            Acknowledgement::Stale => {
                trace!(
                    trackable_id = %self.config.trackable_id,
                    ?resolution,
                    "subscriber: stale resolution echo"
                );
            }
            Acknowledgement::Unknown => {}
        }
    }

    fn begin_stop(&mut self, reply: Reply<()>) {
        info!(trackable_id = %self.config.trackable_id, "subscriber: stopping");
        self.lifecycle = SessionLifecycle::Stopping;
        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(Err(SessionError::Stopped));
        }
        self.stop_waiters.push(reply);
        let future = self
            .transport
            .disconnect(self.trackable_id(), PresenceData::subscriber(None));
        spawn_completion(&self.queue, future, |result| {
            SubscriberMessage::DisconnectCompleted { result }
        });
    }

    fn finish_stop(&mut self, result: Result<bool, TransportError>) {
        if self.lifecycle != SessionLifecycle::Stopping {
            return;
        }
        self.lifecycle = SessionLifecycle::Stopped;
        self.aggregator = None;
        self.negotiation.clear_all();
        self.member_key = None;
        info!(trackable_id = %self.config.trackable_id, "subscriber: stopped");

        let outcome = result.map(|_| ()).map_err(SessionError::from);
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use beacon_core::{Accuracy, ConnectionState, PresenceData, Resolution};
    use beacon_transport::{InMemoryTransport, Transport, TransportEvent};
    use tokio::sync::mpsc;

    use super::{spawn_subscriber, SubscriberHandle};
    use crate::config::SubscriberConfig;
    use crate::error::SessionError;
    use crate::listener::SubscriberEvent;

    fn start(
        transport: &InMemoryTransport,
        config: SubscriberConfig,
    ) -> (SubscriberHandle, mpsc::UnboundedReceiver<SubscriberEvent>) {
        let handle = spawn_subscriber(config, Arc::new(transport.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        handle.register_listener(move |event: SubscriberEvent| {
            let _ = tx.send(event);
        });
        (handle, rx)
    }

    #[tokio::test]
    async fn start_joins_with_initial_resolution() {
        let transport = InMemoryTransport::new();
        let initial = Resolution::new(Accuracy::High, 2_000, 5.0);
        let (subscriber, _events) = start(
            &transport,
            SubscriberConfig::new("parcel").with_initial_resolution(initial),
        );
        subscriber.start().await.expect("start");
        assert!(transport.is_joined("parcel"));
        subscriber.start().await.expect("second start is a no-op");
        assert_eq!(transport.health_snapshot().connect_attempts, 1);
    }

    #[tokio::test]
    async fn concurrent_starts_share_the_connect_outcome() {
        let transport = InMemoryTransport::new();
        transport.set_fail_connect(true);
        let (subscriber, _events) = start(&transport, SubscriberConfig::new("parcel"));

        let (first, second) = tokio::join!(subscriber.start(), subscriber.start());
        assert!(matches!(first, Err(SessionError::Transport(_))));
        assert!(matches!(second, Err(SessionError::Transport(_))));
        assert_eq!(transport.health_snapshot().connect_attempts, 1);

        transport.set_fail_connect(false);
        let (first, second) = tokio::join!(subscriber.start(), subscriber.start());
        first.expect("first start");
        second.expect("second start");
        assert_eq!(transport.health_snapshot().connect_attempts, 2);
        assert!(transport.is_joined("parcel"));
    }

    #[tokio::test]
    async fn none_resolution_request_succeeds_without_presence_update() {
        let transport = InMemoryTransport::new();
        let (subscriber, _events) = start(&transport, SubscriberConfig::new("parcel"));
        subscriber.start().await.expect("start");
        subscriber.request_resolution(None).await.expect("no-op request");
        assert!(transport.presence_updates().is_empty());
    }

    #[tokio::test]
    async fn resolution_request_updates_presence() {
        let transport = InMemoryTransport::new();
        let (subscriber, _events) = start(&transport, SubscriberConfig::new("parcel"));
        subscriber.start().await.expect("start");

        let wanted = Resolution::new(Accuracy::Maximum, 500, 1.0);
        subscriber
            .request_resolution(Some(wanted))
            .await
            .expect("request");
        assert_eq!(
            transport.presence_updates(),
            vec![("parcel".to_owned(), PresenceData::subscriber(Some(wanted)))]
        );
    }

    #[tokio::test]
    async fn failed_resolution_request_is_reported() {
        let transport = InMemoryTransport::new();
        transport.set_fail_presence_updates(true);
        let (subscriber, _events) = start(&transport, SubscriberConfig::new("parcel"));
        subscriber.start().await.expect("start");

        let err = subscriber
            .request_resolution(Some(Resolution::new(Accuracy::Low, 1, 1.0)))
            .await
            .expect_err("presence update fails");
        assert!(matches!(err, SessionError::Transport(_)));
    }

    #[tokio::test]
    async fn operations_after_stop_fail_but_stop_succeeds() {
        let transport = InMemoryTransport::new();
        let (subscriber, _events) = start(&transport, SubscriberConfig::new("parcel"));
        subscriber.start().await.expect("start");

        subscriber.stop().await.expect("stop");
        assert!(!transport.is_joined("parcel"));
        subscriber.stop().await.expect("second stop");
        assert_eq!(subscriber.start().await, Err(SessionError::Stopped));
        assert_eq!(
            subscriber
                .request_resolution(Some(Resolution::new(Accuracy::Low, 1, 1.0)))
                .await,
            Err(SessionError::Stopped)
        );
        // None short-circuits before reaching the session.
        assert_eq!(subscriber.request_resolution(None).await, Ok(()));
    }

    #[tokio::test]
    async fn listener_receives_nothing_before_start() {
        let transport = InMemoryTransport::new();
        let (_subscriber, mut events) = start(&transport, SubscriberConfig::new("parcel"));
        transport.inject(TransportEvent::ConnectionStateChanged(ConnectionState::Online));
        let waited = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        assert!(waited.is_err());
    }
}
