use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use beacon_core::{ConnectionState, LocationKind, LocationUpdate, PresenceData, PresenceMessage};
use thiserror::Error;

/// Boxed completion of one transport operation.
pub type TransportFuture<T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("presence update failed: {0}")]
    Presence(String),
    #[error("transport is closed")]
    Closed,
}

/// Asynchronous signals pushed by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Client-level connection state.
    ConnectionStateChanged(ConnectionState),
    /// State of the channel carrying one trackable.
    ChannelStateChanged {
        trackable_id: String,
        state: ConnectionState,
    },
    /// Presence changes observed on a trackable's channel.
    Presence {
        trackable_id: String,
        messages: Vec<PresenceMessage>,
    },
    /// A location published on a trackable's channel.
    Location {
        trackable_id: String,
        kind: LocationKind,
        update: LocationUpdate,
    },
}

/// Receiver of transport events. Implementations must not block.
pub trait TransportEventSink: Send + Sync {
    fn emit(&self, event: TransportEvent);
}

/// Coarse per-transport health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHealthSnapshot {
    pub connect_attempts: u64,
    pub publish_ok: u64,
    pub publish_err: u64,
    pub presence_updates: u64,
    pub last_error: Option<String>,
}

/// Pub/sub transport contract used by publisher and subscriber sessions.
///
/// Every operation returns immediately with a future; sessions drive the
/// futures on spawned tasks and post the outcome back to their own queue.
pub trait Transport: Send + Sync {
    /// Joins the trackable's channel and enters presence with `presence`.
    /// Resolves to the member key assigned to this connection.
    fn connect(
        &self,
        trackable_id: &str,
        presence: PresenceData,
        use_rewind: bool,
    ) -> TransportFuture<String>;

    /// Leaves presence and detaches. Resolves to whether the channel was
    /// joined.
    fn disconnect(&self, trackable_id: &str, presence: PresenceData) -> TransportFuture<bool>;

    /// Publishes one update on the lane named by `kind`.
    fn publish(
        &self,
        trackable_id: &str,
        kind: LocationKind,
        update: LocationUpdate,
    ) -> TransportFuture<()>;

    fn enter_presence(&self, trackable_id: &str, presence: PresenceData) -> TransportFuture<()>;

    fn update_presence(&self, trackable_id: &str, presence: PresenceData) -> TransportFuture<()>;

    fn leave_presence(&self, trackable_id: &str, presence: PresenceData) -> TransportFuture<()>;

    /// Leaves every channel and closes the client connection.
    fn close(&self, presence: PresenceData) -> TransportFuture<()>;

    /// Registers a receiver for the transport's event stream.
    fn subscribe_events(&self, sink: Arc<dyn TransportEventSink>);

    /// Best-effort health counters for diagnostics.
    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot::default()
    }
}
