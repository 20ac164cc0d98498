use beacon_transport::TransportError;
use thiserror::Error;

/// Errors returned by publisher and subscriber session operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session was stopped; only `stop` still succeeds.
    #[error("session is stopped")]
    Stopped,
    #[error("trackable already added: {0}")]
    TrackableAlreadyExists(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// The session task is no longer running.
    #[error("session task has exited")]
    Closed,
}
