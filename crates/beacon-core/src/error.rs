use thiserror::Error;

/// Shared lightweight error type for core value construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackingError {
    /// A constraint, threshold, or resolution value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),
}
