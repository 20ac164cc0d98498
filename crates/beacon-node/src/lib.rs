//! beacon control-plane primitives and session runtimes.
//!
//! This crate computes per-trackable sampling resolutions, gates location
//! delivery with bounded retry and skipped-location buffering, fuses
//! connection and presence signals into trackable status, and runs publisher
//! and subscriber sessions as serial tokio tasks over a pluggable transport.

pub mod battery;
pub mod config;
pub mod delivery;
pub mod error;
pub mod listener;
pub mod negotiation;
pub mod policy;
pub mod presence;
pub mod proximity;
pub mod publisher;
mod queue;
pub mod state;
pub mod subscriber;

pub use config::{ConfigError, DeliveryRetryPolicy, PublisherConfig, SubscriberConfig};
pub use error::SessionError;
pub use listener::{ListenerId, PublisherEvent, SubscriberEvent};
pub use policy::{ResolutionPolicy, ResolutionPolicyEngine};
pub use proximity::LocationFix;
pub use publisher::{spawn_publisher, PublisherHandle};
pub use subscriber::{spawn_subscriber, SubscriberHandle};
