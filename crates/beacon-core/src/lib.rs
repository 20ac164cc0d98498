//! Core beacon primitives shared across crates.
//!
//! Includes resolution values, trackable descriptions, location and presence
//! types, connection states, geo helpers, and base errors.

pub mod error;
pub mod geo;
pub mod location;
pub mod presence;
pub mod trackable;
pub mod types;

pub use error::TrackingError;
pub use location::{Location, LocationCoordinate, LocationKind, LocationUpdate};
pub use presence::{PresenceAction, PresenceData, PresenceMessage, PresenceRole};
pub use trackable::{Proximity, ResolutionConstraints, ResolutionSet, Trackable};
pub use types::{Accuracy, ConnectionState, Resolution, TrackableState};
