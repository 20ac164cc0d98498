use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::TrackingError;

/// Requested sampling accuracy, ordered from cheapest to most precise.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Accuracy {
    Minimum,
    Low,
    Balanced,
    High,
    Maximum,
}

/// Sampling requirement for one tracked asset.
///
/// Equality and hashing cover all three fields. Displacement is compared by
/// bit pattern with `-0.0` folded into `0.0`, so the type is a lawful `Eq`.
/// Decoding runs [`Resolution::validate`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "ResolutionParts", into = "ResolutionParts")]
pub struct Resolution {
    pub accuracy: Accuracy,
    /// Desired time between location updates, in milliseconds.
    pub desired_interval_ms: u64,
    /// Minimum movement between location updates, in meters.
    pub minimum_displacement_m: f64,
}

impl Resolution {
    pub const fn new(
        accuracy: Accuracy,
        desired_interval_ms: u64,
        minimum_displacement_m: f64,
    ) -> Self {
        Self {
            accuracy,
            desired_interval_ms,
            minimum_displacement_m,
        }
    }

    /// Rejects displacements that are negative or not finite.
    pub fn validate(&self) -> Result<(), TrackingError> {
        if !self.minimum_displacement_m.is_finite() {
            return Err(TrackingError::InvalidConfiguration(
                "minimum displacement must be finite",
            ));
        }
        if self.minimum_displacement_m < 0.0 {
            return Err(TrackingError::InvalidConfiguration(
                "minimum displacement must not be negative",
            ));
        }
        Ok(())
    }

    /// Most demanding combination of two resolutions.
    pub fn merge(&self, other: &Resolution) -> Resolution {
        Resolution {
            accuracy: self.accuracy.max(other.accuracy),
            desired_interval_ms: self.desired_interval_ms.min(other.desired_interval_ms),
            minimum_displacement_m: self.minimum_displacement_m.min(other.minimum_displacement_m),
        }
    }

    /// Merges a collection: highest accuracy, shortest interval, smallest
    /// displacement. Returns `None` for an empty input.
    pub fn combine<'a, I>(resolutions: I) -> Option<Resolution>
    where
        I: IntoIterator<Item = &'a Resolution>,
    {
        resolutions
            .into_iter()
            .copied()
            .reduce(|merged, next| merged.merge(&next))
    }

    pub fn with_desired_interval_ms(self, desired_interval_ms: u64) -> Self {
        Self {
            desired_interval_ms,
            ..self
        }
    }

    fn displacement_bits(&self) -> u64 {
        if self.minimum_displacement_m == 0.0 {
            0.0f64.to_bits()
        } else {
            self.minimum_displacement_m.to_bits()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResolutionParts {
    accuracy: Accuracy,
    desired_interval_ms: u64,
    minimum_displacement_m: f64,
}

impl TryFrom<ResolutionParts> for Resolution {
    type Error = TrackingError;

    fn try_from(parts: ResolutionParts) -> Result<Self, Self::Error> {
        let resolution = Resolution::new(
            parts.accuracy,
            parts.desired_interval_ms,
            parts.minimum_displacement_m,
        );
        resolution.validate()?;
        Ok(resolution)
    }
}

impl From<Resolution> for ResolutionParts {
    fn from(value: Resolution) -> Self {
        Self {
            accuracy: value.accuracy,
            desired_interval_ms: value.desired_interval_ms,
            minimum_displacement_m: value.minimum_displacement_m,
        }
    }
}

impl PartialEq for Resolution {
    fn eq(&self, other: &Self) -> bool {
        self.accuracy == other.accuracy
            && self.desired_interval_ms == other.desired_interval_ms
            && self.displacement_bits() == other.displacement_bits()
    }
}

impl Eq for Resolution {}

impl Hash for Resolution {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.accuracy.hash(state);
        self.desired_interval_ms.hash(state);
        self.displacement_bits().hash(state);
    }
}

/// Connection state reported by the transport for the client or a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Online,
    Offline,
    Failed,
}

/// Fused reachability status of one tracked asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackableState {
    Online,
    Offline,
    Failed,
}
