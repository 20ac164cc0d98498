use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::TrackingError;
use crate::location::LocationCoordinate;
use crate::types::Resolution;

/// Threshold for deciding that an asset is "near" its destination.
///
/// Exactly one criterion is carried. The serialized form is
/// `{ "spatial": meters }` or `{ "temporal": millis }`; documents carrying both
/// or neither are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ProximityParts", into = "ProximityParts")]
pub enum Proximity {
    /// Reached when the straight-line distance to the destination is below
    /// `meters`.
    Spatial { meters: f64 },
    /// Reached when the estimated time of arrival is less than `millis` away.
    Temporal { millis: f64 },
}

impl Proximity {
    pub fn spatial(meters: f64) -> Result<Self, TrackingError> {
        Self::from_parts(Some(meters), None)
    }

    pub fn temporal(millis: f64) -> Result<Self, TrackingError> {
        Self::from_parts(None, Some(millis))
    }

    pub fn from_parts(spatial: Option<f64>, temporal: Option<f64>) -> Result<Self, TrackingError> {
        match (spatial, temporal) {
            (Some(meters), None) => {
                check_threshold(meters)?;
                Ok(Self::Spatial { meters })
            }
            (None, Some(millis)) => {
                check_threshold(millis)?;
                Ok(Self::Temporal { millis })
            }
            (Some(_), Some(_)) => Err(TrackingError::InvalidConfiguration(
                "proximity carries both spatial and temporal thresholds",
            )),
            (None, None) => Err(TrackingError::InvalidConfiguration(
                "proximity carries no threshold",
            )),
        }
    }
}

fn check_threshold(value: f64) -> Result<(), TrackingError> {
    if !value.is_finite() || value < 0.0 {
        return Err(TrackingError::InvalidConfiguration(
            "proximity threshold must be finite and non-negative",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProximityParts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    spatial: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    temporal: Option<f64>,
}

impl TryFrom<ProximityParts> for Proximity {
    type Error = TrackingError;

    fn try_from(parts: ProximityParts) -> Result<Self, Self::Error> {
        Proximity::from_parts(parts.spatial, parts.temporal)
    }
}

impl From<Proximity> for ProximityParts {
    fn from(value: Proximity) -> Self {
        match value {
            Proximity::Spatial { meters } => Self {
                spatial: Some(meters),
                temporal: None,
            },
            Proximity::Temporal { millis } => Self {
                spatial: None,
                temporal: Some(millis),
            },
        }
    }
}

/// Base resolutions indexed by proximity and subscriber presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionSet {
    pub far_without_subscriber: Resolution,
    pub far_with_subscriber: Resolution,
    pub near_without_subscriber: Resolution,
    pub near_with_subscriber: Resolution,
}

impl ResolutionSet {
    pub fn uniform(resolution: Resolution) -> Self {
        Self {
            far_without_subscriber: resolution,
            far_with_subscriber: resolution,
            near_without_subscriber: resolution,
            near_with_subscriber: resolution,
        }
    }

    pub fn select(&self, near: bool, has_subscriber: bool) -> Resolution {
        match (near, has_subscriber) {
            (false, false) => self.far_without_subscriber,
            (false, true) => self.far_with_subscriber,
            (true, false) => self.near_without_subscriber,
            (true, true) => self.near_with_subscriber,
        }
    }

    fn cells(&self) -> [&Resolution; 4] {
        [
            &self.far_without_subscriber,
            &self.far_with_subscriber,
            &self.near_without_subscriber,
            &self.near_with_subscriber,
        ]
    }
}

/// Per-trackable constraints consulted by the resolution policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolutionConstraints {
    pub resolutions: ResolutionSet,
    pub proximity_threshold: Proximity,
    /// Battery percentage in `[0, 100]` below which intervals are stretched.
    pub battery_level_threshold: f32,
    /// Factor (>= 1) applied to the desired interval on low battery.
    pub low_battery_multiplier: f32,
}

impl ResolutionConstraints {
    pub fn new(
        resolutions: ResolutionSet,
        proximity_threshold: Proximity,
        battery_level_threshold: f32,
        low_battery_multiplier: f32,
    ) -> Result<Self, TrackingError> {
        for resolution in resolutions.cells() {
            resolution.validate()?;
        }
        if !(0.0..=100.0).contains(&battery_level_threshold) {
            return Err(TrackingError::InvalidConfiguration(
                "battery level threshold must be within 0..=100",
            ));
        }
        if !low_battery_multiplier.is_finite() || low_battery_multiplier < 1.0 {
            return Err(TrackingError::InvalidConfiguration(
                "low battery multiplier must be at least 1",
            ));
        }
        Ok(Self {
            resolutions,
            proximity_threshold,
            battery_level_threshold,
            low_battery_multiplier,
        })
    }
}

/// A tracked asset. Identity is the id alone.
#[derive(Debug, Clone)]
pub struct Trackable {
    pub id: String,
    pub destination: Option<LocationCoordinate>,
    pub constraints: Option<ResolutionConstraints>,
}

impl Trackable {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            destination: None,
            constraints: None,
        }
    }

    /// Sets the destination; `(0, 0)` clears it.
    pub fn with_destination(mut self, destination: LocationCoordinate) -> Self {
        self.destination = (!destination.is_null_island()).then_some(destination);
        self
    }

    pub fn with_constraints(mut self, constraints: ResolutionConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }
}

impl PartialEq for Trackable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Trackable {}

impl Hash for Trackable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
