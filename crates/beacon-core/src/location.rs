use serde::{Deserialize, Serialize};

/// Geographic position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationCoordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl LocationCoordinate {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// `(0, 0)` is what unset destinations look like on the wire.
    pub fn is_null_island(&self) -> bool {
        self.latitude == 0.0 && self.longitude == 0.0
    }
}

/// One position fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub coordinate: LocationCoordinate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_accuracy_m: Option<f64>,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: f64,
}

impl Location {
    pub fn new(coordinate: LocationCoordinate, timestamp_ms: f64) -> Self {
        Self {
            coordinate,
            horizontal_accuracy_m: None,
            timestamp_ms,
        }
    }

    pub fn with_horizontal_accuracy(mut self, meters: f64) -> Self {
        self.horizontal_accuracy_m = Some(meters);
        self
    }
}

/// Delivery lane a location travels on. Enhanced fixes come out of the
/// location engine; raw fixes are the unprocessed samples it was fed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationKind {
    #[default]
    Enhanced,
    Raw,
}

/// A location plus the fixes that were not delivered since the last
/// successful send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub location: Location,
    #[serde(default)]
    pub skipped_locations: Vec<Location>,
}

impl LocationUpdate {
    pub fn new(location: Location) -> Self {
        Self {
            location,
            skipped_locations: Vec::new(),
        }
    }

    pub fn timestamp_ms(&self) -> f64 {
        self.location.timestamp_ms
    }
}

#[cfg(test)]
mod tests {
    use super::{Location, LocationCoordinate, LocationKind, LocationUpdate};

    #[test]
    fn null_island_is_detected() {
        assert!(LocationCoordinate::new(0.0, 0.0).is_null_island());
        assert!(!LocationCoordinate::new(0.0, 0.1).is_null_island());
    }

    #[test]
    fn update_without_skipped_list_decodes() {
        let json =
            r#"{"location":{"coordinate":{"latitude":1.5,"longitude":2.5},"timestamp_ms":10.0}}"#;
        let update: LocationUpdate = serde_json::from_str(json).expect("decode");
        assert_eq!(
            update,
            LocationUpdate::new(Location::new(LocationCoordinate::new(1.5, 2.5), 10.0))
        );
    }

    #[test]
    fn location_kind_uses_lowercase_names() {
        assert_eq!(serde_json::to_string(&LocationKind::Raw).expect("encode"), "\"raw\"");
        assert_eq!(LocationKind::default(), LocationKind::Enhanced);
    }
}
