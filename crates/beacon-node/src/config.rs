use beacon_core::{Resolution, TrackingError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] TrackingError),
}

/// Retry and buffering limits for per-trackable location delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryRetryPolicy {
    /// Retries allowed after the first failed send of one update.
    pub max_retry_count: u32,
    /// Capacity of the skipped-locations buffer; the oldest entry is evicted.
    pub max_skipped_locations: usize,
}

impl Default for DeliveryRetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_count: 1,
            max_skipped_locations: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Used when a trackable has neither constraints nor subscriber requests.
    pub default_resolution: Resolution,
    #[serde(default)]
    pub delivery: DeliveryRetryPolicy,
    /// Publish each trackable's resolution in the publisher's presence data.
    #[serde(default = "enabled")]
    pub send_resolution_enabled: bool,
    /// Pins the location-engine resolution instead of merging trackables.
    #[serde(default)]
    pub constant_location_engine_resolution: Option<Resolution>,
    /// Also publish unprocessed fixes on a separate lane.
    #[serde(default)]
    pub raw_locations_enabled: bool,
}

fn enabled() -> bool {
    true
}

impl PublisherConfig {
    pub fn new(default_resolution: Resolution) -> Self {
        Self {
            default_resolution,
            delivery: DeliveryRetryPolicy::default(),
            send_resolution_enabled: true,
            constant_location_engine_resolution: None,
            raw_locations_enabled: false,
        }
    }

    pub fn with_raw_locations(mut self) -> Self {
        self.raw_locations_enabled = true;
        self
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrackingError> {
        self.default_resolution.validate()?;
        if let Some(constant) = &self.constant_location_engine_resolution {
            constant.validate()?;
        }
        if self.delivery.max_skipped_locations == 0 {
            return Err(TrackingError::InvalidConfiguration(
                "max_skipped_locations must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberConfig {
    pub trackable_id: String,
    /// Resolution requested when the subscription starts.
    #[serde(default)]
    pub initial_resolution: Option<Resolution>,
}

impl SubscriberConfig {
    pub fn new(trackable_id: impl Into<String>) -> Self {
        Self {
            trackable_id: trackable_id.into(),
            initial_resolution: None,
        }
    }

    pub fn with_initial_resolution(mut self, resolution: Resolution) -> Self {
        self.initial_resolution = Some(resolution);
        self
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrackingError> {
        if self.trackable_id.is_empty() {
            return Err(TrackingError::InvalidConfiguration(
                "trackable_id must not be empty",
            ));
        }
        if let Some(resolution) = &self.initial_resolution {
            resolution.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use beacon_core::{Accuracy, Resolution};

    use super::{ConfigError, DeliveryRetryPolicy, PublisherConfig, SubscriberConfig};

    #[test]
    fn publisher_config_parses_with_defaults() {
        let config = PublisherConfig::from_toml_str(
            r#"
            [default_resolution]
            accuracy = "balanced"
            desired_interval_ms = 1000
            minimum_displacement_m = 5.0
            "#,
        )
        .expect("config should parse");
        assert_eq!(
            config,
            PublisherConfig::new(Resolution::new(Accuracy::Balanced, 1_000, 5.0))
        );
        assert_eq!(config.delivery, DeliveryRetryPolicy::default());
        assert!(!config.raw_locations_enabled);
    }

    #[test]
    fn publisher_config_overrides_delivery_limits() {
        let config = PublisherConfig::from_toml_str(
            r#"
            send_resolution_enabled = false
            raw_locations_enabled = true

            [default_resolution]
            accuracy = "high"
            desired_interval_ms = 500
            minimum_displacement_m = 1.0

            [delivery]
            max_retry_count = 3
            "#,
        )
        .expect("config should parse");
        assert!(!config.send_resolution_enabled);
        assert!(config.raw_locations_enabled);
        assert_eq!(config.delivery.max_retry_count, 3);
        assert_eq!(config.delivery.max_skipped_locations, 60);
    }

    #[test]
    fn missing_default_resolution_is_rejected() {
        let err = PublisherConfig::from_toml_str("send_resolution_enabled = true")
            .expect_err("default resolution is required");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn invalid_values_are_rejected_not_defaulted() {
        let err = PublisherConfig::from_toml_str(
            r#"
            [default_resolution]
            accuracy = "low"
            desired_interval_ms = 10
            minimum_displacement_m = -1.0
            "#,
        )
        .expect_err("negative displacement");
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("must not be negative"));

        let err = PublisherConfig::from_toml_str(
            r#"
            [default_resolution]
            accuracy = "low"
            desired_interval_ms = 10
            minimum_displacement_m = 1.0

            [delivery]
            max_skipped_locations = 0
            "#,
        )
        .expect_err("empty skipped buffer");
        assert!(matches!(err, ConfigError::Invalid(_)));

        let mut config = PublisherConfig::new(Resolution::new(Accuracy::Low, 10, 1.0));
        config.delivery.max_skipped_locations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn subscriber_config_requires_trackable_id() {
        let config = SubscriberConfig::from_toml_str(
            r#"
            trackable_id = "courier-12"

            [initial_resolution]
            accuracy = "maximum"
            desired_interval_ms = 250
            minimum_displacement_m = 0.5
            "#,
        )
        .expect("config should parse");
        assert_eq!(config.trackable_id, "courier-12");
        assert!(config.initial_resolution.is_some());
        assert!(SubscriberConfig::new("").validate().is_err());
    }
}
