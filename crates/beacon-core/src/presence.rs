use serde::{Deserialize, Serialize};

use crate::types::Resolution;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceRole {
    Publisher,
    Subscriber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Enter,
    Present,
    Update,
    Leave,
    Absent,
    Unknown,
}

impl PresenceAction {
    /// Whether the member is in the channel after this action.
    pub fn membership(&self) -> Option<bool> {
        match self {
            Self::Enter | Self::Present | Self::Update => Some(true),
            Self::Leave | Self::Absent => Some(false),
            Self::Unknown => None,
        }
    }
}

/// Payload each member attaches to its presence entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceData {
    #[serde(rename = "type")]
    pub role: PresenceRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    /// Set by publishers that also send raw locations.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub raw_locations: bool,
}

impl PresenceData {
    pub const fn publisher(resolution: Option<Resolution>) -> Self {
        Self {
            role: PresenceRole::Publisher,
            resolution,
            raw_locations: false,
        }
    }

    pub const fn subscriber(resolution: Option<Resolution>) -> Self {
        Self {
            role: PresenceRole::Subscriber,
            resolution,
            raw_locations: false,
        }
    }

    pub const fn with_raw_locations(mut self, raw_locations: bool) -> Self {
        self.raw_locations = raw_locations;
        self
    }
}

/// One presence change observed on a trackable's channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMessage {
    pub action: PresenceAction,
    pub data: PresenceData,
    /// Unique per connection; the key used for membership tracking.
    pub member_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl PresenceMessage {
    pub fn new(action: PresenceAction, data: PresenceData, member_key: impl Into<String>) -> Self {
        Self {
            action,
            data,
            member_key: member_key.into(),
            client_id: None,
        }
    }
}
