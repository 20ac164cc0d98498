use std::collections::{HashSet, VecDeque};

use beacon_core::{
    ConnectionState, PresenceMessage, PresenceRole, Resolution, TrackableState,
};

/// Status change produced by one aggregation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatedEvent {
    TrackableStateChanged(TrackableState),
    PublisherVisibilityChanged(bool),
    /// A resolution announced by the publisher, in arrival order.
    ResolutionReceived(Resolution),
}

/// Values derived from the current inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedPresence {
    pub trackable_state: TrackableState,
    pub publisher_visible: bool,
}

/// Fuses client connection state, channel state, and publisher presence into
/// one trackable status for a subscriber.
///
/// Inputs change only through the three `on_*` entry points. Each entry point
/// ends with one aggregation pass that compares the derived values with the
/// last emitted ones and drains queued publisher resolutions.
#[derive(Debug)]
pub struct PresenceStateAggregator {
    client_state: ConnectionState,
    channel_state: ConnectionState,
    present_publishers: HashSet<String>,
    last_trackable_state: TrackableState,
    last_publisher_visible: Option<bool>,
    pending_resolutions: VecDeque<Resolution>,
}

impl Default for PresenceStateAggregator {
    fn default() -> Self {
        Self {
            client_state: ConnectionState::Offline,
            channel_state: ConnectionState::Offline,
            present_publishers: HashSet::new(),
            last_trackable_state: TrackableState::Offline,
            last_publisher_visible: None,
            pending_resolutions: VecDeque::new(),
        }
    }
}

impl PresenceStateAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_client_connection_state(&mut self, state: ConnectionState) -> Vec<AggregatedEvent> {
        self.client_state = state;
        self.aggregate()
    }

    pub fn on_channel_connection_state(&mut self, state: ConnectionState) -> Vec<AggregatedEvent> {
        self.channel_state = state;
        self.aggregate()
    }

    /// Applies publisher presence changes. Subscriber-role members are
    /// ignored.
    pub fn on_presence_messages(&mut self, messages: &[PresenceMessage]) -> Vec<AggregatedEvent> {
        for message in messages {
            if message.data.role != PresenceRole::Publisher {
                continue;
            }
            match message.action.membership() {
                Some(true) => {
                    self.present_publishers.insert(message.member_key.clone());
                    if let Some(resolution) = message.data.resolution {
                        self.pending_resolutions.push_back(resolution);
                    }
                }
                Some(false) => {
                    self.present_publishers.remove(&message.member_key);
                }
                None => {}
            }
        }
        self.aggregate()
    }

    pub fn derive(&self) -> DerivedPresence {
        let has_publisher = !self.present_publishers.is_empty();
        let trackable_state = match (self.client_state, self.channel_state) {
            (ConnectionState::Failed, _) | (_, ConnectionState::Failed) => TrackableState::Failed,
            (ConnectionState::Offline, _) | (_, ConnectionState::Offline) => {
                TrackableState::Offline
            }
            (ConnectionState::Online, ConnectionState::Online) if has_publisher => {
                TrackableState::Online
            }
            (ConnectionState::Online, ConnectionState::Online) => TrackableState::Offline,
        };
        DerivedPresence {
            trackable_state,
            publisher_visible: self.client_state == ConnectionState::Online && has_publisher,
        }
    }

    pub fn present_publisher_count(&self) -> usize {
        self.present_publishers.len()
    }

    pub fn last_trackable_state(&self) -> TrackableState {
        self.last_trackable_state
    }

    fn aggregate(&mut self) -> Vec<AggregatedEvent> {
        let derived = self.derive();
        let mut events = Vec::new();
        if derived.trackable_state != self.last_trackable_state {
            self.last_trackable_state = derived.trackable_state;
            events.push(AggregatedEvent::TrackableStateChanged(derived.trackable_state));
        }
        if self.last_publisher_visible != Some(derived.publisher_visible) {
            self.last_publisher_visible = Some(derived.publisher_visible);
            events.push(AggregatedEvent::PublisherVisibilityChanged(
                derived.publisher_visible,
            ));
        }
        events.extend(
            self.pending_resolutions
                .drain(..)
                .map(AggregatedEvent::ResolutionReceived),
        );
        events
    }
}
