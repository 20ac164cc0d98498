use std::collections::{HashMap, HashSet};

use beacon_core::{
    ConnectionState, Location, LocationKind, Resolution, Trackable, TrackableState,
};

/// Lifecycle shared by publisher and subscriber sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifecycle {
    Working,
    /// Stop accepted; waiting for the transport to close.
    Stopping,
    Stopped,
}

/// Mutable publisher-session state, owned by the session task.
#[derive(Debug)]
pub struct PublisherState {
    pub lifecycle: SessionLifecycle,
    /// Trackables whose channel is joined, by id.
    pub trackables: HashMap<String, Trackable>,
    pub active_trackable: Option<String>,
    /// Per trackable: subscriber member key to requested resolution.
    pub subscribers: HashMap<String, HashMap<String, Option<Resolution>>>,
    /// Last resolution computed for each trackable.
    pub resolutions: HashMap<String, Resolution>,
    pub location_engine_resolution: Option<Resolution>,
    /// Last enhanced location handed to the transport for each trackable.
    pub last_sent: HashMap<String, Location>,
    /// Same, for the raw lane.
    pub last_raw_sent: HashMap<String, Location>,
    /// Trackables with at least one successfully delivered location.
    pub delivered: HashSet<String>,
    pub client_state: ConnectionState,
    pub channel_states: HashMap<String, ConnectionState>,
    /// Last trackable state reported to listeners.
    pub trackable_states: HashMap<String, TrackableState>,
}

impl Default for PublisherState {
    fn default() -> Self {
        Self {
            lifecycle: SessionLifecycle::Working,
            trackables: HashMap::new(),
            active_trackable: None,
            subscribers: HashMap::new(),
            resolutions: HashMap::new(),
            location_engine_resolution: None,
            last_sent: HashMap::new(),
            last_raw_sent: HashMap::new(),
            delivered: HashSet::new(),
            client_state: ConnectionState::Offline,
            channel_states: HashMap::new(),
            trackable_states: HashMap::new(),
        }
    }
}

impl PublisherState {
    pub fn is_working(&self) -> bool {
        self.lifecycle == SessionLifecycle::Working
    }

    pub fn last_sent_on(&self, kind: LocationKind) -> &HashMap<String, Location> {
        match kind {
            LocationKind::Enhanced => &self.last_sent,
            LocationKind::Raw => &self.last_raw_sent,
        }
    }

    pub fn last_sent_on_mut(&mut self, kind: LocationKind) -> &mut HashMap<String, Location> {
        match kind {
            LocationKind::Enhanced => &mut self.last_sent,
            LocationKind::Raw => &mut self.last_raw_sent,
        }
    }

    /// Distinct resolutions requested by the trackable's subscribers.
    pub fn remote_requests(&self, trackable_id: &str) -> HashSet<Resolution> {
        self.subscribers
            .get(trackable_id)
            .map(|members| members.values().flatten().copied().collect())
            .unwrap_or_default()
    }

    /// Failed if the client or channel failed, offline if either is offline,
    /// online once the channel is up and a location has been delivered.
    pub fn derive_trackable_state(&self, trackable_id: &str) -> TrackableState {
        let channel = self
            .channel_states
            .get(trackable_id)
            .copied()
            .unwrap_or(ConnectionState::Offline);
        match (self.client_state, channel) {
            (ConnectionState::Failed, _) | (_, ConnectionState::Failed) => TrackableState::Failed,
            (ConnectionState::Offline, _) | (_, ConnectionState::Offline) => {
                TrackableState::Offline
            }
            (ConnectionState::Online, ConnectionState::Online)
                if self.delivered.contains(trackable_id) =>
            {
                TrackableState::Online
            }
            (ConnectionState::Online, ConnectionState::Online) => TrackableState::Offline,
        }
    }

    /// Recomputes the trackable state; returns it when it differs from the
    /// last reported one.
    pub fn refresh_trackable_state(&mut self, trackable_id: &str) -> Option<TrackableState> {
        let derived = self.derive_trackable_state(trackable_id);
        let previous = self
            .trackable_states
            .insert(trackable_id.to_owned(), derived)
            .unwrap_or(TrackableState::Offline);
        (previous != derived).then_some(derived)
    }

    /// Drops every per-trackable entry except subscribers.
    pub fn forget(&mut self, trackable_id: &str) -> Option<Trackable> {
        self.resolutions.remove(trackable_id);
        self.last_sent.remove(trackable_id);
        self.last_raw_sent.remove(trackable_id);
        self.delivered.remove(trackable_id);
        self.channel_states.remove(trackable_id);
        self.trackable_states.remove(trackable_id);
        if self.active_trackable.as_deref() == Some(trackable_id) {
            self.active_trackable = None;
        }
        self.trackables.remove(trackable_id)
    }
}
