use std::collections::HashMap;

use beacon_core::Resolution;

/// How a presence echo relates to the outstanding requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// The newest request was confirmed; every older one is superseded.
    Latest,
    /// An older request was confirmed while a newer one is still outstanding.
    Stale,
    /// Not a value this session asked for.
    Unknown,
}

/// Ordered record of resolution changes requested locally and not yet seen
/// echoed back through presence.
#[derive(Debug, Default, Clone)]
pub struct ResolutionNegotiationTracker {
    requests: HashMap<String, Vec<Resolution>>,
}

impl ResolutionNegotiationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, trackable_id: &str, resolution: Resolution) {
        self.requests
            .entry(trackable_id.to_owned())
            .or_default()
            .push(resolution);
    }

    pub fn contains(&self, trackable_id: &str, resolution: &Resolution) -> bool {
        self.outstanding(trackable_id).contains(resolution)
    }

    pub fn is_most_recent(&self, trackable_id: &str, resolution: &Resolution) -> bool {
        self.outstanding(trackable_id).last() == Some(resolution)
    }

    /// Removes the first occurrence. Returns whether anything was removed.
    pub fn remove(&mut self, trackable_id: &str, resolution: &Resolution) -> bool {
        let Some(requests) = self.requests.get_mut(trackable_id) else {
            return false;
        };
        let Some(index) = requests.iter().position(|r| r == resolution) else {
            return false;
        };
        requests.remove(index);
        if requests.is_empty() {
            self.requests.remove(trackable_id);
        }
        true
    }

    pub fn clear(&mut self, trackable_id: &str) {
        self.requests.remove(trackable_id);
    }

    pub fn clear_all(&mut self) {
        self.requests.clear();
    }

    /// Outstanding requests, oldest first.
    pub fn outstanding(&self, trackable_id: &str) -> &[Resolution] {
        self.requests
            .get(trackable_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Reconciles an echoed resolution with the outstanding requests.
    pub fn acknowledge(&mut self, trackable_id: &str, resolution: &Resolution) -> Acknowledgement {
        if self.is_most_recent(trackable_id, resolution) {
            self.clear(trackable_id);
            Acknowledgement::Latest
        } else if self.remove(trackable_id, resolution) {
            Acknowledgement::Stale
        } else {
            Acknowledgement::Unknown
        }
    }
}
