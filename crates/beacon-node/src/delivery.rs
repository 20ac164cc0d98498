use std::collections::{HashMap, VecDeque};

use beacon_core::geo::distance_m;
use beacon_core::{Location, LocationUpdate, Resolution};

use crate::config::DeliveryRetryPolicy;

/// Anything that can be ordered inside the skipped-locations buffer.
pub trait Timestamped {
    fn timestamp_ms(&self) -> f64;
}

impl Timestamped for LocationUpdate {
    fn timestamp_ms(&self) -> f64 {
        self.location.timestamp_ms
    }
}

impl Timestamped for Location {
    fn timestamp_ms(&self) -> f64 {
        self.timestamp_ms
    }
}

#[derive(Debug)]
struct TrackableDelivery<U> {
    retry_count: u32,
    /// Token of the send currently in flight.
    in_flight: Option<u64>,
    waiting: VecDeque<U>,
    skipped: Vec<U>,
}

impl<U> Default for TrackableDelivery<U> {
    fn default() -> Self {
        Self {
            retry_count: 0,
            in_flight: None,
            waiting: VecDeque::new(),
            skipped: Vec::new(),
        }
    }
}

/// Result of reporting a failed send.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome<U> {
    /// Send `update` again; `attempt` is the retry number (1-based).
    Retry { update: U, attempt: u32 },
    /// Retries are used up. The update went to the skipped buffer, pending was
    /// cleared, and `next` is the oldest waiting update, if any.
    Exhausted { attempts: u32, next: Option<U> },
}

/// Per-trackable delivery bookkeeping: single in-flight send, FIFO waiting
/// queue, bounded retries, and a bounded timestamp-ordered skipped buffer.
///
/// Every send gets a token that is never reused by the same state, so a
/// completion can be matched against the send it belongs to even after the
/// trackable was removed and added again.
#[derive(Debug)]
pub struct DeliveryState<U> {
    policy: DeliveryRetryPolicy,
    entries: HashMap<String, TrackableDelivery<U>>,
    next_send: u64,
}

impl<U> Default for DeliveryState<U> {
    fn default() -> Self {
        Self::new(DeliveryRetryPolicy::default())
    }
}

impl<U> DeliveryState<U> {
    pub fn new(policy: DeliveryRetryPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
            next_send: 0,
        }
    }

    pub fn policy(&self) -> DeliveryRetryPolicy {
        self.policy
    }

    fn entry(&mut self, trackable_id: &str) -> &mut TrackableDelivery<U> {
        self.entries.entry(trackable_id.to_owned()).or_default()
    }

    /// Initializes the retry counter if needed and reports whether another
    /// attempt is allowed.
    pub fn should_retry(&mut self, trackable_id: &str) -> bool {
        let max_retry_count = self.policy.max_retry_count;
        self.entry(trackable_id).retry_count < max_retry_count
    }

    pub fn increment_retry(&mut self, trackable_id: &str) {
        self.entry(trackable_id).retry_count += 1;
    }

    pub fn reset_retry(&mut self, trackable_id: &str) {
        if let Some(entry) = self.entries.get_mut(trackable_id) {
            entry.retry_count = 0;
        }
    }

    pub fn retry_count(&self, trackable_id: &str) -> u32 {
        self.entries
            .get(trackable_id)
            .map_or(0, |entry| entry.retry_count)
    }

    /// Marks a send as in flight and returns its token.
    pub fn mark_pending(&mut self, trackable_id: &str) -> u64 {
        self.next_send += 1;
        let send = self.next_send;
        self.entry(trackable_id).in_flight = Some(send);
        send
    }

    /// Clears the in-flight send and the retry counter.
    pub fn unmark_pending(&mut self, trackable_id: &str) {
        if let Some(entry) = self.entries.get_mut(trackable_id) {
            entry.in_flight = None;
            entry.retry_count = 0;
        }
    }

    pub fn has_pending(&self, trackable_id: &str) -> bool {
        self.entries
            .get(trackable_id)
            .is_some_and(|entry| entry.in_flight.is_some())
    }

    /// Whether `send` is the trackable's current in-flight send.
    pub fn is_in_flight(&self, trackable_id: &str, send: u64) -> bool {
        self.entries
            .get(trackable_id)
            .is_some_and(|entry| entry.in_flight == Some(send))
    }

    pub fn enqueue_waiting(&mut self, trackable_id: &str, update: U) {
        self.entry(trackable_id).waiting.push_back(update);
    }

    pub fn dequeue_next_waiting(&mut self, trackable_id: &str) -> Option<U> {
        self.entries.get_mut(trackable_id)?.waiting.pop_front()
    }

    pub fn waiting_len(&self, trackable_id: &str) -> usize {
        self.entries
            .get(trackable_id)
            .map_or(0, |entry| entry.waiting.len())
    }

    pub fn clear_skipped(&mut self, trackable_id: &str) {
        if let Some(entry) = self.entries.get_mut(trackable_id) {
            entry.skipped.clear();
        }
    }

    /// Skipped updates in ascending timestamp order.
    pub fn list_skipped(&self, trackable_id: &str) -> &[U] {
        self.entries
            .get(trackable_id)
            .map(|entry| entry.skipped.as_slice())
            .unwrap_or_default()
    }

    /// Drops all bookkeeping for one trackable.
    pub fn remove(&mut self, trackable_id: &str) {
        self.entries.remove(trackable_id);
    }

    pub fn remove_all(&mut self) {
        self.entries.clear();
    }
}

impl<U: Timestamped> DeliveryState<U> {
    /// Adds to the skipped buffer, keeping it sorted and evicting the oldest
    /// entries beyond capacity.
    pub fn record_skipped(&mut self, trackable_id: &str, update: U) {
        let capacity = self.policy.max_skipped_locations;
        let skipped = &mut self.entry(trackable_id).skipped;
        skipped.push(update);
        skipped.sort_by(|a, b| a.timestamp_ms().total_cmp(&b.timestamp_ms()));
        while skipped.len() > capacity {
            skipped.remove(0);
        }
    }

    /// Success path: clears pending, retry counter and skipped buffer, and
    /// hands back the next waiting update.
    pub fn complete_success(&mut self, trackable_id: &str) -> Option<U> {
        self.unmark_pending(trackable_id);
        self.clear_skipped(trackable_id);
        self.dequeue_next_waiting(trackable_id)
    }

    /// Failure path for the in-flight `update`.
    pub fn complete_failure(&mut self, trackable_id: &str, update: U) -> FailureOutcome<U> {
        if self.should_retry(trackable_id) {
            self.increment_retry(trackable_id);
            return FailureOutcome::Retry {
                update,
                attempt: self.retry_count(trackable_id),
            };
        }
        let attempts = self.retry_count(trackable_id) + 1;
        self.unmark_pending(trackable_id);
        self.record_skipped(trackable_id, update);
        FailureOutcome::Exhausted {
            attempts,
            next: self.dequeue_next_waiting(trackable_id),
        }
    }
}

/// Whether a fix differs enough from the last sent one to be worth sending.
///
/// Always true until both a previous location and a resolution exist.
pub fn should_send_location(
    location: &Location,
    last_sent: Option<&Location>,
    resolution: Option<&Resolution>,
) -> bool {
    let (Some(last_sent), Some(resolution)) = (last_sent, resolution) else {
        return true;
    };
    let displacement = distance_m(last_sent.coordinate, location.coordinate);
    let elapsed_ms = location.timestamp_ms - last_sent.timestamp_ms;
    displacement >= resolution.minimum_displacement_m
        || elapsed_ms >= resolution.desired_interval_ms as f64
}
