use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use beacon_core::{LocationUpdate, Resolution, TrackableState};
use beacon_transport::TransportError;
use tokio::sync::mpsc;

use crate::error::SessionError;

/// Notifications delivered to publisher listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum PublisherEvent {
    /// Location-engine resolution merged over every trackable.
    ResolutionChanged(Resolution),
    TrackableResolutionChanged {
        trackable_id: String,
        resolution: Resolution,
    },
    TrackableStateChanged {
        trackable_id: String,
        state: TrackableState,
    },
    DeliverySucceeded {
        trackable_id: String,
        /// Skipped locations attached to the delivered update.
        skipped_locations: usize,
    },
    DeliveryFailed {
        trackable_id: String,
        attempts: u32,
        error: TransportError,
    },
    Error(SessionError),
}

/// Notifications delivered to subscriber listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberEvent {
    TrackableStateChanged(TrackableState),
    PublisherVisibilityChanged(bool),
    ResolutionReceived(Resolution),
    DesiredIntervalReceived(u64),
    LocationReceived(LocationUpdate),
    /// An unprocessed fix from a publisher with raw locations enabled.
    RawLocationReceived(LocationUpdate),
    /// The most recent locally requested resolution was echoed back.
    ResolutionRequestConfirmed(Resolution),
}

/// Receiver of session events. Closures taking the event by value qualify.
pub trait EventListener<E>: Send {
    fn on_event(&mut self, event: E);
}

impl<E, F> EventListener<E> for F
where
    F: FnMut(E) + Send,
{
    fn on_event(&mut self, event: E) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

enum Dispatch<E> {
    Register(ListenerId, Box<dyn EventListener<E>>),
    Unregister(ListenerId),
    Event(E),
}

/// Public callback context: a dedicated task that owns the registered
/// listeners and delivers events to them in submission order.
pub struct CallbackDispatcher<E> {
    tx: mpsc::UnboundedSender<Dispatch<E>>,
    next_id: Arc<AtomicU64>,
}

impl<E> Clone for CallbackDispatcher<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<E: Clone + Send + 'static> CallbackDispatcher<E> {
    /// Spawns the dispatch task on the current tokio runtime. The task ends
    /// once every clone is dropped.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatcher(rx));
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn register(&self, listener: impl EventListener<E> + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _ = self.tx.send(Dispatch::Register(id, Box::new(listener)));
        id
    }

    pub fn unregister(&self, id: ListenerId) {
        let _ = self.tx.send(Dispatch::Unregister(id));
    }

    pub fn dispatch(&self, event: E) {
        let _ = self.tx.send(Dispatch::Event(event));
    }
}

async fn run_dispatcher<E: Clone>(mut rx: mpsc::UnboundedReceiver<Dispatch<E>>) {
    let mut listeners: BTreeMap<ListenerId, Box<dyn EventListener<E>>> = BTreeMap::new();
    while let Some(command) = rx.recv().await {
        match command {
            Dispatch::Register(id, listener) => {
                listeners.insert(id, listener);
            }
            Dispatch::Unregister(id) => {
                listeners.remove(&id);
            }
            Dispatch::Event(event) => {
                for listener in listeners.values_mut() {
                    listener.on_event(event.clone());
                }
            }
        }
    }
}
