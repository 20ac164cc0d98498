//! Plumbing shared by the session tasks: routing transport events and
//! operation completions back onto a session's serial queue.

use beacon_transport::{TransportError, TransportEvent, TransportEventSink, TransportFuture};
use tokio::sync::mpsc::WeakUnboundedSender;

/// Posts transport events onto a session queue without keeping it alive.
pub(crate) struct QueueSink<M> {
    queue: WeakUnboundedSender<M>,
    wrap: fn(TransportEvent) -> M,
}

impl<M> QueueSink<M> {
    pub(crate) fn new(queue: WeakUnboundedSender<M>, wrap: fn(TransportEvent) -> M) -> Self {
        Self { queue, wrap }
    }
}

impl<M: Send> TransportEventSink for QueueSink<M> {
    fn emit(&self, event: TransportEvent) {
        if let Some(queue) = self.queue.upgrade() {
            let _ = queue.send((self.wrap)(event));
        }
    }
}

/// Drives `future` on its own task and posts its outcome onto the queue.
/// Nothing is spawned if the session is already gone.
pub(crate) fn spawn_completion<T, M, F>(
    queue: &WeakUnboundedSender<M>,
    future: TransportFuture<T>,
    wrap: F,
) where
    T: Send + 'static,
    M: Send + 'static,
    F: FnOnce(Result<T, TransportError>) -> M + Send + 'static,
{
    let Some(queue) = queue.upgrade() else {
        return;
    };
    tokio::spawn(async move {
        let result = future.await;
        let _ = queue.send(wrap(result));
    });
}
