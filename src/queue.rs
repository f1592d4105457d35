//! Bounded event queue between sample producers and the ingestion worker.
//!
//! Producers enqueue without ever waiting; the single consuming worker blocks
//! in [`EventQueue::dequeue`] or [`EventQueue::dequeue_many`] until items
//! arrive or its shutdown signal fires. The receiver lives behind an async
//! mutex so a restarted worker keeps draining the same queue.

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::worker::{Interrupted, Shutdown};

/// Default capacity of the sample queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Errors that can occur when enqueueing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue reached its capacity
    #[error("Queue is full")]
    Full,

    /// The consuming side has been dropped
    #[error("Queue has been closed")]
    Closed,
}

/// Multi-producer, single-consumer queue with a fixed capacity.
pub struct EventQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
}

impl<T: Send> EventQueue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Enqueue an item without waiting.
    ///
    /// Safe to call from any thread, inside or outside the runtime.
    pub fn enqueue(&self, item: T) -> Result<(), QueueError> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Wait for the next item.
    pub async fn dequeue(&self, shutdown: &Shutdown) -> Result<T, Interrupted> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = shutdown.triggered() => Err(Interrupted),
            item = rx.recv() => item.ok_or(Interrupted),
        }
    }

    /// Wait for at least one item, then drain up to `max` of them at once.
    pub async fn dequeue_many(&self, max: usize, shutdown: &Shutdown) -> Result<Vec<T>, Interrupted> {
        let max = max.max(1);
        let mut items = Vec::with_capacity(max.min(256));
        let mut rx = self.rx.lock().await;

        tokio::select! {
            _ = shutdown.triggered() => Err(Interrupted),
            n = rx.recv_many(&mut items, max) => {
                if n == 0 {
                    // Every sender is gone; nothing will ever arrive.
                    return Err(Interrupted);
                }
                debug!(count = n, "Dequeued items");
                Ok(items)
            }
        }
    }

    /// Number of items waiting.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

impl<T: Send> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
