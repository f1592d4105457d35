//! Pipeline notifications.
//!
//! Every subscriber gets its own unbounded channel. Publishing logs the event
//! and then delivers it to each live subscriber; a subscriber that dropped its
//! receiver is pruned without affecting delivery to the others.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Observable pipeline events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// The store crossed the "nearly full" threshold
    DatabaseNearlyFull { size_bytes: u64, max_bytes: u64 },

    /// An insert hit the quota and the overflow chain was applied
    DatabaseFull { strategy: String },

    /// Ingestion stopped because the overflow chain could not free space
    IngestionHalted { pending_samples: usize },

    /// A batch was uploaded and removed from the store
    TransmissionSucceeded { samples: usize, archive: String },

    /// An upload attempt failed; the data stays buffered
    TransmissionFailed { reason: String },
}

impl PipelineEvent {
    fn log(&self) {
        match self {
            PipelineEvent::DatabaseNearlyFull {
                size_bytes,
                max_bytes,
            } => warn!(size_bytes, max_bytes, "Database nearly full"),
            PipelineEvent::DatabaseFull { strategy } => {
                warn!(strategy = %strategy, "Database full, strategy applied")
            }
            PipelineEvent::IngestionHalted { pending_samples } => {
                error!(pending_samples, "Sample ingestion halted")
            }
            PipelineEvent::TransmissionSucceeded { samples, archive } => {
                info!(samples, archive = %archive, "Transmission succeeded")
            }
            PipelineEvent::TransmissionFailed { reason } => {
                warn!(reason = %reason, "Transmission failed")
            }
        }
    }
}

/// Callback-free observer registry.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PipelineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new observer.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PipelineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Log the event and fan it out to every live subscriber.
    pub fn publish(&self, event: PipelineEvent) {
        event.log();
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
