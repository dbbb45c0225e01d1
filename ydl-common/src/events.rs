//! Download lifecycle events and the in-process event bus
//!
//! Observers (HTTP progress endpoints, tests, log bridges) subscribe to the
//! bus; emitters never block and never fail because nobody is listening.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while tasks move through their lifecycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum DownloadEvent {
    /// Task progress string changed
    TaskProgress {
        task_id: i64,
        progress: String,
        timestamp: DateTime<Utc>,
    },

    /// One batch item finished (successfully or not)
    ItemFinished {
        task_id: i64,
        index: i64,
        file_id: String,
        success: bool,
        timestamp: DateTime<Utc>,
    },

    /// A part archive was closed and hashed
    PartCompleted {
        task_id: i64,
        part: usize,
        hash: String,
        timestamp: DateTime<Utc>,
    },

    /// Final archive is ready for pickup
    BatchReady {
        task_id: i64,
        archive_path: String,
        failed: usize,
        timestamp: DateTime<Utc>,
    },

    /// Batch aborted on a fatal error
    BatchFailed {
        task_id: i64,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl DownloadEvent {
    /// Task the event belongs to
    pub fn task_id(&self) -> i64 {
        match self {
            DownloadEvent::TaskProgress { task_id, .. }
            | DownloadEvent::ItemFinished { task_id, .. }
            | DownloadEvent::PartCompleted { task_id, .. }
            | DownloadEvent::BatchReady { task_id, .. }
            | DownloadEvent::BatchFailed { task_id, .. } => *task_id,
        }
    }
}

/// Broadcast bus for [`DownloadEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DownloadEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: DownloadEvent,
    ) -> Result<usize, broadcast::error::SendError<DownloadEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: DownloadEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
