//! Pipeline progress events
//!
//! Fetch and migration runs publish progress on a broadcast channel so a
//! CLI progress line, a log sink, or a test can observe them. Emission is
//! lossy: a run never blocks or fails because nobody is listening.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Progress event emitted by the fetch and migration pipelines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// A fetch run started for a collection
    FetchRunStarted {
        collection_key: String,
        planned: usize,
        timestamp: DateTime<Utc>,
    },
    /// One unit was fetched and durably recorded
    UnitFetched {
        collection_key: String,
        key: String,
        attempt: u32,
    },
    /// One unit was abandoned after a permanent failure
    UnitFailed {
        collection_key: String,
        key: String,
        http_status: u16,
        message: String,
    },
    /// A fetch run ended (normally, cancelled, or aborted)
    FetchRunFinished {
        collection_key: String,
        fetched: usize,
        skipped: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },
    /// A migration batch transaction committed
    BatchCommitted {
        entity_type: String,
        sequence_number: u64,
        rows: usize,
    },
    /// A migration batch was given up on
    BatchFailed {
        entity_type: String,
        sequence_number: u64,
        message: String,
    },
    /// The migration checkpoint moved forward
    CheckpointAdvanced {
        entity_type: String,
        sequence_number: u64,
    },
    /// A migration run ended
    MigrationFinished {
        entity_type: String,
        committed: usize,
        failed: usize,
        skipped_already_committed: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for [`PipelineEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per slow subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring the absence of subscribers
    pub fn emit_lossy(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
