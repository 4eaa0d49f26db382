//! Fetch run summary

use serde::{Deserialize, Serialize};

/// A unit that was abandoned during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub key: String,
    pub http_status: u16,
    pub attempts: u32,
    pub message: String,
}

/// Counts of a fetch run; partial success is the normal outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub collection_key: String,
    pub fetched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<FailedUnit>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn new(collection_key: impl Into<String>) -> Self {
        Self {
            collection_key: collection_key.into(),
            ..Default::default()
        }
    }

    pub fn record_failure(&mut self, failure: FailedUnit) {
        self.failed += 1;
        self.failures.push(failure);
    }

    /// Fold the counts of a restarted attempt of the same run into this one
    pub fn absorb(&mut self, other: RunSummary) {
        self.fetched += other.fetched;
        self.failed += other.failed;
        self.failures.extend(other.failures);
        self.cancelled |= other.cancelled;
    }
}
