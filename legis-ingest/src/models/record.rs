//! File-tier records and per-collection indexes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// One persisted upstream entity
///
/// Immutable once written: a re-fetch creates a new version file instead of
/// rewriting this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub collection_key: String,
    pub id: String,
    pub payload: Value,
    pub fetched_at: DateTime<Utc>,
    /// Attempts the fetch needed
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    /// 1 for the first write of an id, incremented by every re-fetch
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_attempt() -> u32 {
    1
}

fn default_version() -> u32 {
    1
}

impl Record {
    pub fn new(collection_key: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        Self {
            collection_key: collection_key.into(),
            id: id.into(),
            payload,
            fetched_at: Utc::now(),
            attempt: 1,
            version: 1,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Hex SHA-256 of the canonical payload encoding
    pub fn checksum(&self) -> String {
        let bytes = serde_json::to_vec(&self.payload).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// The set of ids known to be durably recorded for one collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionIndex {
    pub collection_key: String,
    pub known_ids: BTreeSet<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl CollectionIndex {
    pub fn new(collection_key: impl Into<String>) -> Self {
        Self {
            collection_key: collection_key.into(),
            known_ids: BTreeSet::new(),
            last_updated: None,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.known_ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.known_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known_ids.is_empty()
    }

    /// Add an id; returns false if it was already known
    pub fn insert(&mut self, id: impl Into<String>, at: DateTime<Utc>) -> bool {
        let added = self.known_ids.insert(id.into());
        if added {
            self.last_updated = Some(self.last_updated.map_or(at, |prev| prev.max(at)));
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checksum_is_stable_and_content_sensitive() {
        let a = Record::new("bill-118", "118-hr-1", json!({"title": "A"}));
        let b = Record::new("bill-118", "118-hr-1", json!({"title": "A"}));
        let c = Record::new("bill-118", "118-hr-1", json!({"title": "B"}));
        assert_eq!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), c.checksum());
        assert_eq!(a.checksum().len(), 64);
    }

    #[test]
    fn test_index_insert_is_append_only() {
        let mut index = CollectionIndex::new("vote-118");
        let now = Utc::now();
        assert!(index.insert("118-1-1", now));
        assert!(!index.insert("118-1-1", now));
        assert_eq!(index.len(), 1);
        assert_eq!(index.last_updated, Some(now));
    }
}
