//! Post-migration reconciliation between the record store and the target
//!
//! Read-only on both sides.

use crate::db::rows::{count_rows, fetch_checksums};
use crate::error::IngestResult;
use crate::models::{collection_key, EntityType};
use crate::services::record_store::RecordStore;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};

const CHUNK: usize = 500;

/// Outcome of comparing one collection with its committed rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub entity_type: EntityType,
    pub congress: u32,
    /// Records in the collection
    pub source_count: u64,
    /// Collection records that have a committed row
    pub target_count: u64,
    /// Rows in the target table, across every congress
    pub table_rows: u64,
    /// Source ids with no committed row
    pub mismatched_keys: Vec<String>,
    /// Ids whose committed row was built from a different payload than the
    /// newest record version
    pub checksum_mismatches: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.source_count == self.target_count
            && self.mismatched_keys.is_empty()
            && self.checksum_mismatches.is_empty()
    }
}

/// Compare the records of `entity_type` for `congress` against the target
pub async fn validate(
    pool: &SqlitePool,
    store: &RecordStore,
    entity_type: EntityType,
    congress: u32,
) -> IngestResult<ValidationReport> {
    let key = collection_key(entity_type.collection(), congress);
    let mut records = store.iterate(&key).await?;

    let mut report = ValidationReport {
        entity_type,
        congress,
        source_count: records.len() as u64,
        target_count: 0,
        table_rows: count_rows(pool, entity_type).await? as u64,
        mismatched_keys: Vec::new(),
        checksum_mismatches: Vec::new(),
    };

    loop {
        let chunk = records.next_chunk(CHUNK)?;
        if chunk.is_empty() {
            break;
        }

        let ids: Vec<String> = chunk.iter().map(|r| r.id.clone()).collect();
        let stored = fetch_checksums(pool, entity_type, &ids).await?;

        for record in &chunk {
            match stored.get(&record.id) {
                None => report.mismatched_keys.push(record.id.clone()),
                Some(checksum) => {
                    report.target_count += 1;
                    if *checksum != record.checksum() {
                        report.checksum_mismatches.push(record.id.clone());
                    }
                }
            }
        }
    }

    if report.is_clean() {
        info!(
            entity_type = %entity_type,
            congress,
            source_count = report.source_count,
            target_count = report.target_count,
            "Validation passed"
        );
    } else {
        warn!(
            entity_type = %entity_type,
            congress,
            source_count = report.source_count,
            target_count = report.target_count,
            missing = report.mismatched_keys.len(),
            stale = report.checksum_mismatches.len(),
            "Validation found differences"
        );
    }

    Ok(report)
}
