//! Operator status: record counts and migration progress for one congress

use crate::db::{checkpoints, runs};
use crate::error::IngestResult;
use crate::models::{collection_key, Collection, EntityType, MigrationCheckpoint};
use crate::services::record_store::RecordStore;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

const RECENT_RUNS: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStatus {
    pub collection: Collection,
    pub collection_key: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub congress: u32,
    pub collections: Vec<CollectionStatus>,
    /// One checkpoint per entity type, `NOT_STARTED` when none is stored
    pub checkpoints: Vec<MigrationCheckpoint>,
    pub recent_runs: Vec<runs::MigrationRun>,
}

pub async fn status(pool: &SqlitePool, store: &RecordStore, congress: u32) -> IngestResult<StatusReport> {
    let mut collections = Vec::with_capacity(Collection::ALL.len());
    for collection in Collection::ALL {
        let key = collection_key(collection, congress);
        let index = store.read_index(&key).await?;
        collections.push(CollectionStatus {
            collection,
            collection_key: key,
            records: index.len(),
        });
    }

    let stored = checkpoints::list_checkpoints(pool, congress).await?;
    let checkpoints = EntityType::ALL
        .iter()
        .map(|entity_type| {
            stored
                .iter()
                .find(|c| c.entity_type == *entity_type)
                .cloned()
                .unwrap_or_else(|| MigrationCheckpoint::not_started(*entity_type, congress))
        })
        .collect();

    Ok(StatusReport {
        congress,
        collections,
        checkpoints,
        recent_runs: runs::recent_runs(pool, congress, RECENT_RUNS).await?,
    })
}
