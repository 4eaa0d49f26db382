//! Migration pipeline: record store → relational target
//!
//! Per entity type and congress, records are read in sorted id order and
//! cut into fixed-size batches numbered 1..N. Each batch is one transaction
//! of idempotent upserts. After a batch commits, the checkpoint advances to
//! its sequence number, and a later run skips every batch at or below the
//! checkpoint. A crash between commit and checkpoint update means the batch
//! is committed again on the next run, which the upserts make harmless.
//!
//! The checkpoint is a contiguous watermark: once a batch fails (or loses
//! records to the transform), later batches still commit but the checkpoint
//! stays put, so the next run retries from the first incomplete batch.

pub mod transform;
pub mod writer;

use crate::db::{checkpoints, runs};
use crate::error::{IngestError, IngestResult};
use crate::models::{
    collection_key, EntityType, MigrationBatch, MigrationCheckpoint, MigrationState,
    MigrationSummary,
};
use crate::services::backoff::BackoffPolicy;
use crate::services::record_store::RecordStore;
use crate::utils::retry_transaction;
use chrono::Utc;
use legis_common::config::MigrationConfig;
use legis_common::events::{EventBus, PipelineEvent};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub use transform::transform;
pub use writer::{write_batch, BatchWrite};

/// Outcome of one entity type within `migrate_all`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMigrationOutcome {
    pub entity_type: EntityType,
    pub summary: Option<MigrationSummary>,
    /// Run-level failure, including prerequisites that did not complete
    pub error: Option<String>,
}

enum BatchOutcome {
    /// Committed; `complete` is false when the transform rejected records
    Committed { complete: bool },
    Failed,
    Cancelled,
}

/// Marks an entity type as migrating until dropped
struct ActiveGuard {
    active: Arc<Mutex<HashSet<EntityType>>>,
    entity_type: EntityType,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.entity_type);
    }
}

/// Migrates record collections into the target database
#[derive(Clone)]
pub struct MigrationPipeline {
    pool: SqlitePool,
    store: RecordStore,
    event_bus: EventBus,
    batch_size: usize,
    policy: BackoffPolicy,
    active: Arc<Mutex<HashSet<EntityType>>>,
}

impl MigrationPipeline {
    pub fn new(
        pool: SqlitePool,
        store: RecordStore,
        event_bus: EventBus,
        config: &MigrationConfig,
    ) -> Self {
        Self {
            pool,
            store,
            event_bus,
            batch_size: config.batch_size.max(1),
            policy: BackoffPolicy::for_migration(config),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Fail with `ReferentialOrderViolation` unless every prerequisite of
    /// `entity_type` has completed for `congress`
    pub async fn check_prerequisites(&self, entity_type: EntityType, congress: u32) -> IngestResult<()> {
        for prerequisite in entity_type.prerequisites() {
            let state = checkpoints::load_state(&self.pool, *prerequisite, congress).await?;
            if state != MigrationState::Completed {
                return Err(IngestError::ReferentialOrderViolation {
                    entity: entity_type.to_string(),
                    prerequisite: prerequisite.to_string(),
                    state: state.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Migrate one entity type of one congress
    pub async fn migrate(
        &self,
        entity_type: EntityType,
        congress: u32,
        cancel: &CancellationToken,
    ) -> IngestResult<MigrationSummary> {
        let _guard = self.claim(entity_type)?;

        // Fails before any write
        self.check_prerequisites(entity_type, congress).await?;

        let key = collection_key(entity_type.collection(), congress);
        let records = self.store.iterate(&key).await?;
        let source_count = records.len() as u64;

        let mut checkpoint = checkpoints::load_checkpoint(&self.pool, entity_type, congress)
            .await?
            .unwrap_or_else(|| MigrationCheckpoint::not_started(entity_type, congress));

        if checkpoint.last_committed_sequence_number > 0 && checkpoint.source_count != source_count {
            warn!(
                entity_type = %entity_type,
                congress,
                checkpoint_count = checkpoint.source_count,
                source_count,
                "Source count changed since checkpoint, batch boundaries moved; replaying from the start"
            );
            checkpoint.last_committed_sequence_number = 0;
        }

        let run_id = Uuid::new_v4();
        let mut summary = MigrationSummary::new(run_id, entity_type, congress);
        runs::start_run(&self.pool, run_id, entity_type, congress, Utc::now()).await?;

        checkpoint.state = MigrationState::InProgress;
        checkpoint.source_count = source_count;
        checkpoint.updated_at = Utc::now();
        self.save_checkpoint(&checkpoint, cancel).await?;

        info!(
            run_id = %run_id,
            entity_type = %entity_type,
            congress,
            source_count,
            batch_size = self.batch_size,
            resume_after = checkpoint.last_committed_sequence_number,
            "Migration starting"
        );

        let result = self
            .run_batches(records, &mut checkpoint, &mut summary, cancel)
            .await;

        summary.state = match &result {
            Err(_) => MigrationState::InProgress,
            Ok(()) if summary.cancelled => MigrationState::InProgress,
            Ok(()) if !summary.failed_batches.is_empty() || summary.failed > 0 => {
                MigrationState::PartiallyFailed
            }
            Ok(()) => MigrationState::Completed,
        };

        checkpoint.state = summary.state;
        checkpoint.updated_at = Utc::now();
        let saved = self.save_checkpoint(&checkpoint, cancel).await;
        if let Err(e) = runs::finish_run(&self.pool, &summary).await {
            warn!(run_id = %run_id, error = %e, "Failed to close migration run log entry");
        }

        self.event_bus.emit_lossy(PipelineEvent::MigrationFinished {
            entity_type: entity_type.to_string(),
            committed: summary.committed,
            failed: summary.failed,
            skipped_already_committed: summary.skipped_already_committed,
            timestamp: Utc::now(),
        });

        result?;
        saved?;

        info!(
            run_id = %run_id,
            entity_type = %entity_type,
            congress,
            state = %summary.state,
            committed = summary.committed,
            failed = summary.failed,
            skipped = summary.skipped_already_committed,
            dangling = summary.dangling_references,
            "Migration finished"
        );
        Ok(summary)
    }

    /// Migrate every entity type, level by level
    ///
    /// Types within one dependency level run concurrently. A type whose
    /// prerequisite did not complete is reported with a
    /// `ReferentialOrderViolation` error instead of being migrated.
    pub async fn migrate_all(
        &self,
        congress: u32,
        cancel: &CancellationToken,
    ) -> Vec<EntityMigrationOutcome> {
        let mut outcomes = Vec::new();

        for level in EntityType::levels() {
            if cancel.is_cancelled() {
                break;
            }

            let results = futures::future::join_all(level.iter().map(|entity_type| async move {
                (*entity_type, self.migrate(*entity_type, congress, cancel).await)
            }))
            .await;

            for (entity_type, result) in results {
                let outcome = match result {
                    Ok(summary) => EntityMigrationOutcome {
                        entity_type,
                        summary: Some(summary),
                        error: None,
                    },
                    Err(e) => {
                        error!(entity_type = %entity_type, congress, error = %e, "Entity migration did not run to completion");
                        EntityMigrationOutcome {
                            entity_type,
                            summary: None,
                            error: Some(e.to_string()),
                        }
                    }
                };
                outcomes.push(outcome);
            }
        }

        outcomes
    }

    async fn run_batches(
        &self,
        mut records: crate::services::record_store::RecordIter,
        checkpoint: &mut MigrationCheckpoint,
        summary: &mut MigrationSummary,
        cancel: &CancellationToken,
    ) -> IngestResult<()> {
        let total = records.len();
        let total_batches = total.div_ceil(self.batch_size) as u64;
        let resume_after = checkpoint.last_committed_sequence_number;
        let mut watermark_open = true;

        for sequence_number in 1..=total_batches {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let offset = (sequence_number as usize - 1) * self.batch_size;
            let batch_len = self.batch_size.min(total - offset);

            if sequence_number <= resume_after {
                records.skip_records(batch_len);
                summary.skipped_already_committed += batch_len;
                continue;
            }

            let batch = MigrationBatch {
                entity_type: checkpoint.entity_type,
                sequence_number,
                records: records.next_chunk(batch_len)?,
            };

            match self.commit_batch(&batch, summary, cancel).await {
                BatchOutcome::Committed { complete } if watermark_open && complete => {
                    checkpoint.last_committed_sequence_number = sequence_number;
                    checkpoint.updated_at = Utc::now();
                    self.save_checkpoint(checkpoint, cancel).await?;
                    self.event_bus.emit_lossy(PipelineEvent::CheckpointAdvanced {
                        entity_type: checkpoint.entity_type.to_string(),
                        sequence_number,
                    });
                }
                BatchOutcome::Committed { .. } | BatchOutcome::Failed => watermark_open = false,
                BatchOutcome::Cancelled => {
                    summary.cancelled = true;
                    break;
                }
            }
        }

        Ok(())
    }

    async fn commit_batch(
        &self,
        batch: &MigrationBatch,
        summary: &mut MigrationSummary,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let mut rows = Vec::with_capacity(batch.records.len());
        let mut rejected = 0;
        for record in &batch.records {
            match transform(batch.entity_type, record) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    warn!(
                        entity_type = %batch.entity_type,
                        sequence_number = batch.sequence_number,
                        error = %e,
                        "Record rejected by transform"
                    );
                    rejected += 1;
                }
            }
        }
        summary.failed += rejected;

        let result = retry_transaction("migration batch", &self.policy, cancel, || {
            write_batch(&self.pool, &rows)
        })
        .await;

        match result {
            Ok(write) => {
                summary.committed += write.rows;
                summary.dangling_references += write.dangling_references;
                summary.batches_committed += 1;
                info!(
                    entity_type = %batch.entity_type,
                    sequence_number = batch.sequence_number,
                    rows = write.rows,
                    "Batch committed"
                );
                self.event_bus.emit_lossy(PipelineEvent::BatchCommitted {
                    entity_type: batch.entity_type.to_string(),
                    sequence_number: batch.sequence_number,
                    rows: write.rows,
                });
                BatchOutcome::Committed {
                    complete: rejected == 0,
                }
            }
            Err(IngestError::Cancelled) => BatchOutcome::Cancelled,
            Err(e) => {
                error!(
                    entity_type = %batch.entity_type,
                    sequence_number = batch.sequence_number,
                    records = batch.records.len(),
                    error = %e,
                    "Batch failed, continuing with next batch"
                );
                summary.failed += rows.len();
                summary.failed_batches.push(batch.sequence_number);

                let failed = runs::FailedBatch {
                    run_id: summary.run_id,
                    entity_type: batch.entity_type.to_string(),
                    congress: summary.congress,
                    sequence_number: batch.sequence_number,
                    record_ids: batch.record_ids(),
                    error: e.to_string(),
                    failed_at: Utc::now(),
                };
                if let Err(log_err) = runs::record_failed_batch(&self.pool, &failed).await {
                    warn!(error = %log_err, "Could not record failed batch");
                }

                self.event_bus.emit_lossy(PipelineEvent::BatchFailed {
                    entity_type: batch.entity_type.to_string(),
                    sequence_number: batch.sequence_number,
                    message: e.to_string(),
                });
                BatchOutcome::Failed
            }
        }
    }

    async fn save_checkpoint(
        &self,
        checkpoint: &MigrationCheckpoint,
        cancel: &CancellationToken,
    ) -> IngestResult<()> {
        retry_transaction("checkpoint update", &self.policy, cancel, || {
            checkpoints::save_checkpoint(&self.pool, checkpoint)
        })
        .await
    }

    fn claim(&self, entity_type: EntityType) -> IngestResult<ActiveGuard> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(entity_type) {
            return Err(IngestError::MigrationInProgress(entity_type.to_string()));
        }
        Ok(ActiveGuard {
            active: self.active.clone(),
            entity_type,
        })
    }
}
