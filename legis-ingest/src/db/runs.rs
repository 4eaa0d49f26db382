//! Migration run log (`ops_migration_runs`) and failed batch log
//! (`ops_failed_batches`)

use crate::db::checkpoints::parse_timestamp;
use crate::error::IngestResult;
use crate::models::{EntityType, MigrationState, MigrationSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// One row of the run log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRun {
    pub run_id: Uuid,
    pub entity_type: String,
    pub congress: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub rows_migrated: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
}

/// A batch given up on, kept for operator follow-up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedBatch {
    pub run_id: Uuid,
    pub entity_type: String,
    pub congress: u32,
    pub sequence_number: u64,
    pub record_ids: Vec<String>,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

pub async fn start_run(
    pool: &SqlitePool,
    run_id: Uuid,
    entity_type: EntityType,
    congress: u32,
    started_at: DateTime<Utc>,
) -> IngestResult<()> {
    sqlx::query(
        r#"
        INSERT INTO ops_migration_runs (run_id, entity_type, congress, started_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(run_id.to_string())
    .bind(entity_type.as_str())
    .bind(congress as i64)
    .bind(started_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn finish_run(pool: &SqlitePool, summary: &MigrationSummary) -> IngestResult<()> {
    sqlx::query(
        r#"
        UPDATE ops_migration_runs
        SET ended_at = ?, success = ?, rows_migrated = ?, batches_committed = ?, batches_failed = ?
        WHERE run_id = ?
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .bind(summary.state == MigrationState::Completed)
    .bind(summary.committed as i64)
    .bind(summary.batches_committed as i64)
    .bind(summary.failed_batches.len() as i64)
    .bind(summary.run_id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Most recent runs, newest first
pub async fn recent_runs(pool: &SqlitePool, congress: u32, limit: u32) -> IngestResult<Vec<MigrationRun>> {
    let rows = sqlx::query(
        r#"
        SELECT run_id, entity_type, congress, started_at, ended_at, success,
               rows_migrated, batches_committed, batches_failed
        FROM ops_migration_runs
        WHERE congress = ?
        ORDER BY started_at DESC
        LIMIT ?
        "#,
    )
    .bind(congress as i64)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| -> IngestResult<MigrationRun> {
            let run_id: String = row.get("run_id");
            let started_at: String = row.get("started_at");
            let ended_at: Option<String> = row.get("ended_at");
            Ok(MigrationRun {
                run_id: Uuid::parse_str(&run_id).map_err(|e| {
                    legis_common::Error::Internal(format!("Bad run_id {:?}: {}", run_id, e))
                })?,
                entity_type: row.get("entity_type"),
                congress: row.get::<i64, _>("congress") as u32,
                started_at: parse_timestamp(&started_at)?,
                ended_at: ended_at.as_deref().map(parse_timestamp).transpose()?,
                success: row.get("success"),
                rows_migrated: row.get::<i64, _>("rows_migrated") as u64,
                batches_committed: row.get::<i64, _>("batches_committed") as u64,
                batches_failed: row.get::<i64, _>("batches_failed") as u64,
            })
        })
        .collect()
}

pub async fn record_failed_batch(pool: &SqlitePool, batch: &FailedBatch) -> IngestResult<()> {
    let record_ids = serde_json::to_string(&batch.record_ids)?;
    sqlx::query(
        r#"
        INSERT INTO ops_failed_batches (
            run_id, entity_type, congress, sequence_number, record_ids, error, failed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(run_id, sequence_number) DO UPDATE SET
            record_ids = excluded.record_ids,
            error = excluded.error,
            failed_at = excluded.failed_at
        "#,
    )
    .bind(batch.run_id.to_string())
    .bind(&batch.entity_type)
    .bind(batch.congress as i64)
    .bind(batch.sequence_number as i64)
    .bind(record_ids)
    .bind(&batch.error)
    .bind(batch.failed_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Failed batches of one entity type and congress, oldest first
pub async fn list_failed_batches(
    pool: &SqlitePool,
    entity_type: EntityType,
    congress: u32,
) -> IngestResult<Vec<FailedBatch>> {
    let rows = sqlx::query(
        r#"
        SELECT run_id, entity_type, congress, sequence_number, record_ids, error, failed_at
        FROM ops_failed_batches
        WHERE entity_type = ? AND congress = ?
        ORDER BY failed_at, sequence_number
        "#,
    )
    .bind(entity_type.as_str())
    .bind(congress as i64)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| -> IngestResult<FailedBatch> {
            let run_id: String = row.get("run_id");
            let record_ids: String = row.get("record_ids");
            let failed_at: String = row.get("failed_at");
            Ok(FailedBatch {
                run_id: Uuid::parse_str(&run_id).map_err(|e| {
                    legis_common::Error::Internal(format!("Bad run_id {:?}: {}", run_id, e))
                })?,
                entity_type: row.get("entity_type"),
                congress: row.get::<i64, _>("congress") as u32,
                sequence_number: row.get::<i64, _>("sequence_number") as u64,
                record_ids: serde_json::from_str(&record_ids)?,
                error: row.get("error"),
                failed_at: parse_timestamp(&failed_at)?,
            })
        })
        .collect()
}
