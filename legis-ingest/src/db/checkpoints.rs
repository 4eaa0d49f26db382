//! Migration checkpoint persistence (`ops_migration_checkpoints`)

use crate::error::{IngestError, IngestResult};
use crate::models::{EntityType, MigrationCheckpoint, MigrationState};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

/// Load the checkpoint of one entity type and congress
pub async fn load_checkpoint(
    pool: &SqlitePool,
    entity_type: EntityType,
    congress: u32,
) -> IngestResult<Option<MigrationCheckpoint>> {
    let row = sqlx::query(
        r#"
        SELECT state, last_committed_sequence, source_count, updated_at
        FROM ops_migration_checkpoints
        WHERE entity_type = ? AND congress = ?
        "#,
    )
    .bind(entity_type.as_str())
    .bind(congress as i64)
    .fetch_optional(pool)
    .await?;

    row.map(|row| -> IngestResult<MigrationCheckpoint> {
        let state: String = row.get("state");
        let last: i64 = row.get("last_committed_sequence");
        let source_count: i64 = row.get("source_count");
        let updated_at: String = row.get("updated_at");

        Ok(MigrationCheckpoint {
            entity_type,
            congress,
            state: state.parse::<MigrationState>().map_err(|e| {
                IngestError::Common(legis_common::Error::Internal(format!(
                    "checkpoint {}/{}: {}",
                    entity_type, congress, e
                )))
            })?,
            last_committed_sequence_number: last.max(0) as u64,
            source_count: source_count.max(0) as u64,
            updated_at: parse_timestamp(&updated_at)?,
        })
    })
    .transpose()
}

/// Checkpoint state of an entity type, `NotStarted` when no row exists
pub async fn load_state(
    pool: &SqlitePool,
    entity_type: EntityType,
    congress: u32,
) -> IngestResult<MigrationState> {
    Ok(load_checkpoint(pool, entity_type, congress)
        .await?
        .map_or(MigrationState::NotStarted, |c| c.state))
}

/// Insert or replace a checkpoint
pub async fn save_checkpoint(pool: &SqlitePool, checkpoint: &MigrationCheckpoint) -> IngestResult<()> {
    sqlx::query(
        r#"
        INSERT INTO ops_migration_checkpoints (
            entity_type, congress, state, last_committed_sequence, source_count, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(entity_type, congress) DO UPDATE SET
            state = excluded.state,
            last_committed_sequence = excluded.last_committed_sequence,
            source_count = excluded.source_count,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(checkpoint.entity_type.as_str())
    .bind(checkpoint.congress as i64)
    .bind(checkpoint.state.as_str())
    .bind(checkpoint.last_committed_sequence_number as i64)
    .bind(checkpoint.source_count as i64)
    .bind(checkpoint.updated_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// All checkpoints of one congress, in dependency order
pub async fn list_checkpoints(pool: &SqlitePool, congress: u32) -> IngestResult<Vec<MigrationCheckpoint>> {
    let mut checkpoints = Vec::new();
    for entity_type in EntityType::ALL {
        if let Some(checkpoint) = load_checkpoint(pool, entity_type, congress).await? {
            checkpoints.push(checkpoint);
        }
    }
    Ok(checkpoints)
}

pub(crate) fn parse_timestamp(value: &str) -> IngestResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            IngestError::Common(legis_common::Error::Internal(format!(
                "Failed to parse timestamp {:?}: {}",
                value, e
            )))
        })
}
