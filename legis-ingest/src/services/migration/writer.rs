//! Batch writer: one transaction per migration batch

use crate::db::rows::{upsert_row, TargetRow};
use crate::error::IngestResult;
use crate::utils::begin_monitored;
use chrono::Utc;
use sqlx::SqlitePool;

/// Outcome of a committed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchWrite {
    pub rows: usize,
    /// References dropped or nulled because the referenced row is absent
    pub dangling_references: usize,
}

/// Upsert all rows in a single transaction
///
/// Either every row is committed or none is: any error drops the
/// transaction, which rolls it back.
pub async fn write_batch(pool: &SqlitePool, rows: &[TargetRow]) -> IngestResult<BatchWrite> {
    let migrated_at = Utc::now().to_rfc3339();
    let mut tx = begin_monitored(pool, "migration::write_batch").await?;

    let mut dangling_references = 0;
    for row in rows {
        dangling_references += upsert_row(&mut **tx.inner_mut()?, row, &migrated_at).await?;
    }

    tx.commit().await?;
    Ok(BatchWrite {
        rows: rows.len(),
        dangling_references,
    })
}
