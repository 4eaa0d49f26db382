//! Connection pool monitoring utilities
//!
//! Instrumented transactions that log how long a pooled connection was held,
//! for diagnosing pool saturation during long migration runs.

use crate::error::{IngestError, IngestResult};
use sqlx::{Sqlite, Transaction};
use std::time::Instant;

/// Transaction wrapper that logs acquisition and release timing
pub struct MonitoredTransaction<'c> {
    tx: Option<Transaction<'c, Sqlite>>,
    caller: &'static str,
    acquired_at: Instant,
}

impl<'c> MonitoredTransaction<'c> {
    fn new(tx: Transaction<'c, Sqlite>, caller: &'static str, acquired_at: Instant) -> Self {
        Self {
            tx: Some(tx),
            caller,
            acquired_at,
        }
    }

    /// Commit the transaction and log release timing
    pub async fn commit(mut self) -> IngestResult<()> {
        let held_ms = self.acquired_at.elapsed().as_millis() as u64;
        let tx = self.take()?;
        tx.commit().await?;

        if held_ms > 2000 {
            tracing::warn!(
                caller = self.caller,
                held_ms,
                "LONG TRANSACTION - connection held for extended period, may contribute to pool saturation"
            );
        } else {
            tracing::debug!(caller = self.caller, held_ms, "Connection released (commit)");
        }
        Ok(())
    }

    /// The inner transaction, for executing statements
    pub fn inner_mut(&mut self) -> IngestResult<&mut Transaction<'c, Sqlite>> {
        let caller = self.caller;
        self.tx
            .as_mut()
            .ok_or_else(|| IngestError::Other(anyhow::anyhow!("{}: transaction already consumed", caller)))
    }

    fn take(&mut self) -> IngestResult<Transaction<'c, Sqlite>> {
        let caller = self.caller;
        self.tx
            .take()
            .ok_or_else(|| IngestError::Other(anyhow::anyhow!("{}: transaction already consumed", caller)))
    }
}

impl<'c> Drop for MonitoredTransaction<'c> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            let held_ms = self.acquired_at.elapsed().as_millis() as u64;
            // sqlx rolls back a dropped transaction
            tracing::debug!(
                caller = self.caller,
                held_ms,
                "Connection released (drop, rolled back)"
            );
        }
    }
}

/// Begin a monitored transaction, logging the connection wait
pub async fn begin_monitored<'c>(
    pool: &'c sqlx::SqlitePool,
    caller: &'static str,
) -> IngestResult<MonitoredTransaction<'c>> {
    let start = Instant::now();
    let tx = pool.begin().await?;
    let acquired_at = Instant::now();

    let wait_ms = acquired_at.duration_since(start).as_millis() as u64;
    if wait_ms > 1000 {
        tracing::warn!(caller, wait_ms, "Slow connection acquisition, pool may be saturated");
    } else {
        tracing::debug!(caller, wait_ms, "Connection acquired");
    }

    Ok(MonitoredTransaction::new(tx, caller, acquired_at))
}
