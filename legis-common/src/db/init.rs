//! Database initialization
//!
//! Opens (or creates) the target database and applies the fixed schema.
//! Every statement is `IF NOT EXISTS`, so initialization is idempotent and
//! safe to run at every startup.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Busy timeout applied to every pooled connection
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the target database, creating it and its schema if needed
///
/// Foreign keys, WAL journaling and the busy timeout are connection
/// options, so every connection in the pool gets them (a `PRAGMA` issued
/// through the pool would only reach one connection).
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    init_schema(&pool).await?;

    Ok(pool)
}

/// Create every table and view of the target schema
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    create_members_table(pool).await?;
    create_committees_table(pool).await?;
    create_bills_table(pool).await?;
    create_votes_table(pool).await?;
    create_vote_positions_table(pool).await?;
    create_lobbying_filings_table(pool).await?;
    create_analytics_views(pool).await?;
    create_migration_runs_table(pool).await?;
    create_migration_checkpoints_table(pool).await?;
    create_failed_batches_table(pool).await?;
    Ok(())
}

async fn create_members_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS congress_members (
            bioguide_id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            party TEXT,
            state TEXT,
            district INTEGER,
            chamber TEXT,
            source_checksum TEXT NOT NULL,
            migrated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_committees_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS congress_committees (
            system_code TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            chamber TEXT,
            committee_type TEXT,
            parent_system_code TEXT,
            source_checksum TEXT NOT NULL,
            migrated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_bills_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS congress_bills (
            bill_id TEXT PRIMARY KEY,
            congress INTEGER NOT NULL,
            bill_type TEXT NOT NULL,
            bill_number INTEGER NOT NULL,
            title TEXT NOT NULL,
            introduced_date TEXT,
            sponsor_bioguide_id TEXT REFERENCES congress_members(bioguide_id),
            policy_area TEXT,
            latest_action_date TEXT,
            latest_action_text TEXT,
            source_checksum TEXT NOT NULL,
            migrated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_congress_bills_sponsor ON congress_bills(sponsor_bioguide_id)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_votes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS congress_votes (
            vote_id TEXT PRIMARY KEY,
            congress INTEGER NOT NULL,
            session INTEGER NOT NULL,
            roll_number INTEGER NOT NULL,
            chamber TEXT NOT NULL,
            vote_date TEXT,
            question TEXT,
            result TEXT,
            bill_id TEXT REFERENCES congress_bills(bill_id),
            source_checksum TEXT NOT NULL,
            migrated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_vote_positions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS congress_vote_positions (
            vote_id TEXT NOT NULL REFERENCES congress_votes(vote_id),
            bioguide_id TEXT NOT NULL REFERENCES congress_members(bioguide_id),
            position TEXT NOT NULL,
            party TEXT,
            PRIMARY KEY (vote_id, bioguide_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_lobbying_filings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS lobbying_filings (
            filing_uuid TEXT PRIMARY KEY,
            filing_year INTEGER,
            filing_period TEXT,
            filing_type TEXT,
            registrant_name TEXT,
            client_name TEXT,
            income REAL,
            expenses REAL,
            posted_at TEXT,
            source_checksum TEXT NOT NULL,
            migrated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_analytics_views(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE VIEW IF NOT EXISTS analytics_bill_vote_totals AS
        SELECT v.bill_id AS bill_id,
               COUNT(DISTINCT v.vote_id) AS roll_calls,
               SUM(CASE WHEN p.position = 'Yea' THEN 1 ELSE 0 END) AS yea,
               SUM(CASE WHEN p.position = 'Nay' THEN 1 ELSE 0 END) AS nay
        FROM congress_votes v
        LEFT JOIN congress_vote_positions p ON p.vote_id = v.vote_id
        WHERE v.bill_id IS NOT NULL
        GROUP BY v.bill_id
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_migration_runs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ops_migration_runs (
            run_id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            congress INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            success INTEGER NOT NULL DEFAULT 0,
            rows_migrated INTEGER NOT NULL DEFAULT 0,
            batches_committed INTEGER NOT NULL DEFAULT 0,
            batches_failed INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_migration_checkpoints_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ops_migration_checkpoints (
            entity_type TEXT NOT NULL,
            congress INTEGER NOT NULL,
            state TEXT NOT NULL,
            last_committed_sequence INTEGER NOT NULL DEFAULT 0,
            source_count INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (entity_type, congress)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_failed_batches_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ops_failed_batches (
            run_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            congress INTEGER NOT NULL,
            sequence_number INTEGER NOT NULL,
            record_ids TEXT NOT NULL,
            error TEXT NOT NULL,
            failed_at TEXT NOT NULL,
            PRIMARY KEY (run_id, sequence_number)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
