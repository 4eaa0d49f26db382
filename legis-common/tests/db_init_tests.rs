//! Target schema initialization

use legis_common::db::init_database;
use tempfile::TempDir;

async fn table_names(pool: &sqlx::SqlitePool) -> Vec<String> {
    sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .unwrap()
}

#[tokio::test]
async fn test_database_created_with_full_schema() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("sub").join("legis.db");

    let pool = init_database(&db_path).await.unwrap();
    assert!(db_path.exists());

    let names = table_names(&pool).await;
    for expected in [
        "analytics_bill_vote_totals",
        "congress_bills",
        "congress_committees",
        "congress_members",
        "congress_vote_positions",
        "congress_votes",
        "lobbying_filings",
        "ops_failed_batches",
        "ops_migration_checkpoints",
        "ops_migration_runs",
    ] {
        assert!(names.contains(&expected.to_string()), "missing {}", expected);
    }
}

#[tokio::test]
async fn test_reopen_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("legis.db");

    let first = init_database(&db_path).await.unwrap();
    first.close().await;

    let second = init_database(&db_path).await.unwrap();
    let names = table_names(&second).await;
    assert_eq!(names.len(), 10);
}

#[tokio::test]
async fn test_foreign_keys_enforced() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("legis.db")).await.unwrap();

    let result = sqlx::query(
        "INSERT INTO congress_vote_positions (vote_id, bioguide_id, position) VALUES ('118-1-1', 'X000001', 'Yea')",
    )
    .execute(&pool)
    .await;

    assert!(result.is_err(), "orphan vote position must be rejected");
}
