//! Target rows and their upserts
//!
//! Every write is `INSERT ... ON CONFLICT(<natural key>) DO UPDATE`, so
//! committing the same batch twice leaves the same row set. Statements run on
//! a caller-supplied connection so a whole batch shares one transaction.

use crate::error::IngestResult;
use crate::models::EntityType;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashMap;

/// Bound variables per `IN (...)` lookup, below SQLite's parameter limit
const LOOKUP_CHUNK: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct MemberRow {
    pub bioguide_id: String,
    pub full_name: String,
    pub party: Option<String>,
    pub state: Option<String>,
    pub district: Option<i64>,
    pub chamber: Option<String>,
    pub source_checksum: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitteeRow {
    pub system_code: String,
    pub name: String,
    pub chamber: Option<String>,
    pub committee_type: Option<String>,
    pub parent_system_code: Option<String>,
    pub source_checksum: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BillRow {
    pub bill_id: String,
    pub congress: i64,
    pub bill_type: String,
    pub bill_number: i64,
    pub title: String,
    pub introduced_date: Option<String>,
    /// Resolved to NULL when the member row is absent
    pub sponsor_bioguide_id: Option<String>,
    pub policy_area: Option<String>,
    pub latest_action_date: Option<String>,
    pub latest_action_text: Option<String>,
    pub source_checksum: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VotePositionRow {
    pub bioguide_id: String,
    pub position: String,
    pub party: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoteRow {
    pub vote_id: String,
    pub congress: i64,
    pub session: i64,
    pub roll_number: i64,
    pub chamber: String,
    pub vote_date: Option<String>,
    pub question: Option<String>,
    pub result: Option<String>,
    /// Resolved to NULL when the bill row is absent
    pub bill_id: Option<String>,
    pub positions: Vec<VotePositionRow>,
    pub source_checksum: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilingRow {
    pub filing_uuid: String,
    pub filing_year: Option<i64>,
    pub filing_period: Option<String>,
    pub filing_type: Option<String>,
    pub registrant_name: Option<String>,
    pub client_name: Option<String>,
    pub income: Option<f64>,
    pub expenses: Option<f64>,
    pub posted_at: Option<String>,
    pub source_checksum: String,
}

/// A transformed source record, ready to upsert
#[derive(Debug, Clone, PartialEq)]
pub enum TargetRow {
    Member(MemberRow),
    Committee(CommitteeRow),
    Bill(BillRow),
    Vote(VoteRow),
    Filing(FilingRow),
}

impl TargetRow {
    pub fn key(&self) -> &str {
        match self {
            TargetRow::Member(row) => &row.bioguide_id,
            TargetRow::Committee(row) => &row.system_code,
            TargetRow::Bill(row) => &row.bill_id,
            TargetRow::Vote(row) => &row.vote_id,
            TargetRow::Filing(row) => &row.filing_uuid,
        }
    }
}

/// Upsert one row; returns the number of references dropped because their
/// target row is absent
pub async fn upsert_row(conn: &mut SqliteConnection, row: &TargetRow, migrated_at: &str) -> IngestResult<usize> {
    match row {
        TargetRow::Member(row) => upsert_member(conn, row, migrated_at).await.map(|_| 0),
        TargetRow::Committee(row) => upsert_committee(conn, row, migrated_at).await.map(|_| 0),
        TargetRow::Bill(row) => upsert_bill(conn, row, migrated_at).await,
        TargetRow::Vote(row) => upsert_vote(conn, row, migrated_at).await,
        TargetRow::Filing(row) => upsert_filing(conn, row, migrated_at).await.map(|_| 0),
    }
}

async fn upsert_member(conn: &mut SqliteConnection, row: &MemberRow, migrated_at: &str) -> IngestResult<()> {
    sqlx::query(
        r#"
        INSERT INTO congress_members (
            bioguide_id, full_name, party, state, district, chamber, source_checksum, migrated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(bioguide_id) DO UPDATE SET
            full_name = excluded.full_name,
            party = excluded.party,
            state = excluded.state,
            district = excluded.district,
            chamber = excluded.chamber,
            source_checksum = excluded.source_checksum,
            migrated_at = excluded.migrated_at
        "#,
    )
    .bind(&row.bioguide_id)
    .bind(&row.full_name)
    .bind(&row.party)
    .bind(&row.state)
    .bind(row.district)
    .bind(&row.chamber)
    .bind(&row.source_checksum)
    .bind(migrated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_committee(conn: &mut SqliteConnection, row: &CommitteeRow, migrated_at: &str) -> IngestResult<()> {
    sqlx::query(
        r#"
        INSERT INTO congress_committees (
            system_code, name, chamber, committee_type, parent_system_code, source_checksum, migrated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(system_code) DO UPDATE SET
            name = excluded.name,
            chamber = excluded.chamber,
            committee_type = excluded.committee_type,
            parent_system_code = excluded.parent_system_code,
            source_checksum = excluded.source_checksum,
            migrated_at = excluded.migrated_at
        "#,
    )
    .bind(&row.system_code)
    .bind(&row.name)
    .bind(&row.chamber)
    .bind(&row.committee_type)
    .bind(&row.parent_system_code)
    .bind(&row.source_checksum)
    .bind(migrated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_bill(conn: &mut SqliteConnection, row: &BillRow, migrated_at: &str) -> IngestResult<usize> {
    // The sponsor subquery yields NULL for an unknown member
    sqlx::query(
        r#"
        INSERT INTO congress_bills (
            bill_id, congress, bill_type, bill_number, title, introduced_date,
            sponsor_bioguide_id, policy_area, latest_action_date, latest_action_text,
            source_checksum, migrated_at
        ) VALUES (
            ?, ?, ?, ?, ?, ?,
            (SELECT bioguide_id FROM congress_members WHERE bioguide_id = ?),
            ?, ?, ?, ?, ?
        )
        ON CONFLICT(bill_id) DO UPDATE SET
            congress = excluded.congress,
            bill_type = excluded.bill_type,
            bill_number = excluded.bill_number,
            title = excluded.title,
            introduced_date = excluded.introduced_date,
            sponsor_bioguide_id = excluded.sponsor_bioguide_id,
            policy_area = excluded.policy_area,
            latest_action_date = excluded.latest_action_date,
            latest_action_text = excluded.latest_action_text,
            source_checksum = excluded.source_checksum,
            migrated_at = excluded.migrated_at
        "#,
    )
    .bind(&row.bill_id)
    .bind(row.congress)
    .bind(&row.bill_type)
    .bind(row.bill_number)
    .bind(&row.title)
    .bind(&row.introduced_date)
    .bind(&row.sponsor_bioguide_id)
    .bind(&row.policy_area)
    .bind(&row.latest_action_date)
    .bind(&row.latest_action_text)
    .bind(&row.source_checksum)
    .bind(migrated_at)
    .execute(&mut *conn)
    .await?;

    let dangling = match &row.sponsor_bioguide_id {
        Some(sponsor) => usize::from(!key_exists(conn, "congress_members", "bioguide_id", sponsor).await?),
        None => 0,
    };
    Ok(dangling)
}

async fn upsert_vote(conn: &mut SqliteConnection, row: &VoteRow, migrated_at: &str) -> IngestResult<usize> {
    sqlx::query(
        r#"
        INSERT INTO congress_votes (
            vote_id, congress, session, roll_number, chamber, vote_date, question, result,
            bill_id, source_checksum, migrated_at
        ) VALUES (
            ?, ?, ?, ?, ?, ?, ?, ?,
            (SELECT bill_id FROM congress_bills WHERE bill_id = ?),
            ?, ?
        )
        ON CONFLICT(vote_id) DO UPDATE SET
            congress = excluded.congress,
            session = excluded.session,
            roll_number = excluded.roll_number,
            chamber = excluded.chamber,
            vote_date = excluded.vote_date,
            question = excluded.question,
            result = excluded.result,
            bill_id = excluded.bill_id,
            source_checksum = excluded.source_checksum,
            migrated_at = excluded.migrated_at
        "#,
    )
    .bind(&row.vote_id)
    .bind(row.congress)
    .bind(row.session)
    .bind(row.roll_number)
    .bind(&row.chamber)
    .bind(&row.vote_date)
    .bind(&row.question)
    .bind(&row.result)
    .bind(&row.bill_id)
    .bind(&row.source_checksum)
    .bind(migrated_at)
    .execute(&mut *conn)
    .await?;

    let mut dangling = match &row.bill_id {
        Some(bill_id) => usize::from(!key_exists(conn, "congress_bills", "bill_id", bill_id).await?),
        None => 0,
    };

    // Positions are replaced wholesale so a re-commit converges
    sqlx::query("DELETE FROM congress_vote_positions WHERE vote_id = ?")
        .bind(&row.vote_id)
        .execute(&mut *conn)
        .await?;

    for position in &row.positions {
        let inserted = sqlx::query(
            r#"
            INSERT INTO congress_vote_positions (vote_id, bioguide_id, position, party)
            SELECT ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM congress_members WHERE bioguide_id = ?)
            ON CONFLICT(vote_id, bioguide_id) DO UPDATE SET
                position = excluded.position,
                party = excluded.party
            "#,
        )
        .bind(&row.vote_id)
        .bind(&position.bioguide_id)
        .bind(&position.position)
        .bind(&position.party)
        .bind(&position.bioguide_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if inserted == 0 {
            dangling += 1;
        }
    }

    Ok(dangling)
}

async fn upsert_filing(conn: &mut SqliteConnection, row: &FilingRow, migrated_at: &str) -> IngestResult<()> {
    sqlx::query(
        r#"
        INSERT INTO lobbying_filings (
            filing_uuid, filing_year, filing_period, filing_type, registrant_name, client_name,
            income, expenses, posted_at, source_checksum, migrated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(filing_uuid) DO UPDATE SET
            filing_year = excluded.filing_year,
            filing_period = excluded.filing_period,
            filing_type = excluded.filing_type,
            registrant_name = excluded.registrant_name,
            client_name = excluded.client_name,
            income = excluded.income,
            expenses = excluded.expenses,
            posted_at = excluded.posted_at,
            source_checksum = excluded.source_checksum,
            migrated_at = excluded.migrated_at
        "#,
    )
    .bind(&row.filing_uuid)
    .bind(row.filing_year)
    .bind(&row.filing_period)
    .bind(&row.filing_type)
    .bind(&row.registrant_name)
    .bind(&row.client_name)
    .bind(row.income)
    .bind(row.expenses)
    .bind(&row.posted_at)
    .bind(&row.source_checksum)
    .bind(migrated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn key_exists(conn: &mut SqliteConnection, table: &str, column: &str, key: &str) -> IngestResult<bool> {
    let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ?)", table, column);
    let exists: bool = sqlx::query_scalar(&sql).bind(key).fetch_one(&mut *conn).await?;
    Ok(exists)
}

/// Stored source checksums of the given ids; ids without a row are absent
/// from the map
pub async fn fetch_checksums(
    pool: &SqlitePool,
    entity_type: EntityType,
    ids: &[String],
) -> IngestResult<HashMap<String, String>> {
    let mut checksums = HashMap::with_capacity(ids.len());

    for chunk in ids.chunks(LOOKUP_CHUNK) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {key} AS key, source_checksum FROM {table} WHERE {key} IN (",
            key = entity_type.key_column(),
            table = entity_type.table()
        ));
        let mut separated = builder.separated(", ");
        for id in chunk {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows = builder.build().fetch_all(pool).await?;
        for row in rows {
            checksums.insert(row.get("key"), row.get("source_checksum"));
        }
    }

    Ok(checksums)
}

/// Row count of an entity type's table
pub async fn count_rows(pool: &SqlitePool, entity_type: EntityType) -> IngestResult<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", entity_type.table());
    Ok(sqlx::query_scalar(&sql).fetch_one(pool).await?)
}
