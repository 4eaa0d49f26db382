//! Temporary root folder with a record store and target database

use chrono::Utc;
use legis_common::config::RootLayout;
use legis_ingest::models::Record;
use legis_ingest::services::RecordStore;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tempfile::TempDir;

/// A root folder that lives as long as the test holds it
pub struct TestRoot {
    pub dir: TempDir,
    pub store: RecordStore,
    pub pool: SqlitePool,
}

impl TestRoot {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let layout = RootLayout::new(dir.path().to_path_buf());
        layout.ensure_directories().unwrap();

        let store = RecordStore::open(layout.records_dir()).unwrap();
        let pool = legis_common::db::init_database(&layout.database_path())
            .await
            .unwrap();

        Self { dir, store, pool }
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

/// Write records and index them, as a completed fetch run would
pub async fn seed_records(store: &RecordStore, collection_key: &str, records: Vec<(String, Value)>) {
    for (id, payload) in records {
        let record = Record::new(collection_key, id.clone(), payload);
        store.write(&record).await.unwrap();
        store.append_index(collection_key, &id, Utc::now()).await.unwrap();
    }
    store.compact_index(collection_key).await.unwrap();
}

pub fn member_payload(bioguide_id: &str) -> Value {
    json!({
        "bioguideId": bioguide_id,
        "directOrderName": format!("Member {}", bioguide_id),
        "state": "Ohio",
        "partyHistory": [{"partyAbbreviation": "D"}],
        "terms": [{"chamber": "House of Representatives"}]
    })
}

pub fn bill_payload(number: u32, sponsor: Option<&str>) -> Value {
    let mut payload = json!({
        "congress": 118,
        "type": "HR",
        "number": number.to_string(),
        "title": format!("Test Act {}", number),
        "introducedDate": "2023-01-09",
        "latestAction": {"actionDate": "2023-02-01", "text": "Referred to committee"}
    });
    if let Some(sponsor) = sponsor {
        payload["sponsors"] = json!([{"bioguideId": sponsor}]);
    }
    payload
}

pub fn vote_payload(bill_number: u32, positions: &[(&str, &str)]) -> Value {
    let members: Vec<Value> = positions
        .iter()
        .map(|(id, cast)| json!({"bioguideID": id, "voteCast": cast, "voteParty": "D"}))
        .collect();
    json!({
        "startDate": "2023-06-21T12:00:00-04:00",
        "voteQuestion": "On Passage",
        "result": "Passed",
        "legislationType": "HR",
        "legislationNumber": bill_number.to_string(),
        "members": members
    })
}
