//! Migration state machine, batches, checkpoints and summaries
//!
//! Per entity type: NotStarted → InProgress → Completed | PartiallyFailed

use super::{Collection, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Entity type migrated into the relational target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    Member,
    Committee,
    LobbyingFiling,
    Bill,
    Vote,
}

impl EntityType {
    /// All entity types in a valid dependency order
    pub const ALL: [EntityType; 5] = [
        EntityType::Member,
        EntityType::Committee,
        EntityType::LobbyingFiling,
        EntityType::Bill,
        EntityType::Vote,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Member => "member",
            EntityType::Committee => "committee",
            EntityType::LobbyingFiling => "lobbyingFiling",
            EntityType::Bill => "bill",
            EntityType::Vote => "vote",
        }
    }

    /// Record collection the entity type is migrated from
    pub fn collection(&self) -> Collection {
        match self {
            EntityType::Member => Collection::Member,
            EntityType::Committee => Collection::Committee,
            EntityType::LobbyingFiling => Collection::LobbyingFiling,
            EntityType::Bill => Collection::Bill,
            EntityType::Vote => Collection::Vote,
        }
    }

    /// Entity types whose rows this type's rows reference
    pub fn prerequisites(&self) -> &'static [EntityType] {
        match self {
            EntityType::Member | EntityType::Committee | EntityType::LobbyingFiling => &[],
            EntityType::Bill => &[EntityType::Member],
            EntityType::Vote => &[EntityType::Member, EntityType::Bill],
        }
    }

    /// Target table holding one row per source record
    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Member => "congress_members",
            EntityType::Committee => "congress_committees",
            EntityType::LobbyingFiling => "lobbying_filings",
            EntityType::Bill => "congress_bills",
            EntityType::Vote => "congress_votes",
        }
    }

    /// Natural key column of `table()`
    pub fn key_column(&self) -> &'static str {
        match self {
            EntityType::Member => "bioguide_id",
            EntityType::Committee => "system_code",
            EntityType::LobbyingFiling => "filing_uuid",
            EntityType::Bill => "bill_id",
            EntityType::Vote => "vote_id",
        }
    }

    /// Group entity types into dependency levels
    ///
    /// Types within one level do not depend on each other and may migrate
    /// concurrently; each level only depends on earlier levels.
    pub fn levels() -> Vec<Vec<EntityType>> {
        let mut levels: Vec<Vec<EntityType>> = Vec::new();
        let mut placed: Vec<EntityType> = Vec::new();

        while placed.len() < Self::ALL.len() {
            let level: Vec<EntityType> = Self::ALL
                .iter()
                .copied()
                .filter(|t| !placed.contains(t))
                .filter(|t| t.prerequisites().iter().all(|p| placed.contains(p)))
                .collect();
            if level.is_empty() {
                break;
            }
            placed.extend(level.iter().copied());
            levels.push(level);
        }

        levels
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let collection: Collection = s.parse()?;
        Ok(match collection {
            Collection::Member => EntityType::Member,
            Collection::Committee => EntityType::Committee,
            Collection::LobbyingFiling => EntityType::LobbyingFiling,
            Collection::Bill => EntityType::Bill,
            Collection::Vote => EntityType::Vote,
        })
    }
}

/// Migration state of one entity type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    NotStarted,
    InProgress,
    Completed,
    PartiallyFailed,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::NotStarted => "NOT_STARTED",
            MigrationState::InProgress => "IN_PROGRESS",
            MigrationState::Completed => "COMPLETED",
            MigrationState::PartiallyFailed => "PARTIALLY_FAILED",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(MigrationState::NotStarted),
            "IN_PROGRESS" => Ok(MigrationState::InProgress),
            "COMPLETED" => Ok(MigrationState::Completed),
            "PARTIALLY_FAILED" => Ok(MigrationState::PartiallyFailed),
            other => Err(format!("unknown migration state: {}", other)),
        }
    }
}

/// Durable migration progress for one entity type and congress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationCheckpoint {
    pub entity_type: EntityType,
    pub congress: u32,
    pub state: MigrationState,
    /// Highest batch sequence number committed (0 = none)
    pub last_committed_sequence_number: u64,
    /// Source record count the batch boundaries were computed against
    pub source_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl MigrationCheckpoint {
    pub fn not_started(entity_type: EntityType, congress: u32) -> Self {
        Self {
            entity_type,
            congress,
            state: MigrationState::NotStarted,
            last_committed_sequence_number: 0,
            source_count: 0,
            updated_at: Utc::now(),
        }
    }
}

/// A bounded slice of one entity type's records, committed as one transaction
#[derive(Debug, Clone)]
pub struct MigrationBatch {
    pub entity_type: EntityType,
    /// 1-based, strictly increasing within one entity type
    pub sequence_number: u64,
    pub records: Vec<Record>,
}

impl MigrationBatch {
    pub fn record_ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }
}

/// Result of migrating one entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationSummary {
    pub run_id: Uuid,
    pub entity_type: EntityType,
    pub congress: u32,
    pub state: MigrationState,
    /// Records committed in this run
    pub committed: usize,
    /// Records in failed batches or rejected by the transform
    pub failed: usize,
    /// Records in batches already committed by an earlier run
    pub skipped_already_committed: usize,
    pub batches_committed: u64,
    pub failed_batches: Vec<u64>,
    /// References set to NULL or dropped because their target row is absent
    pub dangling_references: usize,
    pub cancelled: bool,
}

impl MigrationSummary {
    pub fn new(run_id: Uuid, entity_type: EntityType, congress: u32) -> Self {
        Self {
            run_id,
            entity_type,
            congress,
            state: MigrationState::InProgress,
            committed: 0,
            failed: 0,
            skipped_already_committed: 0,
            batches_committed: 0,
            failed_batches: Vec::new(),
            dangling_references: 0,
            cancelled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_respect_prerequisites() {
        let levels = EntityType::levels();
        assert_eq!(
            levels,
            vec![
                vec![EntityType::Member, EntityType::Committee, EntityType::LobbyingFiling],
                vec![EntityType::Bill],
                vec![EntityType::Vote],
            ]
        );
    }

    #[test]
    fn test_all_is_a_topological_order() {
        for (i, entity) in EntityType::ALL.iter().enumerate() {
            for prerequisite in entity.prerequisites() {
                let pos = EntityType::ALL.iter().position(|e| e == prerequisite).unwrap();
                assert!(pos < i, "{} listed before its prerequisite {}", entity, prerequisite);
            }
        }
    }

    #[test]
    fn test_state_round_trips_through_text() {
        for state in [
            MigrationState::NotStarted,
            MigrationState::InProgress,
            MigrationState::Completed,
            MigrationState::PartiallyFailed,
        ] {
            assert_eq!(state.as_str().parse::<MigrationState>().unwrap(), state);
        }
    }
}
