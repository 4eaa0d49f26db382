//! Data model of the fetch-and-migrate pipeline

pub mod fetch_result;
pub mod fetch_unit;
pub mod migration;
pub mod record;
pub mod summary;

pub use fetch_result::{FetchErrorKind, FetchOutcome, FetchResult};
pub use fetch_unit::{
    collection_key, congress_years, record_id_for_key, Collection, FetchUnit, SourceId,
};
pub use migration::{
    EntityType, MigrationBatch, MigrationCheckpoint, MigrationState, MigrationSummary,
};
pub use record::{CollectionIndex, Record};
pub use summary::{FailedUnit, RunSummary};
