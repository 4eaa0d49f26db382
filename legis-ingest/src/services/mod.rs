//! Pipeline services
//!
//! Fetch side: rate limiter, API client, source routes, fetch orchestrator,
//! record store. Migration side: migration pipeline, validation, status.

pub mod api_client;
pub mod backoff;
pub mod fetch_orchestrator;
pub mod migration;
pub mod rate_limiter;
pub mod record_store;
pub mod sources;
pub mod status;
pub mod validation;

pub use api_client::ApiClient;
pub use backoff::BackoffPolicy;
pub use fetch_orchestrator::{FetchOrchestrator, FetchRequest};
pub use migration::{EntityMigrationOutcome, MigrationPipeline};
pub use rate_limiter::{RateBudget, RateLimiter};
pub use record_store::{RecordIter, RecordStore};
pub use sources::Enumeration;
pub use status::{status, StatusReport};
pub use validation::{validate, ValidationReport};
