//! legis-ingest library interface
//!
//! Fetches legislative records from Congress.gov and the Senate LDA API into
//! a file-tier record store, then migrates them into the relational target.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{IngestError, IngestResult};

use crate::config::{source_config, CredentialOverrides};
use crate::models::SourceId;
use crate::services::{ApiClient, BackoffPolicy, FetchOrchestrator, MigrationPipeline, RecordStore};
use legis_common::config::{RootLayout, TomlConfig};
use legis_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Shared state of one pipeline process
#[derive(Clone)]
pub struct IngestContext {
    pub db: SqlitePool,
    pub store: RecordStore,
    pub event_bus: EventBus,
    pub config: TomlConfig,
}

impl IngestContext {
    /// Prepare the root folder, open the target database and the record store
    pub async fn open(layout: &RootLayout, config: TomlConfig) -> IngestResult<Self> {
        layout.ensure_directories()?;
        let db = legis_common::db::init_database(&layout.database_path()).await?;
        let store = RecordStore::open(layout.records_dir())?;

        Ok(Self {
            db,
            store,
            event_bus: EventBus::new(256),
            config,
        })
    }

    /// Fetch orchestrator for `source`, with its own rate limiter
    pub fn fetch_orchestrator(
        &self,
        source: SourceId,
        overrides: &CredentialOverrides,
    ) -> IngestResult<FetchOrchestrator> {
        let source_config = source_config(source, &self.config, overrides)?;
        let rate_limiter = Arc::new(source_config.rate_limiter());
        let client = ApiClient::new(
            source_config,
            rate_limiter,
            BackoffPolicy::for_fetch(&self.config.fetch),
        )?;

        Ok(FetchOrchestrator::new(
            Arc::new(client),
            self.store.clone(),
            self.event_bus.clone(),
            &self.config.fetch,
        ))
    }

    pub fn migration_pipeline(&self) -> MigrationPipeline {
        MigrationPipeline::new(
            self.db.clone(),
            self.store.clone(),
            self.event_bus.clone(),
            &self.config.migration,
        )
    }
}
