//! Congress.gov stand-in served by wiremock

use legis_common::config::FetchConfig;
use legis_common::events::EventBus;
use legis_ingest::config::{AuthMode, PaginationStyle, SourceConfig};
use legis_ingest::models::SourceId;
use legis_ingest::services::{ApiClient, BackoffPolicy, FetchOrchestrator, RecordStore};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use wiremock::MockServer;

/// Source pointed at `server` with a short request timeout
pub fn mock_congress_config(server: &MockServer, timeout: Duration) -> SourceConfig {
    SourceConfig {
        source: SourceId::Congress,
        base_url: server.uri(),
        auth: AuthMode::ApiKeyQuery("test-key".to_string()),
        rate_limit: NonZeroU32::new(1_000).unwrap(),
        window: Duration::from_secs(60),
        min_interval: None,
        pagination: PaginationStyle::NextUrl,
        page_size: 250,
        timeout,
    }
}

/// Fetch settings with millisecond backoff
pub fn fast_fetch_config() -> FetchConfig {
    FetchConfig {
        concurrency: 3,
        max_attempts: 4,
        base_delay_ms: 10,
        max_delay_ms: 50,
        jitter: 0.0,
        storage_write_attempts: 3,
        max_restarts: 1,
    }
}

pub fn source_orchestrator(
    config: SourceConfig,
    store: RecordStore,
    event_bus: EventBus,
) -> (FetchOrchestrator, Arc<ApiClient>) {
    let fetch = fast_fetch_config();
    let limiter = Arc::new(config.rate_limiter());
    let client = Arc::new(ApiClient::new(config, limiter, BackoffPolicy::for_fetch(&fetch)).unwrap());
    let orchestrator = FetchOrchestrator::new(client.clone(), store, event_bus, &fetch);
    (orchestrator, client)
}
