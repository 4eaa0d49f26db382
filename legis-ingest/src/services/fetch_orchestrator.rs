//! Fetch run orchestration
//!
//! A run enumerates the units of one collection, skips those already in the
//! collection index, and fetches the rest on a bounded pool of spawned
//! workers. Workers fetch and write records; the index is appended to only
//! by the consuming loop, one id at a time, after the record write returned.
//!
//! Unit failures are counted and the run continues. A storage failure that
//! outlives its retries aborts the run, which is then restarted from the
//! index up to `max_restarts` times.

use crate::error::{IngestError, IngestResult};
use crate::models::{
    collection_key, Collection, FailedUnit, FetchErrorKind, FetchOutcome, FetchResult, FetchUnit,
    Record, RunSummary,
};
use crate::services::api_client::ApiClient;
use crate::services::backoff::{sleep_cancellable, BackoffPolicy};
use crate::services::record_store::RecordStore;
use crate::services::sources::{enumerate_units, Enumeration};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use legis_common::config::FetchConfig;
use legis_common::events::{EventBus, PipelineEvent};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What one worker hands back to the consuming loop
enum WorkerOutcome {
    /// Record durably written; index not yet updated
    Stored { unit: FetchUnit, record: Record },
    Failed(FetchResult),
    Cancelled,
    StorageFailed { unit: FetchUnit, error: IngestError },
}

/// Operator request for one fetch run
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub collection: Collection,
    pub congress: u32,
    pub concurrency: usize,
    /// Explicit unit keys; enumeration is skipped when non-empty
    pub keys: Vec<String>,
    pub enumeration: Enumeration,
    /// Fetch requested units even if already indexed (creates new versions)
    pub refetch: bool,
}

impl FetchRequest {
    pub fn new(collection: Collection, congress: u32, concurrency: usize) -> Self {
        Self {
            collection,
            congress,
            concurrency,
            keys: Vec::new(),
            enumeration: Enumeration::default(),
            refetch: false,
        }
    }
}

/// Drives fetch runs for one upstream source
pub struct FetchOrchestrator {
    client: Arc<ApiClient>,
    store: RecordStore,
    event_bus: EventBus,
    storage_policy: BackoffPolicy,
    max_restarts: u32,
}

impl FetchOrchestrator {
    pub fn new(
        client: Arc<ApiClient>,
        store: RecordStore,
        event_bus: EventBus,
        config: &FetchConfig,
    ) -> Self {
        Self {
            client,
            store,
            event_bus,
            storage_policy: BackoffPolicy::for_storage(config),
            max_restarts: config.max_restarts,
        }
    }

    pub fn with_storage_policy(mut self, policy: BackoffPolicy) -> Self {
        self.storage_policy = policy;
        self
    }

    /// Enumerate and fetch every unit of `collection` for `congress`
    pub async fn run(
        &self,
        collection: Collection,
        congress: u32,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> IngestResult<RunSummary> {
        self.run_request(&FetchRequest::new(collection, congress, concurrency), cancel)
            .await
    }

    /// Run a fully specified request
    pub async fn run_request(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> IngestResult<RunSummary> {
        if request.collection.source() != self.client.source() {
            return Err(IngestError::BadRequest(format!(
                "{} is served by {}, not {}",
                request.collection,
                request.collection.source(),
                self.client.source()
            )));
        }

        let units = if request.keys.is_empty() {
            enumerate_units(
                &self.client,
                request.collection,
                request.congress,
                &request.enumeration,
                cancel,
            )
            .await?
        } else {
            request
                .keys
                .iter()
                .map(|key| {
                    request
                        .collection
                        .normalize_key(key)
                        .map(|key| FetchUnit::new(request.collection, request.congress, key))
                        .map_err(IngestError::BadRequest)
                })
                .collect::<IngestResult<Vec<_>>>()?
        };

        self.run_units(
            &collection_key(request.collection, request.congress),
            units,
            request.concurrency,
            request.refetch,
            cancel,
        )
        .await
    }

    /// Fetch the given units into `collection_key`, restarting after storage failures
    pub async fn run_units(
        &self,
        collection_key: &str,
        units: Vec<FetchUnit>,
        concurrency: usize,
        refetch: bool,
        cancel: &CancellationToken,
    ) -> IngestResult<RunSummary> {
        let start_time = std::time::Instant::now();
        let mut summary: Option<RunSummary> = None;
        let mut abandoned: HashSet<String> = HashSet::new();
        let mut restarts = 0;

        let result = loop {
            // A restart resumes from the index, so refetch only applies to the first pass
            let refetch_pass = refetch && restarts == 0;
            let (partial, error) = self
                .run_once(collection_key, &units, concurrency, refetch_pass, &abandoned, cancel)
                .await;

            abandoned.extend(partial.failures.iter().map(|f| f.key.clone()));
            match summary.as_mut() {
                Some(total) => total.absorb(partial),
                None => summary = Some(partial),
            }

            match error {
                None => break Ok(()),
                Some(e @ IngestError::StorageWriteFailure { .. }) if restarts < self.max_restarts => {
                    restarts += 1;
                    tracing::warn!(
                        collection = collection_key,
                        restart = restarts,
                        max_restarts = self.max_restarts,
                        error = %e,
                        "Fetch run aborted by storage failure, restarting from index"
                    );
                }
                Some(e) => break Err(e),
            }
        };

        let summary = summary.unwrap_or_else(|| RunSummary::new(collection_key));

        if let Err(e) = self.store.compact_index(collection_key).await {
            tracing::warn!(collection = collection_key, error = %e, "Index compaction failed, journal kept");
        }

        self.event_bus.emit_lossy(PipelineEvent::FetchRunFinished {
            collection_key: collection_key.to_string(),
            fetched: summary.fetched,
            skipped: summary.skipped,
            failed: summary.failed,
            timestamp: Utc::now(),
        });

        match result {
            Ok(()) => {
                tracing::info!(
                    collection = collection_key,
                    fetched = summary.fetched,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    cancelled = summary.cancelled,
                    elapsed_ms = start_time.elapsed().as_millis() as u64,
                    "Fetch run finished"
                );
                Ok(summary)
            }
            Err(e) => {
                tracing::error!(
                    collection = collection_key,
                    fetched = summary.fetched,
                    failed = summary.failed,
                    restarts,
                    error = %e,
                    "Fetch run aborted"
                );
                Err(e)
            }
        }
    }

    /// One pass over the units; returns the counts even when aborted
    async fn run_once(
        &self,
        collection_key: &str,
        units: &[FetchUnit],
        concurrency: usize,
        refetch: bool,
        abandoned: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> (RunSummary, Option<IngestError>) {
        let mut summary = RunSummary::new(collection_key);

        let mut index = match self.store.read_index(collection_key).await {
            Ok(index) => index,
            Err(e) => return (summary, Some(e)),
        };

        // One unit per record id; duplicates from enumeration collapse here
        let mut pending: BTreeMap<String, FetchUnit> = BTreeMap::new();
        for unit in units {
            let id = unit.record_id();
            if abandoned.contains(&id) {
                continue;
            }
            if !refetch && index.contains(&id) {
                summary.skipped += 1;
                continue;
            }
            pending.entry(id).or_insert_with(|| unit.clone());
        }

        let planned = pending.len();
        tracing::info!(
            collection = collection_key,
            planned,
            skipped = summary.skipped,
            concurrency,
            "Fetch run starting"
        );
        self.event_bus.emit_lossy(PipelineEvent::FetchRunStarted {
            collection_key: collection_key.to_string(),
            planned,
            timestamp: Utc::now(),
        });

        // Cancelled on abort so in-flight workers stop at their next suspension point
        let run_cancel = cancel.child_token();

        let mut outcomes = stream::iter(pending.into_values())
            .map(|unit| {
                let client = self.client.clone();
                let store = self.store.clone();
                let policy = self.storage_policy.clone();
                let cancel = run_cancel.clone();
                let handle = tokio::spawn(fetch_and_store(client, store, policy, unit.clone(), cancel));
                join_worker(unit, handle)
            })
            .buffer_unordered(concurrency.max(1));

        let mut abort: Option<IngestError> = None;
        let mut processed = 0usize;

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                WorkerOutcome::Stored { unit, record } => {
                    let id = record.id.clone();
                    let at = record.fetched_at;
                    let appended = with_storage_retry(&self.storage_policy, &run_cancel, || {
                        self.store.append_index(collection_key, &id, at)
                    })
                    .await;

                    match appended {
                        Ok(()) => {
                            index.insert(id, at);
                            summary.fetched += 1;
                            tracing::debug!(unit = %unit.key, attempt = record.attempt, version = record.version, "Unit stored");
                            self.event_bus.emit_lossy(PipelineEvent::UnitFetched {
                                collection_key: collection_key.to_string(),
                                key: unit.key,
                                attempt: record.attempt,
                            });
                        }
                        Err(IngestError::Cancelled) => summary.cancelled = true,
                        Err(e) => {
                            abort = Some(e);
                            break;
                        }
                    }
                }
                WorkerOutcome::Failed(result) => {
                    let message = result.message.clone().unwrap_or_default();
                    tracing::error!(
                        unit = %result.unit.key,
                        status = result.http_status,
                        attempts = result.attempt,
                        error = %message,
                        "Unit abandoned"
                    );
                    self.event_bus.emit_lossy(PipelineEvent::UnitFailed {
                        collection_key: collection_key.to_string(),
                        key: result.unit.key.clone(),
                        http_status: result.http_status,
                        message: message.clone(),
                    });
                    summary.record_failure(FailedUnit {
                        key: result.unit.record_id(),
                        http_status: result.http_status,
                        attempts: result.attempt,
                        message,
                    });
                }
                WorkerOutcome::Cancelled => summary.cancelled = true,
                WorkerOutcome::StorageFailed { unit, error } => {
                    tracing::error!(unit = %unit.key, error = %error, "Record write failed after retries");
                    abort = Some(error);
                    break;
                }
            }

            processed += 1;
            if processed % 100 == 0 || processed == planned {
                tracing::info!(
                    collection = collection_key,
                    progress = format!("{}/{}", processed, planned),
                    "Fetch progress"
                );
            }
        }

        if abort.is_some() {
            run_cancel.cancel();
        }
        if cancel.is_cancelled() {
            summary.cancelled = true;
        }

        (summary, abort)
    }
}

/// Await a worker; a panicked worker abandons its unit as a permanent failure
async fn join_worker(unit: FetchUnit, handle: JoinHandle<WorkerOutcome>) -> WorkerOutcome {
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(unit = %unit.key, error = %e, "Fetch worker panicked");
            let message = format!("fetch worker panicked: {}", e);
            WorkerOutcome::Failed(FetchResult::failure(unit, FetchErrorKind::Permanent, 0, 0, message))
        }
    }
}

/// Worker body: fetch one unit and write its record
async fn fetch_and_store(
    client: Arc<ApiClient>,
    store: RecordStore,
    policy: BackoffPolicy,
    unit: FetchUnit,
    cancel: CancellationToken,
) -> WorkerOutcome {
    if cancel.is_cancelled() {
        return WorkerOutcome::Cancelled;
    }

    let result = client.fetch(&unit, &cancel).await;
    match result.outcome() {
        FetchOutcome::Success => {}
        FetchOutcome::Cancelled => return WorkerOutcome::Cancelled,
        // Exhausted transient failures are abandoned like permanent ones
        FetchOutcome::TransientFailure | FetchOutcome::PermanentFailure => {
            return WorkerOutcome::Failed(result)
        }
    }

    let Some(payload) = result.payload else {
        return WorkerOutcome::Cancelled;
    };
    let record = Record::new(unit.collection_key(), unit.record_id(), payload).with_attempt(result.attempt);

    match with_storage_retry(&policy, &cancel, || store.write(&record)).await {
        Ok(stored) => WorkerOutcome::Stored {
            unit,
            record: stored,
        },
        Err(IngestError::Cancelled) => WorkerOutcome::Cancelled,
        Err(error) => WorkerOutcome::StorageFailed { unit, error },
    }
}

/// Retry a storage operation on `StorageWriteFailure`
async fn with_storage_retry<T, F, Fut>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> IngestResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = IngestResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e @ IngestError::StorageWriteFailure { .. }) if policy.allows_retry(attempt) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Storage write failed, retrying"
                );
                sleep_cancellable(delay, cancel).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_policy(attempts: u32) -> BackoffPolicy {
        BackoffPolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[tokio::test]
    async fn test_storage_retry_recovers() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = with_storage_retry(&fast_policy(3), &cancel, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(IngestError::StorageWriteFailure {
                    path: "x".to_string(),
                    message: "disk full".to_string(),
                })
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_storage_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: IngestResult<()> = with_storage_retry(&fast_policy(2), &cancel, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(IngestError::StorageWriteFailure {
                path: "x".to_string(),
                message: "read-only".to_string(),
            })
        })
        .await;

        assert!(matches!(result, Err(IngestError::StorageWriteFailure { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicked_worker_counts_as_failed_unit() {
        let unit = FetchUnit::new(Collection::Bill, 118, "118/hr/5");
        let handle: JoinHandle<WorkerOutcome> = tokio::spawn(async { panic!("malformed payload") });

        match join_worker(unit, handle).await {
            WorkerOutcome::Failed(result) => {
                assert_eq!(result.unit.record_id(), "118-hr-5");
                assert_eq!(result.outcome(), FetchOutcome::PermanentFailure);
                assert!(result.message.unwrap().contains("panicked"));
            }
            _ => panic!("expected a failed outcome"),
        }
    }

    #[tokio::test]
    async fn test_other_errors_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: IngestResult<()> = with_storage_retry(&fast_policy(5), &cancel, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(IngestError::BadRequest("nope".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
