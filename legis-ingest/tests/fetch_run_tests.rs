//! Fetch runs against a mocked Congress.gov

mod helpers;

use helpers::{bill_payload, source_orchestrator, mock_congress_config, TestRoot};
use legis_common::events::{EventBus, PipelineEvent};
use legis_ingest::models::{Collection, FetchUnit};
use legis_ingest::services::{Enumeration, FetchRequest};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn bill_keys(numbers: std::ops::RangeInclusive<u32>) -> Vec<String> {
    numbers.map(|n| format!("118/hr/{}", n)).collect()
}

async fn mount_bill_default(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/bill/118/hr/\d+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "bill": bill_payload(1, None) })))
        .with_priority(10)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_partial_success_with_permanent_and_transient_failures() {
    let server = MockServer::start().await;
    let root = TestRoot::new().await;

    Mock::given(method("GET"))
        .and(path("/bill/118/hr/4"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .with_priority(1)
        .mount(&server)
        .await;

    // Two responses slower than the client timeout, then the default mock
    Mock::given(method("GET"))
        .and(path("/bill/118/hr/7"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "bill": bill_payload(7, None) }))
                .set_delay(Duration::from_secs(2)),
        )
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;

    mount_bill_default(&server).await;

    let event_bus = EventBus::new(256);
    let mut events = event_bus.subscribe();
    let (orchestrator, _client) = source_orchestrator(
        mock_congress_config(&server, Duration::from_millis(300)),
        root.store.clone(),
        event_bus,
    );

    let mut request = FetchRequest::new(Collection::Bill, 118, 3);
    request.keys = bill_keys(1..=10);
    let summary = orchestrator
        .run_request(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.fetched, 9);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 0);
    assert!(!summary.cancelled);
    assert_eq!(summary.failures[0].key, "118-hr-4");
    assert_eq!(summary.failures[0].http_status, 404);
    assert_eq!(summary.failures[0].attempts, 1);

    let index = root.store.read_index("bill-118").await.unwrap();
    assert_eq!(index.len(), 9);
    assert!(!index.contains("118-hr-4"));

    let slow = root.store.read_latest("bill-118", "118-hr-7").await.unwrap().unwrap();
    assert_eq!(slow.attempt, 3);

    let mut failed_events = 0;
    let mut finished = false;
    while let Ok(event) = events.try_recv() {
        match event {
            PipelineEvent::UnitFailed { key, http_status, .. } => {
                assert_eq!(key, "118/hr/4");
                assert_eq!(http_status, 404);
                failed_events += 1;
            }
            PipelineEvent::FetchRunFinished { fetched, failed, .. } => {
                assert_eq!((fetched, failed), (9, 1));
                finished = true;
            }
            _ => {}
        }
    }
    assert_eq!(failed_events, 1);
    assert!(finished);
}

#[tokio::test]
async fn test_rerun_of_complete_collection_sends_no_requests() {
    let server = MockServer::start().await;
    let root = TestRoot::new().await;
    mount_bill_default(&server).await;

    let (orchestrator, client) = source_orchestrator(
        mock_congress_config(&server, Duration::from_secs(5)),
        root.store.clone(),
        EventBus::new(16),
    );

    let mut request = FetchRequest::new(Collection::Bill, 118, 4);
    request.keys = bill_keys(1..=10);
    let cancel = CancellationToken::new();

    let first = orchestrator.run_request(&request, &cancel).await.unwrap();
    assert_eq!(first.fetched, 10);
    let sent = client.requests_sent();
    assert_eq!(sent, 10);

    let second = orchestrator.run_request(&request, &cancel).await.unwrap();
    assert_eq!(second.fetched, 0);
    assert_eq!(second.skipped, 10);
    assert_eq!(client.requests_sent(), sent);
    assert_eq!(server.received_requests().await.unwrap().len(), 10);
}

#[tokio::test]
async fn test_refetch_writes_new_versions() {
    let server = MockServer::start().await;
    let root = TestRoot::new().await;
    mount_bill_default(&server).await;

    let (orchestrator, _client) = source_orchestrator(
        mock_congress_config(&server, Duration::from_secs(5)),
        root.store.clone(),
        EventBus::new(16),
    );
    let cancel = CancellationToken::new();

    let mut request = FetchRequest::new(Collection::Bill, 118, 2);
    request.keys = bill_keys(1..=2);
    orchestrator.run_request(&request, &cancel).await.unwrap();

    request.refetch = true;
    let summary = orchestrator.run_request(&request, &cancel).await.unwrap();
    assert_eq!(summary.fetched, 2);

    let latest = root.store.read_latest("bill-118", "118-hr-1").await.unwrap().unwrap();
    assert_eq!(latest.version, 2);
    assert_eq!(root.store.read_index("bill-118").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_rate_limited_response_is_retried() {
    let server = MockServer::start().await;
    let root = TestRoot::new().await;

    Mock::given(method("GET"))
        .and(path("/bill/118/hr/1"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_bill_default(&server).await;

    let (orchestrator, _client) = source_orchestrator(
        mock_congress_config(&server, Duration::from_secs(5)),
        root.store.clone(),
        EventBus::new(16),
    );

    let mut request = FetchRequest::new(Collection::Bill, 118, 1);
    request.keys = bill_keys(1..=1);
    let summary = orchestrator
        .run_request(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.fetched, 1);
    assert_eq!(summary.failed, 0);
    let record = root.store.read_latest("bill-118", "118-hr-1").await.unwrap().unwrap();
    assert_eq!(record.attempt, 2);
}

#[tokio::test]
async fn test_schema_invalid_payload_is_permanent() {
    let server = MockServer::start().await;
    let root = TestRoot::new().await;

    Mock::given(method("GET"))
        .and(path("/bill/118/hr/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "unexpected": [] })))
        .mount(&server)
        .await;

    let (orchestrator, _client) = source_orchestrator(
        mock_congress_config(&server, Duration::from_secs(5)),
        root.store.clone(),
        EventBus::new(16),
    );

    let mut request = FetchRequest::new(Collection::Bill, 118, 1);
    request.keys = bill_keys(1..=1);
    let summary = orchestrator
        .run_request(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].attempts, 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_enumeration_uses_upstream_count() {
    let server = MockServer::start().await;
    let root = TestRoot::new().await;

    Mock::given(method("GET"))
        .and(path("/bill/118/hr"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "bills": [],
            "pagination": { "count": 3 }
        })))
        .mount(&server)
        .await;
    mount_bill_default(&server).await;

    let (orchestrator, _client) = source_orchestrator(
        mock_congress_config(&server, Duration::from_secs(5)),
        root.store.clone(),
        EventBus::new(16),
    );

    let mut request = FetchRequest::new(Collection::Bill, 118, 2);
    request.enumeration = Enumeration {
        bill_types: vec!["HR".to_string()],
        ..Default::default()
    };
    let summary = orchestrator
        .run_request(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.fetched, 3);
    let index = root.store.read_index("bill-118").await.unwrap();
    let ids: Vec<&String> = index.known_ids.iter().collect();
    assert_eq!(ids, ["118-hr-1", "118-hr-2", "118-hr-3"]);
}

#[tokio::test]
async fn test_vote_members_merged_from_paginated_sub_resource() {
    let server = MockServer::start().await;
    let root = TestRoot::new().await;

    Mock::given(method("GET"))
        .and(path("/house-vote/118/1/17"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "houseRollCallVote": { "result": "Passed", "voteQuestion": "On Passage" }
        })))
        .mount(&server)
        .await;

    let next = format!("{}/house-vote/118/1/17/members?offset=2&limit=2", server.uri());
    Mock::given(method("GET"))
        .and(path("/house-vote/118/1/17/members"))
        .and(wiremock::matchers::query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "houseRollCallVoteMemberVotes": { "results": [
                { "bioguideID": "C000003", "voteCast": "Yea" }
            ]},
            "pagination": { "count": 3 }
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/house-vote/118/1/17/members"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "houseRollCallVoteMemberVotes": { "results": [
                { "bioguideID": "A000001", "voteCast": "Yea" },
                { "bioguideID": "B000002", "voteCast": "Nay" }
            ]},
            "pagination": { "count": 3, "next": next }
        })))
        .with_priority(5)
        .mount(&server)
        .await;

    let (_orchestrator, client) = source_orchestrator(
        mock_congress_config(&server, Duration::from_secs(5)),
        root.store.clone(),
        EventBus::new(16),
    );

    let result = client
        .fetch(&FetchUnit::new(Collection::Vote, 118, "118/1/17"), &CancellationToken::new())
        .await;
    let payload = result.payload.unwrap();
    assert_eq!(payload["result"], "Passed");
    assert_eq!(payload["members"].as_array().unwrap().len(), 3);
    assert_eq!(payload["members"][2]["bioguideID"], "C000003");

    // Three calls for one logical unit, each through the limiter
    assert_eq!(client.requests_sent(), 3);
}

#[tokio::test]
async fn test_cancelled_run_reports_cancellation() {
    let server = MockServer::start().await;
    let root = TestRoot::new().await;
    mount_bill_default(&server).await;

    let (orchestrator, client) = source_orchestrator(
        mock_congress_config(&server, Duration::from_secs(5)),
        root.store.clone(),
        EventBus::new(16),
    );

    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut request = FetchRequest::new(Collection::Bill, 118, 2);
    request.keys = bill_keys(1..=5);
    let summary = orchestrator.run_request(&request, &cancel).await.unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.fetched, 0);
    assert_eq!(client.requests_sent(), 0);
}

#[tokio::test]
async fn test_lda_filings_enumerated_by_page_number() {
    use legis_ingest::config::{AuthMode, PaginationStyle, SourceConfig};
    use legis_ingest::models::SourceId;
    use wiremock::matchers::query_param;

    let server = MockServer::start().await;
    let root = TestRoot::new().await;

    // Congress 118 covers filing years 2023 and 2024
    Mock::given(method("GET"))
        .and(path("/filings/"))
        .and(query_param("filing_year", "2023"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 3,
            "next": "page-2",
            "results": [{ "filing_uuid": "aaa-1" }, { "filing_uuid": "aaa-2" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/filings/"))
        .and(query_param("filing_year", "2023"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 3,
            "next": null,
            "results": [{ "filing_uuid": "aaa-3" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/filings/"))
        .and(query_param("filing_year", "2024"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 1,
            "next": null,
            "results": [{ "filing_uuid": "aaa-2" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/filings/aaa-\d/$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "filing_year": 2023,
            "registrant": { "name": "Registrant" }
        })))
        .mount(&server)
        .await;

    let config = SourceConfig {
        source: SourceId::Lda,
        base_url: server.uri(),
        auth: AuthMode::Anonymous,
        rate_limit: std::num::NonZeroU32::new(100).unwrap(),
        window: Duration::from_secs(60),
        min_interval: None,
        pagination: PaginationStyle::PageNumber,
        page_size: 2,
        timeout: Duration::from_secs(5),
    };
    let (orchestrator, _client) = source_orchestrator(config, root.store.clone(), EventBus::new(16));

    let summary = orchestrator
        .run(Collection::LobbyingFiling, 118, 2, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.collection_key, "lobbying-filing-118");
    assert_eq!(summary.fetched, 3);
    let record = root
        .store
        .read_latest("lobbying-filing-118", "aaa-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.payload["registrant"]["name"], "Registrant");
}

#[tokio::test]
async fn test_collection_from_other_source_rejected() {
    let server = MockServer::start().await;
    let root = TestRoot::new().await;
    let (orchestrator, client) = source_orchestrator(
        mock_congress_config(&server, Duration::from_secs(5)),
        root.store.clone(),
        EventBus::new(16),
    );

    let result = orchestrator
        .run(Collection::LobbyingFiling, 118, 1, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(legis_ingest::IngestError::BadRequest(_))));
    assert_eq!(client.requests_sent(), 0);
}

#[tokio::test]
async fn test_unwritable_collection_exhausts_restarts() {
    let server = MockServer::start().await;
    let root = TestRoot::new().await;
    mount_bill_default(&server).await;

    // A plain file where the collection directory belongs makes every write fail
    std::fs::write(root.store.collection_dir("bill-118"), b"not a directory").unwrap();

    let event_bus = EventBus::new(64);
    let mut events = event_bus.subscribe();
    let (orchestrator, _client) = source_orchestrator(
        mock_congress_config(&server, Duration::from_secs(5)),
        root.store.clone(),
        event_bus,
    );

    let mut request = FetchRequest::new(Collection::Bill, 118, 1);
    request.keys = bill_keys(1..=1);
    let result = orchestrator
        .run_request(&request, &CancellationToken::new())
        .await;

    assert!(matches!(
        result,
        Err(legis_ingest::IngestError::StorageWriteFailure { .. })
    ));

    // fast_fetch_config allows one restart: two passes, one request each
    let mut passes = 0;
    let mut finished = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            PipelineEvent::FetchRunStarted { planned, .. } => {
                assert_eq!(planned, 1);
                passes += 1;
            }
            PipelineEvent::FetchRunFinished { fetched, .. } => {
                assert_eq!(fetched, 0);
                finished += 1;
            }
            _ => {}
        }
    }
    assert_eq!(passes, 2);
    assert_eq!(finished, 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    let index = root.store.read_index("bill-118").await.unwrap();
    assert!(index.is_empty());
}
