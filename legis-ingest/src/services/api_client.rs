//! HTTP client for one upstream source
//!
//! Every underlying HTTP call, including each page of a paginated list and
//! each sub-resource call, first takes a grant from the source's shared
//! [`RateLimiter`]. Transient outcomes (timeouts, connection failures, 429,
//! 5xx, unreadable bodies) are retried with the shared [`BackoffPolicy`];
//! everything else fails the request at once.
//!
//! The client never touches storage.

use crate::config::{AuthMode, PaginationStyle, SourceConfig};
use crate::error::{IngestError, IngestResult};
use crate::models::{FetchErrorKind, FetchResult, FetchUnit, SourceId};
use crate::services::backoff::{sleep_cancellable, BackoffPolicy};
use crate::services::rate_limiter::RateLimiter;
use crate::services::sources::{detail_route, select};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound on pages followed for one list, guards against cursor loops
const MAX_PAGES: usize = 10_000;

/// A decoded 2xx response
#[derive(Debug)]
struct JsonResponse {
    status: u16,
    body: Value,
    attempts: u32,
}

/// Why a request produced no usable response
#[derive(Debug)]
struct RequestError {
    kind: FetchErrorKind,
    status: u16,
    attempts: u32,
    message: String,
    retry_after: Option<Duration>,
}

impl RequestError {
    fn transient(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Transient,
            status,
            attempts: 0,
            message: message.into(),
            retry_after: None,
        }
    }

    fn permanent(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Permanent,
            status,
            attempts: 0,
            message: message.into(),
            retry_after: None,
        }
    }

    fn cancelled() -> Self {
        Self {
            kind: FetchErrorKind::Cancelled,
            status: 0,
            attempts: 0,
            message: "cancelled".to_string(),
            retry_after: None,
        }
    }

    /// Unit-level result; an exhausted transient failure is permanent here
    fn into_fetch_result(self, unit: &FetchUnit) -> FetchResult {
        let kind = match self.kind {
            FetchErrorKind::Transient => FetchErrorKind::Permanent,
            other => other,
        };
        FetchResult::failure(unit.clone(), kind, self.status, self.attempts, self.message)
    }

    fn into_ingest_error(self) -> IngestError {
        match self.kind {
            FetchErrorKind::Transient => IngestError::TransientNetwork(self.message),
            FetchErrorKind::Permanent => IngestError::PermanentUpstream {
                status: self.status,
                message: self.message,
            },
            FetchErrorKind::Cancelled => IngestError::Cancelled,
        }
    }
}

/// Client for one upstream source
pub struct ApiClient {
    config: SourceConfig,
    http_client: reqwest::Client,
    rate_limiter: Arc<RateLimiter>,
    policy: BackoffPolicy,
    requests_sent: AtomicU64,
}

impl ApiClient {
    /// Create a client that gates every call through `rate_limiter`
    ///
    /// The limiter is injected so every client and run talking to the same
    /// upstream shares one budget.
    pub fn new(
        config: SourceConfig,
        rate_limiter: Arc<RateLimiter>,
        policy: BackoffPolicy,
    ) -> IngestResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(legis_common::config::get_user_agent())
            .timeout(config.timeout)
            .build()
            .map_err(|e| IngestError::BadRequest(format!("HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
            rate_limiter,
            policy,
            requests_sent: AtomicU64::new(0),
        })
    }

    pub fn source(&self) -> SourceId {
        self.config.source
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// HTTP requests sent so far, retries included
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    /// Fetch one unit as a single logical payload
    ///
    /// Never returns an error: every outcome, including cancellation, is a
    /// [`FetchResult`]. `attempt` is the highest attempt count any of the
    /// unit's underlying requests needed.
    #[tracing::instrument(skip(self, unit, cancel), fields(source = %self.config.source, unit = %unit.key))]
    pub async fn fetch(&self, unit: &FetchUnit, cancel: &CancellationToken) -> FetchResult {
        let route = match detail_route(unit) {
            Ok(route) => route,
            Err(e) => {
                return FetchResult::failure(unit.clone(), FetchErrorKind::Permanent, 0, 0, e.to_string())
            }
        };

        let query: Vec<(String, String)> = unit
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let response = match self.get_json(&self.url(&route.path), &query, cancel).await {
            Ok(response) => response,
            Err(e) => return e.into_fetch_result(unit),
        };
        let mut attempts = response.attempts;

        let payload = match route.envelope {
            Some(envelope) => response.body.get(envelope).cloned(),
            None => Some(response.body),
        };
        let mut payload = match payload {
            Some(Value::Object(map)) => Value::Object(map),
            _ => {
                tracing::warn!(envelope = ?route.envelope, "Response does not have the expected shape");
                return FetchResult::failure(
                    unit.clone(),
                    FetchErrorKind::Permanent,
                    response.status,
                    attempts,
                    format!(
                        "schema-invalid payload: expected object{}",
                        route
                            .envelope
                            .map(|e| format!(" under \"{}\"", e))
                            .unwrap_or_default()
                    ),
                );
            }
        };

        if let Some(sub) = route.sub_resource {
            match self.collect_pages(&sub.path, &[], sub.items, cancel).await {
                Ok((items, sub_attempts)) => {
                    attempts = attempts.max(sub_attempts);
                    payload[sub.merge_key] = Value::Array(items);
                }
                Err(e) => return e.into_fetch_result(unit),
            }
        }

        tracing::debug!(attempts, "Unit fetched");
        FetchResult::success(unit.clone(), payload, response.status, attempts)
    }

    /// Collect every item of a paginated list
    ///
    /// `items` is the key path from the response root to the item array.
    pub async fn list(
        &self,
        path: &str,
        query: &[(String, String)],
        items: &[&str],
        cancel: &CancellationToken,
    ) -> IngestResult<Vec<Value>> {
        self.collect_pages(path, query, items, cancel)
            .await
            .map(|(items, _)| items)
            .map_err(RequestError::into_ingest_error)
    }

    /// Total item count a list endpoint reports, from a one-item page
    pub async fn count(&self, path: &str, cancel: &CancellationToken) -> IngestResult<u64> {
        let (size_param, count_path): (&str, &[&str]) = match self.config.pagination {
            PaginationStyle::NextUrl => ("limit", &["pagination", "count"]),
            PaginationStyle::PageNumber => ("page_size", &["count"]),
        };
        let query = [(size_param.to_string(), "1".to_string())];

        let response = self
            .get_json(&self.url(path), &query, cancel)
            .await
            .map_err(RequestError::into_ingest_error)?;

        select(&response.body, count_path)
            .and_then(Value::as_u64)
            .ok_or_else(|| IngestError::PermanentUpstream {
                status: response.status,
                message: format!("{} response has no {}", path, count_path.join(".")),
            })
    }

    async fn collect_pages(
        &self,
        path: &str,
        query: &[(String, String)],
        items_path: &[&str],
        cancel: &CancellationToken,
    ) -> Result<(Vec<Value>, u32), RequestError> {
        let mut collected = Vec::new();
        let mut max_attempts = 0;
        let page_size = self.config.page_size.to_string();

        match self.config.pagination {
            PaginationStyle::NextUrl => {
                let mut url = self.url(path);
                let mut page_query: Vec<(String, String)> = query.to_vec();
                page_query.push(("limit".to_string(), page_size));

                for _ in 0..MAX_PAGES {
                    let response = self.get_json(&url, &page_query, cancel).await?;
                    max_attempts = max_attempts.max(response.attempts);
                    collected.extend(page_items(&response, items_path)?);

                    match select(&response.body, &["pagination", "next"]).and_then(Value::as_str) {
                        Some(next) if !next.is_empty() => {
                            // The cursor URL carries its own offset/limit
                            url = next.to_string();
                            page_query.clear();
                        }
                        _ => break,
                    }
                }
            }
            PaginationStyle::PageNumber => {
                for page in 1..=MAX_PAGES {
                    let mut page_query: Vec<(String, String)> = query.to_vec();
                    page_query.push(("page".to_string(), page.to_string()));
                    page_query.push(("page_size".to_string(), page_size.clone()));

                    let response = self.get_json(&self.url(path), &page_query, cancel).await?;
                    max_attempts = max_attempts.max(response.attempts);
                    let items = page_items(&response, items_path)?;
                    let empty = items.is_empty();
                    collected.extend(items);

                    let has_next = response.body.get("next").map_or(false, |n| !n.is_null());
                    if !has_next || empty {
                        break;
                    }
                }
            }
        }

        tracing::debug!(path, items = collected.len(), "List collected");
        Ok((collected, max_attempts))
    }

    /// GET with retry on transient failures
    async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<JsonResponse, RequestError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            if self.rate_limiter.acquire(cancel).await.is_err() {
                return Err(RequestError {
                    attempts: attempt - 1,
                    ..RequestError::cancelled()
                });
            }

            let outcome = tokio::select! {
                outcome = self.send_once(url, query) => outcome,
                _ = cancel.cancelled() => Err(RequestError::cancelled()),
            };

            match outcome {
                Ok((status, body)) => {
                    return Ok(JsonResponse {
                        status,
                        body,
                        attempts: attempt,
                    })
                }
                Err(mut e) if e.kind == FetchErrorKind::Transient => {
                    e.attempts = attempt;
                    if !self.policy.allows_retry(attempt) {
                        tracing::warn!(
                            url,
                            attempts = attempt,
                            status = e.status,
                            error = %e.message,
                            "Retries exhausted"
                        );
                        e.message = format!("retries exhausted after {} attempts: {}", attempt, e.message);
                        return Err(e);
                    }

                    let backoff = self.policy.delay_for(attempt);
                    let delay = e.retry_after.map_or(backoff, |ra| ra.max(backoff));
                    tracing::warn!(
                        url,
                        attempt,
                        status = e.status,
                        delay_ms = delay.as_millis() as u64,
                        error = %e.message,
                        "Transient failure, retrying"
                    );

                    if sleep_cancellable(delay, cancel).await.is_err() {
                        return Err(RequestError {
                            attempts: attempt,
                            ..RequestError::cancelled()
                        });
                    }
                }
                Err(mut e) => {
                    e.attempts = attempt;
                    return Err(e);
                }
            }
        }
    }

    /// One HTTP exchange, classified
    async fn send_once(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<(u16, Value), RequestError> {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);

        let mut request = self.http_client.get(url).query(query);
        request = match &self.config.auth {
            AuthMode::ApiKeyQuery(key) => request.query(&[("api_key", key.as_str())]),
            AuthMode::Token(key) => request.header("Authorization", format!("Token {}", key)),
            AuthMode::Basic { username, password } => request.basic_auth(username, Some(password)),
            AuthMode::Anonymous => request,
        };
        if self.config.source == SourceId::Congress {
            request = request.query(&[("format", "json")]);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() => return Err(RequestError::permanent(0, e.to_string())),
            Err(e) => {
                let what = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection failed"
                } else {
                    "request failed"
                };
                return Err(RequestError::transient(0, format!("{}: {}", what, e)));
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(RequestError {
                retry_after,
                ..RequestError::transient(status.as_u16(), truncate(&format!("HTTP {}: {}", status, body)))
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RequestError::permanent(
                status.as_u16(),
                truncate(&format!("HTTP {}: {}", status, body)),
            ));
        }

        // A body cut off mid-transfer reads as malformed JSON; retry it
        let text = response
            .text()
            .await
            .map_err(|e| RequestError::transient(status.as_u16(), format!("body read failed: {}", e)))?;
        let body: Value = serde_json::from_str(&text).map_err(|e| {
            RequestError::transient(status.as_u16(), format!("malformed response: {}", e))
        })?;

        Ok((status.as_u16(), body))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }
}

fn page_items(response: &JsonResponse, items_path: &[&str]) -> Result<Vec<Value>, RequestError> {
    match select(&response.body, items_path) {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(_) => Err(RequestError::permanent(
            response.status,
            format!("schema-invalid page: {} is not an array", items_path.join(".")),
        )),
    }
}

fn truncate(message: &str) -> String {
    const LIMIT: usize = 300;
    if message.len() <= LIMIT {
        return message.to_string();
    }
    let mut end = LIMIT;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}
