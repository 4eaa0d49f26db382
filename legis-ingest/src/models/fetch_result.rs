//! Outcome of fetching one unit

use super::FetchUnit;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why a fetch did not produce a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// Timeout, connection reset, 429 or 5xx; only seen between attempts
    Transient,
    /// Will not succeed on retry: 4xx, malformed payload, or retries exhausted
    Permanent,
    /// The run was cancelled before the unit completed
    Cancelled,
}

/// Classification of a `FetchResult`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
    Cancelled,
}

/// Result of `ApiClient::fetch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub unit: FetchUnit,
    pub payload: Option<Value>,
    /// Last HTTP status seen; 0 when no response was received
    pub http_status: u16,
    /// Attempts made, including the successful one
    pub attempt: u32,
    pub error: Option<FetchErrorKind>,
    pub message: Option<String>,
}

impl FetchResult {
    pub fn success(unit: FetchUnit, payload: Value, http_status: u16, attempt: u32) -> Self {
        Self {
            unit,
            payload: Some(payload),
            http_status,
            attempt,
            error: None,
            message: None,
        }
    }

    pub fn failure(
        unit: FetchUnit,
        kind: FetchErrorKind,
        http_status: u16,
        attempt: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            unit,
            payload: None,
            http_status,
            attempt,
            error: Some(kind),
            message: Some(message.into()),
        }
    }

    pub fn outcome(&self) -> FetchOutcome {
        match (self.error, &self.payload) {
            (None, Some(_)) => FetchOutcome::Success,
            (Some(FetchErrorKind::Transient), _) => FetchOutcome::TransientFailure,
            (Some(FetchErrorKind::Cancelled), _) => FetchOutcome::Cancelled,
            _ => FetchOutcome::PermanentFailure,
        }
    }
}
