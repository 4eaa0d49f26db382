//! Error types for legis-ingest
//!
//! Unit-level and batch-level failures are recovered locally and only
//! counted; the variants here that escape a run are the run-level ones
//! (storage loss, referential order, cancellation).

use thiserror::Error;

/// Pipeline error type
#[derive(Debug, Error)]
pub enum IngestError {
    /// Timeout, connection reset, 5xx or 429 that outlived its retries
    #[error("Transient network failure: {0}")]
    TransientNetwork(String),

    /// 4xx other than 429, or a payload that does not have the expected shape
    #[error("Permanent upstream failure (status {status}): {message}")]
    PermanentUpstream { status: u16, message: String },

    /// A record or index write to the file tier failed after retries
    #[error("Storage write failure for {path}: {message}")]
    StorageWriteFailure { path: String, message: String },

    /// A batch transaction could not commit because of contention
    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    /// Migration attempted before a prerequisite entity type completed
    #[error("Cannot migrate {entity}: prerequisite {prerequisite} is {state}")]
    ReferentialOrderViolation {
        entity: String,
        prerequisite: String,
        state: String,
    },

    /// Another migration of the same entity type is running in this process
    #[error("Migration already in progress for {0}")]
    MigrationInProgress(String),

    /// A source record could not be turned into target rows
    #[error("Transform failed for {id}: {message}")]
    Transform { id: String, message: String },

    /// The run was cancelled by the operator
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid request or configuration
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// legis-common error
    #[error(transparent)]
    Common(#[from] legis_common::Error),

    /// Generic error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    /// Whether a batch failing with this error is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IngestError::TransientNetwork(_) | IngestError::TransactionConflict(_)
        )
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Common(legis_common::Error::Database(err))
    }
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        IngestError::Common(legis_common::Error::Io(err))
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Common(legis_common::Error::Serialization(err))
    }
}

/// Result type for pipeline operations
pub type IngestResult<T> = Result<T, IngestError>;
