// Error taxonomy for the registry core
//
// Validation problems are caught by the query compiler before the store is
// touched, store failures are split into transient (retryable) and fatal, and
// ingestion failures distinguish bad data from infrastructure trouble.

use std::time::Duration;
use thiserror::Error;

// ============================================================================
// QUERY ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("'{field}' is not a searchable field for {entity_type}")]
    UnknownField { field: String, entity_type: String },

    #[error("operator {operator} is not valid for field '{field}'; valid operators are: {valid}")]
    InvalidOperatorForField {
        field: String,
        operator: String,
        valid: String,
    },

    #[error("malformed value '{value}' for field '{field}': {reason}")]
    MalformedFilterValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("filter group must contain at least one filter")]
    EmptyGroup,
}

// ============================================================================
// STORE ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    /// Backing store asked us to slow down
    #[error("store throttled the request")]
    Throttled { retry_after: Option<Duration> },

    #[error("store request timed out")]
    Timeout,

    #[error("store operation failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("store operation cancelled")]
    Cancelled,

    #[error("compiled query rejected: {0}")]
    Query(#[from] QueryError),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("failed to (de)serialize stored document: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Throttling and timeouts are worth another attempt, everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Throttled { .. } | StoreError::Timeout)
    }

    /// Server-specified backoff, if the backend sent one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            StoreError::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::Throttled { retry_after: None }
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

// ============================================================================
// SYNC ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum SyncError {
    /// Bad data or contract violation; the item must not be retried
    #[error("unprocessable event: {0}")]
    UnprocessableEvent(String),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Store(StoreError),

    #[error("reconciliation cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, SyncError::UnprocessableEvent(_) | SyncError::Query(_))
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Cancelled => SyncError::Cancelled,
            other => SyncError::Store(other),
        }
    }
}

// ============================================================================
// CONFIG ERRORS
// ============================================================================

#[derive(Debug, Error)]
#[error("invalid configuration: {}", .problems.join("; "))]
pub struct ConfigError {
    pub problems: Vec<String>,
}
