//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The backing job store could not be reached or rejected the operation.
    #[error("job store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored or outgoing payload could not be (de)serialized.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// The time zone is not a known IANA zone name.
    #[error("invalid time zone: {0}")]
    InvalidTimeZone(String),

    /// A scheduling request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid scheduler configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Another active job already holds the key.
    #[error("active job already exists for key: {0}")]
    JobExists(String),
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        SchedulerError::StoreUnavailable(e.to_string())
    }
}

impl SchedulerError {
    /// Whether the caller should retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::StoreUnavailable(_))
    }
}

/// A single failed delivery attempt.
///
/// Every variant is recoverable: the job is rescheduled with backoff until
/// its attempts run out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The endpoint did not answer within the executor timeout.
    #[error("notification request timed out")]
    Timeout,

    /// The endpoint could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// The endpoint answered with a non-2xx status.
    #[error("notification endpoint returned status {0}")]
    Status(u16),

    /// Any other request failure (body encoding, redirect loops, ...).
    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for ExecutionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExecutionError::Timeout
        } else if e.is_connect() {
            ExecutionError::Connection(e.to_string())
        } else if let Some(status) = e.status() {
            ExecutionError::Status(status.as_u16())
        } else {
            ExecutionError::Request(e.to_string())
        }
    }
}
