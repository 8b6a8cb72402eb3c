//! Typed failure taxonomy for task execution.
//!
//! `TaskError` is the only error type a task handler may return. Classification
//! for retry decisions happens by matching on the variant at the worker
//! boundary — never by inspecting message text. `anyhow` remains the internal
//! transport inside handler bodies; it surfaces here as the `System` variant.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of job failures for retry decisions.
///
/// This is the queue-level view of an error: the durable queue only needs to
/// know whether to redeliver, not why the task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient error - will retry if attempts remain
    #[default]
    Retryable,
    /// Permanent error - will not retry
    NonRetryable,
    /// Job was cancelled by user/system
    Cancelled,
    /// Job was interrupted by graceful shutdown - will retry
    Shutdown,
}

impl ErrorKind {
    /// Whether this error kind should trigger a retry
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable | ErrorKind::Shutdown)
    }
}

/// Error raised by a task handler.
///
/// Handlers pick the variant; the engine derives everything else (retry
/// behavior, terminal status, snapshot error codes) from it.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Input is malformed. Surfaced immediately, never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Input is well-formed but insufficient or stale for a correct result.
    /// Non-retryable: re-running the same input cannot help.
    #[error("insufficient input data: {0}")]
    DataQuality(String),

    /// Transient infrastructure fault (network, resource exhaustion).
    /// Retried up to the job's attempt budget.
    #[error("execution failure: {0}")]
    System(#[from] anyhow::Error),

    /// The handler observed its cancellation signal and aborted.
    #[error("cancelled")]
    Cancelled,
}

impl TaskError {
    /// Shorthand for a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        TaskError::Validation(message.into())
    }

    /// Shorthand for a data-quality limitation.
    pub fn data_quality(message: impl Into<String>) -> Self {
        TaskError::DataQuality(message.into())
    }

    /// Shorthand for a transient system failure.
    pub fn system(message: impl Into<String>) -> Self {
        TaskError::System(anyhow::anyhow!(message.into()))
    }

    /// The queue-level classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Validation(_) | TaskError::DataQuality(_) => ErrorKind::NonRetryable,
            TaskError::System(_) => ErrorKind::Retryable,
            TaskError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Stable machine-readable code for snapshots and events.
    pub fn code(&self) -> &'static str {
        match self {
            TaskError::Validation(_) => "validation",
            TaskError::DataQuality(_) => "data_quality",
            TaskError::System(_) => "system",
            TaskError::Cancelled => "cancelled",
        }
    }
}

/// Serializable error record carried by snapshots and terminal events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Machine-readable code (`validation`, `data_quality`, `system`, `timed_out`, ...).
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Whether the underlying failure was considered transient.
    pub retryable: bool,
}

impl JobError {
    /// The record written when the engine forces a `timed_out` transition.
    pub fn timed_out() -> Self {
        Self {
            code: "timed_out".to_string(),
            message: "job exceeded its execution deadline".to_string(),
            retryable: false,
        }
    }
}

impl From<&TaskError> for JobError {
    fn from(err: &TaskError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.kind().should_retry(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_error_should_retry() {
        assert!(ErrorKind::Retryable.should_retry());
        assert!(ErrorKind::Shutdown.should_retry());
    }

    #[test]
    fn non_retryable_error_should_not_retry() {
        assert!(!ErrorKind::NonRetryable.should_retry());
        assert!(!ErrorKind::Cancelled.should_retry());
    }

    #[test]
    fn validation_is_non_retryable() {
        let err = TaskError::validation("missing field");
        assert_eq!(err.kind(), ErrorKind::NonRetryable);
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn data_quality_is_non_retryable() {
        let err = TaskError::data_quality("price history too short");
        assert_eq!(err.kind(), ErrorKind::NonRetryable);
    }

    #[test]
    fn system_is_retryable() {
        let err = TaskError::system("connection reset");
        assert_eq!(err.kind(), ErrorKind::Retryable);
    }

    #[test]
    fn cancelled_maps_to_cancelled_kind() {
        assert_eq!(TaskError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn anyhow_converts_to_system() {
        fn failing() -> Result<(), TaskError> {
            let result: anyhow::Result<()> = Err(anyhow::anyhow!("socket closed"));
            result?;
            Ok(())
        }
        let err = failing().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Retryable);
        assert!(err.to_string().contains("socket closed"));
    }

    #[test]
    fn job_error_preserves_classification() {
        let err = TaskError::validation("bad payload");
        let record = JobError::from(&err);
        assert_eq!(record.code, "validation");
        assert!(!record.retryable);
        assert!(record.message.contains("bad payload"));
    }

    #[test]
    fn timed_out_record_is_not_retryable() {
        let record = JobError::timed_out();
        assert_eq!(record.code, "timed_out");
        assert!(!record.retryable);
    }
}
