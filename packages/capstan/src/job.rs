//! Job model: the immutable unit of submitted work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a job as reported by the status API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    /// Neither the registry nor the durable queue knows this ID.
    Unknown,
}

impl JobStatus {
    /// Terminal statuses are absorbing: once written, the state is immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::TimedOut | JobStatus::Cancelled
        )
    }

    /// Whether the job is still live (queued or running).
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

/// Scheduling priority. Lower integer value claims first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Convert to integer for efficient ordering (lower = higher priority)
    pub fn as_i16(&self) -> i16 {
        match self {
            JobPriority::Critical => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }
}

/// A submitted unit of work.
///
/// Created once at submission and never mutated; the durable queue owns the
/// record. All run-time mutation lives in the registry overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Selects the registered task handler.
    pub job_type: String,
    /// Opaque to the engine; handed to the handler verbatim.
    pub payload: serde_json::Value,
    pub correlation_id: String,
    pub idempotency_key: Option<String>,
    pub priority: JobPriority,
    /// Total execution attempts allowed, first run included.
    pub max_attempts: i32,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    /// Create a job with a fresh ID and default policies.
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            job_type: job_type.into(),
            payload,
            correlation_id: id.to_string(),
            idempotency_key: None,
            priority: JobPriority::default(),
            max_attempts: 3,
            submitted_at: Utc::now(),
        }
    }

    /// Override the broker-assigned ID with a caller-assigned one. A default
    /// correlation ID follows the new ID.
    pub fn with_job_id(mut self, id: Uuid) -> Self {
        if self.correlation_id == self.id.to_string() {
            self.correlation_id = id.to_string();
        }
        self.id = id;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}
