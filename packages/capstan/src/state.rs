//! The mutable run-time overlay for a single job.
//!
//! A `JobState` is created when a worker leases the job, not at submission.
//! It is mutated only by the lease-holding worker, with one exception: the
//! supervisor may write a terminal `timed_out` transition. Every terminal
//! write goes through the same guarded check (`status` must still be
//! non-terminal), so whichever writer fires first wins and the rest are
//! no-ops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::JobError;
use crate::job::{Job, JobStatus};

/// Stage label for a job that has been leased but not yet reported progress.
pub const STAGE_RUNNING: &str = "running";
/// Stage label for a job waiting in the queue (initial submission or retry).
pub const STAGE_QUEUED: &str = "queued";

/// Fine-grained run-time state for one job.
#[derive(Debug)]
pub struct JobState {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub stage: String,
    pub progress_percent: u8,
    pub message: Option<String>,
    pub result_ref: Option<serde_json::Value>,
    pub error: Option<JobError>,
    /// 1-based execution attempt this state belongs to.
    pub attempt: i32,
    pub updated_at: DateTime<Utc>,
    pub(crate) cancellation: CancellationToken,
}

impl JobState {
    /// State for a freshly leased attempt. On redelivery the previous attempt's
    /// progress is discarded and rebuilt from scratch.
    pub fn leased(job: &Job, attempt: i32, cancellation: CancellationToken) -> Self {
        Self {
            job_id: job.id,
            status: JobStatus::Running,
            stage: STAGE_RUNNING.to_string(),
            progress_percent: 0,
            message: None,
            result_ref: None,
            error: None,
            attempt,
            updated_at: Utc::now(),
            cancellation,
        }
    }

    /// Terminal state synthesized when a job is cancelled before any worker
    /// leased it.
    pub fn cancelled_before_lease(job_id: Uuid) -> Self {
        let cancellation = CancellationToken::new();
        cancellation.cancel();
        Self {
            job_id,
            status: JobStatus::Cancelled,
            stage: "cancelled".to_string(),
            progress_percent: 0,
            message: None,
            result_ref: None,
            error: None,
            attempt: 0,
            updated_at: Utc::now(),
            cancellation,
        }
    }

    /// Record a progress report from the task handler.
    ///
    /// Progress is monotonic within an attempt: a report with a lower percent
    /// keeps the current value but still updates stage and message. Returns
    /// the effective percent, or `None` (changing nothing) once the state is
    /// terminal.
    pub fn record_progress(
        &mut self,
        stage: &str,
        percent: u8,
        message: Option<String>,
    ) -> Option<u8> {
        if self.status.is_terminal() {
            return None;
        }
        self.status = JobStatus::Running;
        self.stage = stage.to_string();
        self.progress_percent = self.progress_percent.max(percent.min(100));
        self.message = message;
        self.updated_at = Utc::now();
        Some(self.progress_percent)
    }

    /// Revert toward queued semantics after a retryable failure with attempts
    /// remaining. Not a terminal write; the next lease re-initializes.
    pub fn requeue(&mut self, message: String) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Queued;
        self.stage = STAGE_QUEUED.to_string();
        self.progress_percent = 0;
        self.message = Some(message);
        self.updated_at = Utc::now();
        true
    }

    /// Terminal `completed` transition. No-op once terminal.
    pub fn complete(&mut self, result_ref: serde_json::Value) -> bool {
        self.finish(JobStatus::Completed, |state| {
            state.stage = "completed".to_string();
            state.progress_percent = 100;
            state.result_ref = Some(result_ref);
        })
    }

    /// Terminal `failed` transition. No-op once terminal.
    pub fn fail(&mut self, error: JobError) -> bool {
        self.finish(JobStatus::Failed, |state| {
            state.stage = "failed".to_string();
            state.error = Some(error);
        })
    }

    /// Terminal `cancelled` transition. No-op once terminal.
    pub fn cancel(&mut self) -> bool {
        self.finish(JobStatus::Cancelled, |state| {
            state.stage = "cancelled".to_string();
        })
    }

    /// Terminal `timed_out` transition, used by both the per-job timer and the
    /// stale sweep. No-op once terminal.
    pub fn time_out(&mut self) -> bool {
        self.finish(JobStatus::TimedOut, |state| {
            state.stage = "timed_out".to_string();
            state.error = Some(JobError::timed_out());
        })
    }

    fn finish(&mut self, status: JobStatus, apply: impl FnOnce(&mut Self)) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        apply(self);
        self.updated_at = Utc::now();
        // A live cancellation handle exists only while the job is non-terminal.
        self.cancellation.cancel();
        true
    }

    /// The cooperative cancellation handle for this attempt.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

/// Point-in-time view of a job, assembled from the registry overlay or
/// synthesized coarsely from the durable queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub stage: Option<String>,
    pub progress_percent: Option<u8>,
    pub message: Option<String>,
    pub result_ref: Option<serde_json::Value>,
    pub error: Option<JobError>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusSnapshot {
    /// Snapshot for an ID neither the registry nor the queue knows about.
    pub fn unknown(job_id: Uuid) -> Self {
        Self {
            job_id,
            status: JobStatus::Unknown,
            stage: None,
            progress_percent: None,
            message: None,
            result_ref: None,
            error: None,
            updated_at: None,
        }
    }
}

impl From<&JobState> for StatusSnapshot {
    fn from(state: &JobState) -> Self {
        Self {
            job_id: state.job_id,
            status: state.status,
            stage: Some(state.stage.clone()),
            progress_percent: Some(state.progress_percent),
            message: state.message.clone(),
            result_ref: state.result_ref.clone(),
            error: state.error.clone(),
            updated_at: Some(state.updated_at),
        }
    }
}
