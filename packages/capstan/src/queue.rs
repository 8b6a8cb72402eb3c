//! The durable queue seam.
//!
//! [`DurableQueue`] is the policy-light interface the worker pool executes
//! against: at-least-once delivery, one lease per job at a time, bounded retry
//! with backoff. [`InMemoryQueue`] is the single-process implementation; the
//! `capstan-postgres` crate implements the same trait against a shared broker
//! so multiple worker processes can cooperate.
//!
//! # Implementer Notes
//!
//! - Claiming must be atomic: a job goes to at most one executor per lease.
//! - A lease that expires without being acknowledged makes the job claimable
//!   again (same attempt — redelivery is not a retry).
//! - The queue owns retry accounting; `mark_failed` reports the disposition so
//!   the caller and the queue can never disagree about whether a retry runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::ErrorKind;
use crate::job::{Job, JobStatus};

/// A job handed to an executor under a lease.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: Job,
    /// 1-based execution attempt this lease covers.
    pub attempt: i32,
    pub lease_expires_at: DateTime<Utc>,
}

/// What the queue did with a reported failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDisposition {
    /// The job was re-queued for another attempt after backoff.
    Requeued {
        next_attempt: i32,
        retry_at: DateTime<Utc>,
    },
    /// No retry will run; the queue record is terminal.
    Exhausted,
}

/// Coarse lifecycle phase of the queue's own record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Coarse job record used for status fallback when the registry overlay has
/// no state (e.g. after a process restart).
#[derive(Debug, Clone)]
pub struct QueueRecord {
    pub job_id: Uuid,
    pub phase: QueuePhase,
    pub attempt: i32,
    pub error_message: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueRecord {
    /// Map the queue phase onto the status vocabulary of the snapshot API.
    pub fn coarse_status(&self) -> JobStatus {
        match self.phase {
            QueuePhase::Pending => JobStatus::Queued,
            QueuePhase::Running => JobStatus::Running,
            QueuePhase::Succeeded => JobStatus::Completed,
            QueuePhase::Failed => JobStatus::Failed,
            QueuePhase::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Broker-backed, at-least-once work queue.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Accept a job for immediate execution.
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Accept a job for execution at or after `run_at`.
    async fn schedule(&self, job: Job, run_at: DateTime<Utc>) -> Result<()>;

    /// Claim up to `limit` ready jobs under a lease. Jobs whose previous lease
    /// expired are redelivered here.
    async fn claim(&self, worker_id: &str, limit: usize) -> Result<Vec<LeasedJob>>;

    /// Extend the lease for a running job (heartbeat).
    async fn extend_lease(&self, job_id: Uuid) -> Result<()>;

    /// Acknowledge successful completion; the job will not be redelivered.
    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()>;

    /// Report a failure. The queue decides between re-queueing with backoff
    /// (retryable kinds with attempts remaining) and closing the record out.
    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        kind: ErrorKind,
    ) -> Result<RetryDisposition>;

    /// Cancel a job that has not been leased yet. Running jobs are cancelled
    /// cooperatively via their token, not through the queue.
    async fn cancel(&self, job_id: Uuid) -> Result<bool>;

    /// Number of jobs waiting to run (for wait estimates).
    async fn depth(&self) -> Result<usize>;

    /// Coarse record for a job, if the queue knows the ID.
    async fn lookup(&self, job_id: Uuid) -> Result<Option<QueueRecord>>;
}

#[derive(Debug)]
struct Slot {
    job: Job,
    phase: QueuePhase,
    attempt: i32,
    next_run_at: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    error_message: Option<String>,
    updated_at: DateTime<Utc>,
}

impl Slot {
    fn new(job: Job, run_at: Option<DateTime<Utc>>) -> Self {
        Self {
            job,
            phase: QueuePhase::Pending,
            attempt: 0,
            next_run_at: run_at,
            lease_expires_at: None,
            worker_id: None,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    fn claimable_at(&self, now: DateTime<Utc>) -> bool {
        match self.phase {
            QueuePhase::Pending => self.next_run_at.map_or(true, |at| at <= now),
            QueuePhase::Running => self.lease_expires_at.map_or(false, |at| at < now),
            _ => false,
        }
    }
}

/// In-process queue for single-instance deployments and tests.
///
/// Durability here means "survives the engine's own components", not process
/// death; multi-process deployments back the same trait with Postgres.
#[derive(Debug)]
pub struct InMemoryQueue {
    slots: Mutex<HashMap<Uuid, Slot>>,
    retry: RetryPolicy,
    lease_duration: chrono::Duration,
}

impl InMemoryQueue {
    pub fn new(retry: RetryPolicy, lease_duration: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            retry,
            lease_duration: chrono::Duration::from_std(lease_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        self.lock().insert(job.id, Slot::new(job, None));
        Ok(())
    }

    async fn schedule(&self, job: Job, run_at: DateTime<Utc>) -> Result<()> {
        self.lock().insert(job.id, Slot::new(job, Some(run_at)));
        Ok(())
    }

    async fn claim(&self, worker_id: &str, limit: usize) -> Result<Vec<LeasedJob>> {
        let now = Utc::now();
        let mut slots = self.lock();

        let mut ready: Vec<Uuid> = slots
            .values()
            .filter(|slot| slot.claimable_at(now))
            .map(|slot| slot.job.id)
            .collect();
        ready.sort_by_key(|id| {
            let slot = &slots[id];
            (slot.job.priority.as_i16(), slot.job.submitted_at)
        });

        let mut claimed = Vec::new();
        for id in ready.into_iter().take(limit) {
            let Some(slot) = slots.get_mut(&id) else {
                continue;
            };
            if slot.phase == QueuePhase::Pending {
                // Lease-expiry redelivery keeps the attempt number; only a
                // fresh pending claim consumes one.
                slot.attempt += 1;
            }
            slot.phase = QueuePhase::Running;
            slot.lease_expires_at = Some(now + self.lease_duration);
            slot.worker_id = Some(worker_id.to_string());
            slot.updated_at = now;
            claimed.push(LeasedJob {
                job: slot.job.clone(),
                attempt: slot.attempt,
                lease_expires_at: now + self.lease_duration,
            });
        }
        Ok(claimed)
    }

    async fn extend_lease(&self, job_id: Uuid) -> Result<()> {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(&job_id) {
            if slot.phase == QueuePhase::Running {
                slot.lease_expires_at = Some(Utc::now() + self.lease_duration);
                slot.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()> {
        let mut slots = self.lock();
        let slot = slots
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("unknown job {job_id}"))?;
        slot.phase = QueuePhase::Succeeded;
        slot.lease_expires_at = None;
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        kind: ErrorKind,
    ) -> Result<RetryDisposition> {
        let now = Utc::now();
        let mut slots = self.lock();
        let slot = slots
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("unknown job {job_id}"))?;

        slot.error_message = Some(error.to_string());
        slot.updated_at = now;

        if kind.should_retry() && slot.attempt < slot.job.max_attempts {
            let retry_at = now
                + chrono::Duration::from_std(self.retry.delay_for(slot.attempt))
                    .unwrap_or_else(|_| chrono::Duration::seconds(1));
            slot.phase = QueuePhase::Pending;
            slot.next_run_at = Some(retry_at);
            slot.lease_expires_at = None;
            slot.worker_id = None;
            return Ok(RetryDisposition::Requeued {
                next_attempt: slot.attempt + 1,
                retry_at,
            });
        }

        slot.phase = if kind == ErrorKind::Cancelled {
            QueuePhase::Cancelled
        } else {
            QueuePhase::Failed
        };
        slot.lease_expires_at = None;
        Ok(RetryDisposition::Exhausted)
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let mut slots = self.lock();
        match slots.get_mut(&job_id) {
            Some(slot) if slot.phase == QueuePhase::Pending => {
                slot.phase = QueuePhase::Cancelled;
                slot.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn depth(&self) -> Result<usize> {
        Ok(self
            .lock()
            .values()
            .filter(|slot| slot.phase == QueuePhase::Pending)
            .count())
    }

    async fn lookup(&self, job_id: Uuid) -> Result<Option<QueueRecord>> {
        Ok(self.lock().get(&job_id).map(|slot| QueueRecord {
            job_id,
            phase: slot.phase,
            attempt: slot.attempt,
            error_message: slot.error_message.clone(),
            submitted_at: slot.job.submitted_at,
            updated_at: slot.updated_at,
        }))
    }
}
