//! In-memory overlay of fine-grained job state.
//!
//! The durable queue's record is coarse (pending/running/done) while callers
//! need stage and progress detail; the registry supplements it. It is an
//! injectable value owned by the engine instance, never a module-level
//! singleton, and holds state only for jobs this process has touched —
//! a single-process optimization, not a durability layer.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::JobError;
use crate::job::{Job, JobStatus};
use crate::state::{JobState, StatusSnapshot};

/// Registry of per-job run-time state, keyed by job ID.
#[derive(Debug, Default)]
pub struct JobRegistry {
    states: DashMap<Uuid, JobState>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize (or re-initialize, on redelivery) state for a leased
    /// attempt and return its cancellation token.
    ///
    /// Returns `None` if the job already reached a terminal status — the
    /// queue redelivered work the engine has already closed out, and the
    /// attempt must not run.
    pub fn begin_attempt(
        &self,
        job: &Job,
        attempt: i32,
        parent: &CancellationToken,
    ) -> Option<CancellationToken> {
        let token = parent.child_token();
        match self.states.entry(job.id) {
            Entry::Occupied(mut occupied) => {
                let prior = occupied.get();
                if prior.status.is_terminal() {
                    return None;
                }
                // A cancel requested between attempts carries over.
                if prior.cancellation.is_cancelled() {
                    token.cancel();
                }
                occupied.insert(JobState::leased(job, attempt, token.clone()));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(JobState::leased(job, attempt, token.clone()));
            }
        }
        Some(token)
    }

    /// Record a progress report. Returns the effective (monotonic) percent,
    /// or `None` if the job is unknown or already terminal.
    pub fn record_progress(
        &self,
        job_id: Uuid,
        stage: &str,
        percent: u8,
        message: Option<String>,
    ) -> Option<u8> {
        self.states
            .get_mut(&job_id)
            .and_then(|mut state| state.record_progress(stage, percent, message))
    }

    /// Revert a job toward queued semantics for its next attempt.
    pub fn requeue(&self, job_id: Uuid, message: String) -> bool {
        self.states
            .get_mut(&job_id)
            .map(|mut state| state.requeue(message))
            .unwrap_or(false)
    }

    /// Guarded terminal `completed` write.
    pub fn complete(&self, job_id: Uuid, result_ref: serde_json::Value) -> bool {
        self.states
            .get_mut(&job_id)
            .map(|mut state| state.complete(result_ref))
            .unwrap_or(false)
    }

    /// Guarded terminal `failed` write.
    pub fn fail(&self, job_id: Uuid, error: JobError) -> bool {
        self.states
            .get_mut(&job_id)
            .map(|mut state| state.fail(error))
            .unwrap_or(false)
    }

    /// Guarded terminal `cancelled` write.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        self.states
            .get_mut(&job_id)
            .map(|mut state| state.cancel())
            .unwrap_or(false)
    }

    /// Guarded terminal `timed_out` write, shared by the per-job timer and the
    /// stale sweep. Whichever writer fires first wins.
    pub fn time_out(&self, job_id: Uuid) -> bool {
        self.states
            .get_mut(&job_id)
            .map(|mut state| state.time_out())
            .unwrap_or(false)
    }

    /// Insert a terminal `cancelled` record for a job that never reached a
    /// worker. Returns `false` if state already exists.
    pub fn insert_cancelled_before_lease(&self, job_id: Uuid) -> bool {
        match self.states.entry(job_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(JobState::cancelled_before_lease(job_id));
                true
            }
        }
    }

    /// The cancellation token for a job, if the registry holds state for it
    /// and the job is still non-terminal.
    pub fn cancellation_token(&self, job_id: Uuid) -> Option<CancellationToken> {
        self.states.get(&job_id).and_then(|state| {
            if state.status.is_terminal() {
                None
            } else {
                Some(state.cancellation())
            }
        })
    }

    /// Authoritative fine-grained snapshot, if this process holds state.
    pub fn snapshot(&self, job_id: Uuid) -> Option<StatusSnapshot> {
        self.states
            .get(&job_id)
            .map(|state| StatusSnapshot::from(&*state))
    }

    /// Leased jobs whose state has not moved within `stale_after`.
    ///
    /// Only running states qualify: a queued state is waiting on the queue's
    /// own redelivery (retry backoff may legitimately exceed the staleness
    /// threshold), and terminal states are settled.
    pub fn stale_candidates(&self, stale_after: Duration) -> Vec<Uuid> {
        let Some(cutoff) = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|d| chrono::Utc::now().checked_sub_signed(d))
        else {
            return Vec::new();
        };
        self.states
            .iter()
            .filter(|entry| entry.status == JobStatus::Running && entry.updated_at < cutoff)
            .map(|entry| entry.job_id)
            .collect()
    }

    /// Drop terminal states older than `retention`, returning the evicted IDs
    /// so the bus and idempotency index can release their references.
    pub fn evict_expired(&self, retention: Duration) -> Vec<Uuid> {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|d| chrono::Utc::now().checked_sub_signed(d))
        else {
            return Vec::new();
        };
        let expired: Vec<Uuid> = self
            .states
            .iter()
            .filter(|entry| entry.status.is_terminal() && entry.updated_at < cutoff)
            .map(|entry| entry.job_id)
            .collect();
        for job_id in &expired {
            self.states.remove(job_id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
