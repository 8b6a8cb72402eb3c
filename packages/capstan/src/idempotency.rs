//! Idempotency index: caller-supplied key → job ID of its still-active job.
//!
//! The mapping is only honored while the referenced job is non-terminal; the
//! engine checks liveness before deduplicating, so a stale entry is inert the
//! moment its job terminates. Entries are garbage-collected when their job is
//! evicted from the registry.

use dashmap::DashMap;
use uuid::Uuid;

/// Maps idempotency keys to the job currently owning them.
#[derive(Debug, Default)]
pub struct IdempotencyIndex {
    entries: DashMap<String, Uuid>,
}

impl IdempotencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// The job currently recorded for `key`, if any. Liveness is the caller's
    /// responsibility.
    pub fn resolve(&self, key: &str) -> Option<Uuid> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    /// Record (or overwrite a stale) mapping.
    pub fn record(&self, key: impl Into<String>, job_id: Uuid) {
        self.entries.insert(key.into(), job_id);
    }

    /// Drop every mapping pointing at one of the given jobs. Called when
    /// terminal jobs are evicted from the registry.
    pub fn release_jobs(&self, job_ids: &[Uuid]) {
        if job_ids.is_empty() {
            return;
        }
        self.entries.retain(|_, job_id| !job_ids.contains(job_id));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
