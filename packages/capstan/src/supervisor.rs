//! Stale-sweep supervisor.
//!
//! The worker pool already arms a per-job timeout at lease time; the
//! supervisor is the second, independent path to termination. Every
//! `sweep_interval` it scans the registry for leased jobs whose state has not
//! moved within `stale_after` and force-terminates them — the safety net for
//! a worker that died without ever writing a terminal state. The terminal
//! write is the same guarded compare-and-set the owning worker uses, so
//! whichever fires first wins and the other is a no-op.
//!
//! The sweep also garbage-collects: terminal states older than the retention
//! window are evicted, their event channels dropped, and their idempotency
//! mappings released.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::JobEventBus;
use crate::config::EngineConfig;
use crate::error::ErrorKind;
use crate::events::JobEvent;
use crate::idempotency::IdempotencyIndex;
use crate::queue::DurableQueue;
use crate::registry::JobRegistry;

/// Periodic enforcement of the staleness threshold and retention window.
pub struct Supervisor {
    queue: Arc<dyn DurableQueue>,
    registry: Arc<JobRegistry>,
    bus: JobEventBus,
    idempotency: Arc<IdempotencyIndex>,
    config: EngineConfig,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        registry: Arc<JobRegistry>,
        bus: JobEventBus,
        idempotency: Arc<IdempotencyIndex>,
        config: EngineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            registry,
            bus,
            idempotency,
            config,
            shutdown,
        }
    }

    /// Run periodic sweeps until the shutdown token fires.
    pub async fn run(self: Arc<Self>) {
        info!(
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            stale_after_ms = self.config.stale_after.as_millis() as u64,
            "supervisor starting"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
            }
            self.sweep().await;
        }

        info!("supervisor stopped");
    }

    async fn sweep(&self) {
        for job_id in self.registry.stale_candidates(self.config.stale_after) {
            if self.registry.time_out(job_id) {
                warn!(
                    job_id = %job_id,
                    stale_after_ms = self.config.stale_after.as_millis() as u64,
                    "stale job force-terminated"
                );
                self.bus.publish(job_id, JobEvent::TimedOut);
                if let Err(e) = self
                    .queue
                    .mark_failed(
                        job_id,
                        "no state update within staleness threshold",
                        ErrorKind::NonRetryable,
                    )
                    .await
                {
                    warn!(job_id = %job_id, error = %e, "failed to settle stale job in queue");
                }
            }
        }

        let evicted = self.registry.evict_expired(self.config.retention);
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted terminal job state");
            for job_id in &evicted {
                self.bus.drop_channel(*job_id);
            }
            self.idempotency.release_jobs(&evicted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::job::{Job, JobStatus};
    use crate::queue::{InMemoryQueue, QueuePhase};
    use std::time::Duration;

    struct Harness {
        supervisor: Supervisor,
        queue: Arc<InMemoryQueue>,
        registry: Arc<JobRegistry>,
        bus: JobEventBus,
        idempotency: Arc<IdempotencyIndex>,
        shutdown: CancellationToken,
    }

    fn harness(stale_after: Duration, retention: Duration) -> Harness {
        let config = EngineConfig {
            stale_after,
            retention,
            sweep_interval: Duration::from_millis(10),
            ..EngineConfig::default()
        };
        let queue = Arc::new(InMemoryQueue::new(
            RetryPolicy::default(),
            Duration::from_secs(60),
        ));
        let registry = Arc::new(JobRegistry::new());
        let bus = JobEventBus::new();
        let idempotency = Arc::new(IdempotencyIndex::new());
        let shutdown = CancellationToken::new();
        let supervisor = Supervisor::new(
            queue.clone(),
            registry.clone(),
            bus.clone(),
            idempotency.clone(),
            config,
            shutdown.clone(),
        );
        Harness {
            supervisor,
            queue,
            registry,
            bus,
            idempotency,
            shutdown,
        }
    }

    async fn leased_job(h: &Harness) -> Job {
        let job = Job::new("simulate_portfolio", serde_json::Value::Null);
        h.queue.enqueue(job.clone()).await.unwrap();
        let leased = h.queue.claim("w1", 1).await.unwrap();
        h.registry
            .begin_attempt(&leased[0].job, leased[0].attempt, &h.shutdown)
            .unwrap();
        job
    }

    #[tokio::test]
    async fn sweep_times_out_silent_running_job() {
        let h = harness(Duration::from_millis(0), Duration::from_secs(3600));
        let job = leased_job(&h).await;
        let mut sub = h.bus.subscribe(job.id);

        tokio::time::sleep(Duration::from_millis(5)).await;
        h.supervisor.sweep().await;

        let snapshot = h.registry.snapshot(job.id).unwrap();
        assert_eq!(snapshot.status, JobStatus::TimedOut);
        assert_eq!(
            h.queue.lookup(job.id).await.unwrap().unwrap().phase,
            QueuePhase::Failed
        );
        assert_eq!(sub.recv().await.unwrap().event, JobEvent::TimedOut);
    }

    #[tokio::test]
    async fn sweep_spares_fresh_jobs() {
        let h = harness(Duration::from_secs(60), Duration::from_secs(3600));
        let job = leased_job(&h).await;

        h.supervisor.sweep().await;

        let snapshot = h.registry.snapshot(job.id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn sweep_spares_queued_retry_state() {
        let h = harness(Duration::from_millis(0), Duration::from_secs(3600));
        let job = leased_job(&h).await;
        h.registry.requeue(job.id, "retry scheduled".into());

        tokio::time::sleep(Duration::from_millis(5)).await;
        h.supervisor.sweep().await;

        // Queued state belongs to the queue's redelivery, not the sweep.
        let snapshot = h.registry.snapshot(job.id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn sweep_evicts_terminal_state_and_releases_references() {
        let h = harness(Duration::from_secs(60), Duration::from_millis(0));
        let job = leased_job(&h).await;
        h.idempotency.record("k1", job.id);
        h.registry.complete(job.id, serde_json::Value::Null);
        let _sub = h.bus.subscribe(job.id);

        tokio::time::sleep(Duration::from_millis(5)).await;
        h.supervisor.sweep().await;

        assert!(h.registry.snapshot(job.id).is_none());
        assert_eq!(h.idempotency.resolve("k1"), None);
        assert_eq!(h.bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn sweep_loses_race_to_owning_worker_gracefully() {
        let h = harness(Duration::from_millis(0), Duration::from_secs(3600));
        let job = leased_job(&h).await;

        // Worker finishes between candidate selection and the sweep's write.
        h.registry.complete(job.id, serde_json::json!("done"));
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.supervisor.sweep().await;

        let snapshot = h.registry.snapshot(job.id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
    }
}
