//! Worker pool: bounded concurrent executors over the durable queue.
//!
//! ```text
//! WorkerPool (concurrency executors)
//!     │
//!     ├─► claim one job (lease via DurableQueue)
//!     ├─► rate limiter gate (governor, job starts per window)
//!     ├─► registry.begin_attempt (running, 0%) + heartbeat task
//!     ├─► spawn TaskHandler with TaskContext (progress + cancellation)
//!     ├─► select against the per-job timeout
//!     └─► classify the outcome → registry transition + bus event + ack/nack
//! ```
//!
//! Each executor processes one job at a time, so at most `concurrency` jobs
//! occupy the running stage per pool instance. The per-job timeout only
//! changes the *recorded* state: a handler that ignores its cancellation
//! signal may keep running in the background after `timed_out` is written.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::JobEventBus;
use crate::config::EngineConfig;
use crate::error::{ErrorKind, JobError, TaskError};
use crate::events::JobEvent;
use crate::queue::{DurableQueue, LeasedJob, RetryDisposition};
use crate::registry::JobRegistry;
use crate::state::STAGE_QUEUED;
use crate::task::{TaskContext, TaskRegistry};

type DefaultRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// A bounded pool of executors that lease jobs and run task handlers.
pub struct WorkerPool {
    queue: Arc<dyn DurableQueue>,
    tasks: Arc<TaskRegistry>,
    registry: Arc<JobRegistry>,
    bus: JobEventBus,
    config: EngineConfig,
    limiter: Option<Arc<DefaultRateLimiter>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        tasks: Arc<TaskRegistry>,
        registry: Arc<JobRegistry>,
        bus: JobEventBus,
        config: EngineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let limiter = config
            .starts_per_second
            .and_then(NonZeroU32::new)
            .map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate))));
        Self {
            queue,
            tasks,
            registry,
            bus,
            config,
            limiter,
            shutdown,
        }
    }

    /// Run the pool until the shutdown token fires.
    pub async fn run(self: Arc<Self>) {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "worker pool starting"
        );

        let mut handles = Vec::with_capacity(self.config.concurrency);
        for slot in 0..self.config.concurrency.max(1) {
            let pool = self.clone();
            let executor_id = format!("{}-{}", self.config.worker_id, slot);
            handles.push(tokio::spawn(
                async move { pool.executor_loop(executor_id).await },
            ));
        }
        futures::future::join_all(handles).await;

        info!(worker_id = %self.config.worker_id, "worker pool stopped");
    }

    async fn executor_loop(&self, executor_id: String) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let claimed = match self.queue.claim(&executor_id, 1).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(executor = %executor_id, error = %e, "failed to claim jobs");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            let Some(leased) = claimed.into_iter().next() else {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            };

            // Job starts per rolling window; protects whatever the handlers
            // call downstream. The lease stays alive while we wait.
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }

            self.process_job(leased, &executor_id).await;
        }
    }

    async fn process_job(&self, leased: LeasedJob, executor_id: &str) {
        let job = leased.job;
        let job_id = job.id;
        let attempt = leased.attempt;
        let job_type = job.job_type.clone();

        let Some(token) = self.registry.begin_attempt(&job, attempt, &self.shutdown) else {
            // Redelivered work the engine already closed out (e.g. the sweep
            // timed it out). Acknowledge so the queue stops redelivering.
            debug!(job_id = %job_id, "redelivered job is already terminal, acknowledging");
            let _ = self
                .queue
                .mark_failed(job_id, "job already terminal", ErrorKind::NonRetryable)
                .await;
            return;
        };

        // A cancel that arrived pre-lease or between attempts short-circuits
        // the run entirely.
        if token.is_cancelled() && !self.shutdown.is_cancelled() {
            info!(job_id = %job_id, job_type = %job_type, "job cancelled before start");
            if self.registry.cancel(job_id) {
                self.bus.publish(job_id, JobEvent::Cancelled);
            }
            let _ = self
                .queue
                .mark_failed(job_id, "cancelled before start", ErrorKind::Cancelled)
                .await;
            return;
        }

        let Some(handler) = self.tasks.get(&job_type) else {
            error!(job_id = %job_id, job_type = %job_type, "no task handler registered");
            let error = JobError {
                code: "validation".to_string(),
                message: format!("unknown job type: {job_type}"),
                retryable: false,
            };
            let _ = self
                .queue
                .mark_failed(job_id, &error.message, ErrorKind::NonRetryable)
                .await;
            if self.registry.fail(job_id, error.clone()) {
                self.bus.publish(job_id, JobEvent::Failed { error });
            }
            return;
        };

        debug!(
            job_id = %job_id,
            job_type = %job_type,
            attempt,
            executor = %executor_id,
            "executing job"
        );

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(job_id, heartbeat_stop.clone());

        let ctx = TaskContext::new(
            job_id,
            attempt,
            self.registry.clone(),
            self.bus.clone(),
            token.clone(),
        );
        let payload = job.payload.clone();
        let mut task = tokio::spawn(async move { handler.run(payload, ctx).await });

        let started = std::time::Instant::now();
        let outcome = tokio::select! {
            result = &mut task => Some(result),
            _ = tokio::time::sleep(self.config.job_timeout) => None,
        };

        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        match outcome {
            None => {
                // Deadline elapsed. Fire the signal and record timed_out; the
                // handler may keep running in the background.
                token.cancel();
                warn!(
                    job_id = %job_id,
                    job_type = %job_type,
                    timeout_ms = self.config.job_timeout.as_millis() as u64,
                    "job exceeded its deadline"
                );
                if self.registry.time_out(job_id) {
                    self.bus.publish(job_id, JobEvent::TimedOut);
                }
                if let Err(e) = self
                    .queue
                    .mark_failed(job_id, "job timeout exceeded", ErrorKind::NonRetryable)
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failed to record timeout in queue");
                }
            }
            Some(Ok(Ok(result_ref))) => {
                debug!(
                    job_id = %job_id,
                    job_type = %job_type,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "job succeeded"
                );
                if self.registry.complete(job_id, result_ref.clone()) {
                    self.bus.publish(job_id, JobEvent::Completed { result_ref });
                    if let Err(e) = self.queue.mark_succeeded(job_id).await {
                        error!(job_id = %job_id, error = %e, "failed to mark job as succeeded");
                    }
                }
                // Lost the terminal race (supervisor timed it out); the winner
                // already settled the queue record.
            }
            Some(Ok(Err(task_err))) => {
                self.settle_failure(job_id, &job_type, attempt, task_err).await;
            }
            Some(Err(join_err)) => {
                let task_err = TaskError::System(anyhow::anyhow!("task panicked: {join_err}"));
                self.settle_failure(job_id, &job_type, attempt, task_err).await;
            }
        }
    }

    fn spawn_heartbeat(
        &self,
        job_id: Uuid,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = queue.extend_lease(job_id).await {
                            warn!(job_id = %job_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        })
    }

    /// Classify a task error at the worker boundary and settle registry,
    /// bus, and queue accordingly.
    async fn settle_failure(&self, job_id: Uuid, job_type: &str, attempt: i32, err: TaskError) {
        match err {
            TaskError::Cancelled if self.shutdown.is_cancelled() => {
                // Interrupted by graceful shutdown, not a user cancel; let the
                // queue redeliver it to a future worker.
                match self
                    .queue
                    .mark_failed(job_id, "interrupted by shutdown", ErrorKind::Shutdown)
                    .await
                {
                    Ok(RetryDisposition::Requeued { .. }) => {
                        info!(job_id = %job_id, "job requeued for post-shutdown retry");
                        let message = "interrupted by shutdown, will retry".to_string();
                        if self.registry.requeue(job_id, message.clone()) {
                            self.bus.publish(
                                job_id,
                                JobEvent::Status {
                                    stage: STAGE_QUEUED.to_string(),
                                    progress_percent: 0,
                                    message: Some(message),
                                },
                            );
                        }
                    }
                    Ok(RetryDisposition::Exhausted) => {
                        let error = JobError {
                            code: "system".to_string(),
                            message: "interrupted by shutdown".to_string(),
                            retryable: false,
                        };
                        if self.registry.fail(job_id, error.clone()) {
                            self.bus.publish(job_id, JobEvent::Failed { error });
                        }
                    }
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "failed to report shutdown interruption");
                    }
                }
            }
            TaskError::Cancelled => {
                info!(job_id = %job_id, job_type = %job_type, "job cancelled");
                if self.registry.cancel(job_id) {
                    self.bus.publish(job_id, JobEvent::Cancelled);
                }
                if let Err(e) = self
                    .queue
                    .mark_failed(job_id, "cancelled", ErrorKind::Cancelled)
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failed to mark job as cancelled");
                }
            }
            err => {
                let kind = err.kind();
                warn!(
                    job_id = %job_id,
                    job_type = %job_type,
                    attempt,
                    error = %err,
                    "job failed"
                );
                match self.queue.mark_failed(job_id, &err.to_string(), kind).await {
                    Ok(RetryDisposition::Requeued {
                        next_attempt,
                        retry_at,
                    }) => {
                        debug!(
                            job_id = %job_id,
                            next_attempt,
                            retry_at = %retry_at,
                            "retry scheduled"
                        );
                        let message = format!("attempt {attempt} failed: {err}, retry scheduled");
                        if self.registry.requeue(job_id, message.clone()) {
                            self.bus.publish(
                                job_id,
                                JobEvent::Status {
                                    stage: STAGE_QUEUED.to_string(),
                                    progress_percent: 0,
                                    message: Some(message),
                                },
                            );
                        }
                    }
                    Ok(RetryDisposition::Exhausted) => {
                        let error = JobError::from(&err);
                        if self.registry.fail(job_id, error.clone()) {
                            self.bus.publish(job_id, JobEvent::Failed { error });
                        }
                    }
                    Err(e) => {
                        // Leave the state non-terminal; the stale sweep is the
                        // backstop if the queue stays unreachable.
                        error!(job_id = %job_id, error = %e, "failed to mark job as failed");
                    }
                }
            }
        }
    }
}
