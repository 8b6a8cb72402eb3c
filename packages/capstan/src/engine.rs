//! Engine façade: submission, status, subscription, cancellation.
//!
//! ```text
//! submit ─► idempotency check ─► DurableQueue.enqueue ─► queued event
//!                                      │
//!                                 WorkerPool.claim ─► TaskHandler
//!                                      │                  │ progress
//!                                 JobRegistry ◄───────────┘
//!                                      │
//!                                 JobEventBus ─► subscribers
//!
//! status ─► JobRegistry (authoritative) ─► DurableQueue.lookup (coarse fallback)
//! ```
//!
//! The engine owns every shared structure (registry, index, bus) as instance
//! state; nothing is a module-level singleton.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{JobEventBus, Subscription};
use crate::config::EngineConfig;
use crate::events::JobEvent;
use crate::idempotency::IdempotencyIndex;
use crate::job::{Job, JobPriority};
use crate::queue::{DurableQueue, InMemoryQueue};
use crate::registry::JobRegistry;
use crate::state::{StatusSnapshot, STAGE_QUEUED};
use crate::supervisor::Supervisor;
use crate::task::{TaskContext, TaskHandler, TaskRegistry};
use crate::worker::WorkerPool;

/// A submission request, one per logical unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub job_type: String,
    pub payload: serde_json::Value,
    /// Caller-assigned job ID; broker-assigned when absent.
    pub job_id: Option<Uuid>,
    /// Caller-side tracing ID; defaults to the job ID.
    pub correlation_id: Option<String>,
    /// Dedupe token: while a job submitted with this key is still live, a
    /// repeat submission returns the same job instead of scheduling new work.
    pub idempotency_key: Option<String>,
    pub priority: JobPriority,
    /// Override of the engine-wide attempt budget.
    pub max_attempts: Option<i32>,
}

impl SubmitRequest {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            job_id: None,
            correlation_id: None,
            idempotency_key: None,
            priority: JobPriority::default(),
            max_attempts: None,
        }
    }

    /// Assign the job ID up front, e.g. so a subscriber can attach before
    /// submission.
    pub fn with_job_id(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
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
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// What a caller gets back from `submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: Uuid,
    /// Queue depth times an empirical per-job constant. An estimate, not a
    /// guarantee.
    pub estimated_wait_ms: u64,
    /// True when an idempotency key matched a still-live job and no new work
    /// was scheduled.
    pub deduplicated: bool,
}

/// Builder for an [`Engine`].
///
/// # Example
///
/// ```ignore
/// let engine = Engine::builder()
///     .with_config(EngineConfig::default())
///     .with_task_fn::<SimulationInput, _, _>("simulate_portfolio", run_simulation)
///     .build();
/// let handle = engine.start();
///
/// let receipt = handle
///     .submit(SubmitRequest::new("simulate_portfolio", payload))
///     .await?;
/// let mut events = handle.subscribe(receipt.job_id);
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    queue: Option<Arc<dyn DurableQueue>>,
    tasks: TaskRegistry,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            queue: None,
            tasks: TaskRegistry::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a shared broker (e.g. the Postgres queue) instead of the built-in
    /// in-memory queue.
    pub fn with_queue(mut self, queue: Arc<dyn DurableQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Register a task handler for a job type.
    pub fn with_task<H>(mut self, job_type: &'static str, handler: H) -> Self
    where
        H: TaskHandler + 'static,
    {
        self.tasks.register(job_type, handler);
        self
    }

    /// Register an async function with a typed payload for a job type.
    pub fn with_task_fn<P, F, Fut>(mut self, job_type: &'static str, handler: F) -> Self
    where
        P: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(P, TaskContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, crate::error::TaskError>>
            + Send
            + 'static,
    {
        self.tasks.register_fn::<P, F, Fut>(job_type, handler);
        self
    }

    pub fn build(self) -> Engine {
        let queue = self.queue.unwrap_or_else(|| {
            Arc::new(InMemoryQueue::new(
                self.config.retry.clone(),
                self.config.lease_duration,
            ))
        });
        let bus = JobEventBus::with_capacity(self.config.event_capacity);
        Engine {
            config: self.config,
            queue,
            tasks: Arc::new(self.tasks),
            registry: Arc::new(JobRegistry::new()),
            idempotency: Arc::new(IdempotencyIndex::new()),
            bus,
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled engine, ready to start.
pub struct Engine {
    config: EngineConfig,
    queue: Arc<dyn DurableQueue>,
    tasks: Arc<TaskRegistry>,
    registry: Arc<JobRegistry>,
    idempotency: Arc<IdempotencyIndex>,
    bus: JobEventBus,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Start the worker pool and supervisor in the background and return the
    /// handle the transport layer talks to.
    pub fn start(self) -> EngineHandle {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "starting engine"
        );

        let shutdown = CancellationToken::new();
        let pool = Arc::new(WorkerPool::new(
            self.queue.clone(),
            self.tasks.clone(),
            self.registry.clone(),
            self.bus.clone(),
            self.config.clone(),
            shutdown.clone(),
        ));
        let supervisor = Arc::new(Supervisor::new(
            self.queue.clone(),
            self.registry.clone(),
            self.bus.clone(),
            self.idempotency.clone(),
            self.config.clone(),
            shutdown.clone(),
        ));

        EngineHandle {
            worker_handle: tokio::spawn(pool.run()),
            supervisor_handle: tokio::spawn(supervisor.run()),
            config: self.config,
            queue: self.queue,
            registry: self.registry,
            idempotency: self.idempotency,
            bus: self.bus,
            shutdown,
        }
    }
}

/// Handle to a running engine.
pub struct EngineHandle {
    config: EngineConfig,
    queue: Arc<dyn DurableQueue>,
    registry: Arc<JobRegistry>,
    idempotency: Arc<IdempotencyIndex>,
    bus: JobEventBus,
    shutdown: CancellationToken,
    worker_handle: JoinHandle<()>,
    supervisor_handle: JoinHandle<()>,
}

impl EngineHandle {
    /// Submit a job for immediate execution.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt> {
        self.submit_inner(request, None).await
    }

    /// Submit a job to run at or after `run_at`.
    pub async fn schedule(
        &self,
        request: SubmitRequest,
        run_at: DateTime<Utc>,
    ) -> Result<SubmitReceipt> {
        self.submit_inner(request, Some(run_at)).await
    }

    async fn submit_inner(
        &self,
        request: SubmitRequest,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<SubmitReceipt> {
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.idempotency.resolve(key) {
                if self.status(existing).await.status.is_active() {
                    debug!(job_id = %existing, key = %key, "deduplicated submission");
                    return Ok(SubmitReceipt {
                        job_id: existing,
                        estimated_wait_ms: self.estimate_wait().await,
                        deduplicated: true,
                    });
                }
                // The referenced job is terminal; the mapping is inert and a
                // fresh submission takes over the key.
            }
        }

        let mut job = Job::new(request.job_type, request.payload)
            .with_priority(request.priority)
            .with_max_attempts(
                request
                    .max_attempts
                    .unwrap_or(self.config.retry.max_attempts),
            );
        if let Some(job_id) = request.job_id {
            job = job.with_job_id(job_id);
        }
        if let Some(correlation_id) = request.correlation_id {
            job = job.with_correlation_id(correlation_id);
        }
        if let Some(key) = &request.idempotency_key {
            job = job.with_idempotency_key(key.clone());
        }

        let job_id = job.id;
        match run_at {
            Some(at) => self.queue.schedule(job, at).await?,
            None => self.queue.enqueue(job).await?,
        }
        if let Some(key) = request.idempotency_key {
            self.idempotency.record(key, job_id);
        }

        // Subscribers attached before submission see the queued event.
        self.bus.publish(
            job_id,
            JobEvent::Status {
                stage: STAGE_QUEUED.to_string(),
                progress_percent: 0,
                message: None,
            },
        );

        info!(job_id = %job_id, scheduled = run_at.is_some(), "job submitted");
        Ok(SubmitReceipt {
            job_id,
            estimated_wait_ms: self.estimate_wait().await,
            deduplicated: false,
        })
    }

    /// Point-in-time status for a job.
    ///
    /// The registry overlay is authoritative when present; otherwise a coarse
    /// snapshot is synthesized from the durable queue (no stage detail).
    pub async fn status(&self, job_id: Uuid) -> StatusSnapshot {
        if let Some(snapshot) = self.registry.snapshot(job_id) {
            return snapshot;
        }
        match self.queue.lookup(job_id).await {
            Ok(Some(record)) => StatusSnapshot {
                job_id,
                status: record.coarse_status(),
                stage: None,
                progress_percent: None,
                message: record.error_message.clone(),
                result_ref: None,
                error: None,
                updated_at: Some(record.updated_at),
            },
            Ok(None) => StatusSnapshot::unknown(job_id),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "queue lookup failed");
                StatusSnapshot::unknown(job_id)
            }
        }
    }

    /// Subscribe to a job's live events. Drop the subscription to unsubscribe.
    pub fn subscribe(&self, job_id: Uuid) -> Subscription {
        self.bus.subscribe(job_id)
    }

    /// Request cancellation.
    ///
    /// Returns `true` when a cancellation was newly requested: either the job
    /// was still queued (terminal `cancelled` is recorded immediately) or it
    /// is running and its cooperative signal has been fired. Cancelling twice,
    /// or cancelling a terminal job, returns `false` and changes nothing.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        // Still owned by the queue (never leased, or waiting on a retry).
        if self.queue.cancel(job_id).await? {
            let newly_terminal = if self.registry.snapshot(job_id).is_some() {
                if let Some(token) = self.registry.cancellation_token(job_id) {
                    token.cancel();
                }
                self.registry.cancel(job_id)
            } else {
                self.registry.insert_cancelled_before_lease(job_id)
            };
            if newly_terminal {
                self.bus.publish(job_id, JobEvent::Cancelled);
            }
            info!(job_id = %job_id, "job cancelled before lease");
            return Ok(true);
        }

        // Leased: fire the cooperative signal; the handler decides when to
        // observe it.
        if let Some(token) = self.registry.cancellation_token(job_id) {
            if token.is_cancelled() {
                return Ok(false);
            }
            info!(job_id = %job_id, "cancellation requested");
            token.cancel();
            return Ok(true);
        }

        Ok(false)
    }

    /// Jobs waiting in the durable queue.
    pub async fn queue_depth(&self) -> Result<usize> {
        self.queue.depth().await
    }

    async fn estimate_wait(&self) -> u64 {
        let depth = self.queue.depth().await.unwrap_or(0) as u64;
        depth.saturating_mul(self.config.estimated_job_duration.as_millis() as u64)
    }

    /// Stop claiming new work, signal in-flight jobs, and wait for the pool
    /// and supervisor to wind down.
    pub async fn shutdown(self) {
        info!("engine shutting down");
        self.shutdown.cancel();
        let _ = self.worker_handle.await;
        let _ = self.supervisor_handle.await;
        info!("engine stopped");
    }

    /// Abort the background tasks without waiting. Test teardown only.
    pub fn abort(&self) {
        self.shutdown.cancel();
        self.worker_handle.abort();
        self.supervisor_handle.abort();
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("worker_id", &self.config.worker_id)
            .field("tracked_jobs", &self.registry.len())
            .finish_non_exhaustive()
    }
}
