//! The pluggable task contract.
//!
//! A [`TaskHandler`] is the opaque computation the engine runs: Monte Carlo
//! simulation, report rendering, whatever the domain needs. The engine hands
//! it a [`TaskContext`] for progress reporting and cooperative cancellation.
//!
//! # Contract obligations on handler authors
//!
//! - Poll the cancellation signal at safe checkpoints
//!   ([`TaskContext::checkpoint`] makes this a one-liner) and exit via
//!   `TaskError::Cancelled` when it fires. The engine cannot preempt a handler
//!   that never polls; it can only record `timed_out` around it.
//! - Raise a classifiable [`TaskError`]; only `System` failures are retried.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::JobEventBus;
use crate::error::TaskError;
use crate::events::JobEvent;
use crate::registry::JobRegistry;

/// Execution context handed to a task handler for one attempt.
#[derive(Clone)]
pub struct TaskContext {
    job_id: Uuid,
    attempt: i32,
    registry: Arc<JobRegistry>,
    bus: JobEventBus,
    cancellation: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(
        job_id: Uuid,
        attempt: i32,
        registry: Arc<JobRegistry>,
        bus: JobEventBus,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            attempt,
            registry,
            bus,
            cancellation,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// 1-based execution attempt this context belongs to.
    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    /// Report a substage and progress percent (monotonic within the attempt).
    ///
    /// Reports arriving after a terminal transition are silently dropped: the
    /// supervisor may have closed the job out while the handler kept running.
    pub fn report_progress(&self, stage: &str, percent: u8, message: Option<String>) {
        let applied = self
            .registry
            .record_progress(self.job_id, stage, percent, message.clone());
        if let Some(effective) = applied {
            self.bus.publish(
                self.job_id,
                JobEvent::Status {
                    stage: stage.to_string(),
                    progress_percent: effective,
                    message,
                },
            );
        }
    }

    /// Whether cancellation has been requested for this attempt.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// The raw cancellation token, for `tokio::select!` against long awaits.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Bail out with `TaskError::Cancelled` if cancellation was requested.
    /// Intended for `ctx.checkpoint()?;` between units of work.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.cancellation.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("job_id", &self.job_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

/// A pluggable task implementation for one job type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task. The returned value is the opaque `result_ref` exposed in
    /// snapshots and the `Completed` event.
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: TaskContext,
    ) -> Result<serde_json::Value, TaskError>;
}

#[async_trait]
impl<T: TaskHandler + ?Sized> TaskHandler for Arc<T> {
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        (**self).run(payload, ctx).await
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, TaskError>> + Send>>;

struct FnTask<F> {
    f: F,
}

#[async_trait]
impl<F> TaskHandler for FnTask<F>
where
    F: Fn(serde_json::Value, TaskContext) -> TaskFuture + Send + Sync,
{
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        (self.f)(payload, ctx).await
    }
}

/// Registry mapping job types to their task handlers.
///
/// Each job type is registered once at startup; the worker pool looks handlers
/// up when it leases a job.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for this job type.
    pub fn register<H>(&mut self, job_type: &'static str, handler: H)
    where
        H: TaskHandler + 'static,
    {
        if self.handlers.contains_key(job_type) {
            panic!("task handler already registered for job type: {job_type}");
        }
        self.handlers.insert(job_type, Arc::new(handler));
    }

    /// Register an async function with a typed payload.
    ///
    /// The payload is deserialized before the handler runs; a mismatch is a
    /// `Validation` failure and is never retried.
    pub fn register_fn<P, F, Fut>(&mut self, job_type: &'static str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, TaskContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
    {
        let wrapped = move |payload: serde_json::Value, ctx: TaskContext| -> TaskFuture {
            let handler = handler.clone();
            Box::pin(async move {
                let input: P = serde_json::from_value(payload).map_err(|e| {
                    TaskError::Validation(format!("failed to deserialize {job_type} payload: {e}"))
                })?;
                handler(input, ctx).await
            })
        };
        self.register(job_type, FnTask { f: wrapped });
    }

    /// Look up the handler for a job type.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn has(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// All registered job types.
    pub fn registered_types(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("registered_types", &self.registered_types())
            .finish()
    }
}
