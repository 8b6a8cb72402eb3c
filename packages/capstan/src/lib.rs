//! # Capstan
//!
//! A durable job orchestration layer where queues lease, workers execute,
//! and supervisors guarantee termination.
//!
//! Capstan runs long, cancellable, multi-stage computations (Monte Carlo
//! simulation, report rendering, strategy backtesting) behind a small façade:
//! idempotent submission, live progress streaming, and deterministic
//! termination even when a worker dies mid-job.
//!
//! ## Architecture
//!
//! ```text
//! submit ──► IdempotencyIndex ──► DurableQueue (lease / retry / backoff)
//!                                       │
//!                                  WorkerPool (bounded, rate limited)
//!                                       │
//!                              TaskHandler.run(payload, ctx)
//!                                  │ reportProgress     │ signal
//!                                  ▼                    ▼
//!                              JobRegistry ◄── Supervisor (timeout + stale sweep)
//!                                  │
//!                              JobEventBus ──► subscribers (one channel per job)
//! ```
//!
//! ## Key invariants
//!
//! 1. **Terminal states are absorbing** - every terminal write goes through
//!    one guarded compare-and-set; losers are no-ops.
//! 2. **Single writer per job** - enforced by the queue's lease, not by
//!    in-process locking alone.
//! 3. **Progress is monotonic within an attempt** - observers never see a dip.
//! 4. **Every job terminates** - the per-job timeout and the independent stale
//!    sweep are two redundant paths to a terminal status.
//! 5. **Cancellation is cooperative** - handlers are contractually required to
//!    poll their signal; the engine records `timed_out` around handlers that
//!    never do.
//!
//! ## Guarantees and limits
//!
//! - At-least-once execution across the queue boundary; submission is
//!   idempotent, side effects of the task body are not.
//! - Events are in-memory, per-process, at-most-once for slow subscribers.
//! - Fine-grained progress does not survive a process restart; the durable
//!   queue record does, and status queries fall back to it.
//!
//! ## Example
//!
//! ```ignore
//! use capstan::{Engine, EngineConfig, SubmitRequest, TaskError};
//!
//! #[derive(serde::Deserialize)]
//! struct SimulationInput { runs: u32 }
//!
//! let engine = Engine::builder()
//!     .with_config(EngineConfig::default())
//!     .with_task_fn::<SimulationInput, _, _>("simulate_portfolio", |input, ctx| async move {
//!         for chunk in 0..10 {
//!             ctx.checkpoint()?; // observe cancellation between chunks
//!             run_chunk(&input, chunk).await.map_err(TaskError::System)?;
//!             ctx.report_progress("computing", (chunk + 1) * 10, None);
//!         }
//!         Ok(serde_json::json!({ "result": "sim-1" }))
//!     })
//!     .build();
//!
//! let handle = engine.start();
//! let receipt = handle
//!     .submit(SubmitRequest::new("simulate_portfolio", serde_json::json!({ "runs": 10_000 }))
//!         .with_idempotency_key("fund-7:2026-08"))
//!     .await?;
//!
//! let mut events = handle.subscribe(receipt.job_id);
//! while let Some(envelope) = events.recv().await {
//!     println!("{:?}", envelope.event);
//! }
//! ```

mod bus;
mod config;
mod engine;
mod error;
mod events;
mod idempotency;
mod job;
mod queue;
mod registry;
mod state;
mod supervisor;
mod task;
mod worker;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Lifecycle scenario tests (test-only)
#[cfg(test)]
mod lifecycle_tests;


// Re-export the façade
pub use engine::{Engine, EngineBuilder, EngineHandle, SubmitReceipt, SubmitRequest};

// Re-export configuration
pub use config::{EngineConfig, RetryPolicy};

// Re-export the job model and run-time state
pub use job::{Job, JobPriority, JobStatus};
pub use state::{JobState, StatusSnapshot, STAGE_QUEUED, STAGE_RUNNING};

// Re-export the error taxonomy
pub use error::{ErrorKind, JobError, TaskError};

// Re-export the durable queue seam
pub use queue::{
    DurableQueue, InMemoryQueue, LeasedJob, QueuePhase, QueueRecord, RetryDisposition,
};

// Re-export events and the per-job bus
pub use bus::{JobEventBus, Subscription};
pub use events::{JobEvent, JobEventEnvelope};

// Re-export the overlay structures
pub use idempotency::IdempotencyIndex;
pub use registry::JobRegistry;

// Re-export the task contract
pub use task::{TaskContext, TaskHandler, TaskRegistry};

// Re-export the background services (usually driven via Engine::start)
pub use supervisor::Supervisor;
pub use worker::WorkerPool;

// Re-export commonly used external types
pub use async_trait::async_trait;
