//! Canned task handlers and event-stream helpers for tests.
//!
//! Available to downstream crates via the `testing` feature.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::bus::Subscription;
use crate::error::TaskError;
use crate::events::JobEventEnvelope;
use crate::task::{TaskContext, TaskHandler};

/// Reports the given `(stage, percent)` sequence, then succeeds with `result`.
pub struct StagedTask {
    pub stages: Vec<(&'static str, u8)>,
    pub result: serde_json::Value,
}

#[async_trait]
impl TaskHandler for StagedTask {
    async fn run(
        &self,
        _payload: serde_json::Value,
        ctx: TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        for (stage, percent) in &self.stages {
            ctx.checkpoint()?;
            ctx.report_progress(stage, *percent, None);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(self.result.clone())
    }
}

/// Fails with a retryable `System` error a fixed number of times, then
/// succeeds. Counts every run.
pub struct FlakyTask {
    failures_left: AtomicI32,
    pub runs: AtomicUsize,
}

impl FlakyTask {
    pub fn new(failures: i32) -> Self {
        Self {
            failures_left: AtomicI32::new(failures),
            runs: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TaskHandler for FlakyTask {
    async fn run(
        &self,
        _payload: serde_json::Value,
        _ctx: TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
            Err(TaskError::system("simulated transient failure"))
        } else {
            Ok(serde_json::json!("recovered"))
        }
    }
}

/// Reports one stage, then polls its cancellation signal forever. Only a
/// cancel (or timeout) ends it.
pub struct CancelAwareTask {
    pub stage: &'static str,
    pub percent: u8,
}

#[async_trait]
impl TaskHandler for CancelAwareTask {
    async fn run(
        &self,
        _payload: serde_json::Value,
        ctx: TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        ctx.report_progress(self.stage, self.percent, None);
        loop {
            ctx.checkpoint()?;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Never returns and never checks its cancellation signal; `ticks` keeps
/// counting even after the engine records `timed_out`.
pub struct StubbornTask {
    pub ticks: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for StubbornTask {
    async fn run(
        &self,
        _payload: serde_json::Value,
        _ctx: TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        loop {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Drain a subscription until (and including) the first terminal event, the
/// stream closes, or the timeout elapses.
pub async fn collect_until_terminal(
    sub: &mut Subscription,
    timeout: Duration,
) -> Vec<JobEventEnvelope> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, sub.recv()).await {
            Ok(Some(envelope)) => {
                let terminal = envelope.event.is_terminal();
                events.push(envelope);
                if terminal {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
    events
}
