//! End-to-end lifecycle scenarios against the assembled engine:
//! idempotent submission, exact event streams, cooperative cancellation,
//! deadline enforcement, and stale-job recovery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::{EngineConfig, RetryPolicy};
use crate::engine::{Engine, EngineHandle, SubmitRequest};
use crate::events::JobEvent;
use crate::job::JobStatus;
use crate::state::StatusSnapshot;
use crate::testing::{
    collect_until_terminal, CancelAwareTask, FlakyTask, StagedTask, StubbornTask,
};

fn fast_config() -> EngineConfig {
    EngineConfig {
        concurrency: 2,
        poll_interval: Duration::from_millis(10),
        sweep_interval: Duration::from_millis(25),
        stale_after: Duration::from_secs(30),
        job_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(0),
            max_delay: Duration::from_millis(10),
        },
        ..EngineConfig::with_worker_id("lifecycle-test")
    }
}

async fn wait_for_terminal(handle: &EngineHandle, job_id: Uuid) -> StatusSnapshot {
    wait_until(handle, job_id, |s| s.status.is_terminal()).await
}

async fn wait_until(
    handle: &EngineHandle,
    job_id: Uuid,
    pred: impl Fn(&StatusSnapshot) -> bool,
) -> StatusSnapshot {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = handle.status(job_id).await;
        if pred(&snapshot) {
            return snapshot;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "job {job_id} stuck at {:?}",
            snapshot.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_submission_shares_the_live_job_then_releases_the_key() {
    let handle = Engine::builder()
        .with_config(fast_config())
        .with_task(
            "hold",
            CancelAwareTask {
                stage: "computing",
                percent: 10,
            },
        )
        .build()
        .start();

    let first = handle
        .submit(SubmitRequest::new("hold", serde_json::Value::Null).with_idempotency_key("k1"))
        .await
        .unwrap();
    assert!(!first.deduplicated);

    // Same key while the job is live: same job, nothing new scheduled.
    let second = handle
        .submit(SubmitRequest::new("hold", serde_json::Value::Null).with_idempotency_key("k1"))
        .await
        .unwrap();
    assert_eq!(second.job_id, first.job_id);
    assert!(second.deduplicated);

    assert!(handle.cancel(first.job_id).await.unwrap());
    wait_for_terminal(&handle, first.job_id).await;

    // Terminal job releases the key: a third submission starts fresh work.
    let third = handle
        .submit(SubmitRequest::new("hold", serde_json::Value::Null).with_idempotency_key("k1"))
        .await
        .unwrap();
    assert_ne!(third.job_id, first.job_id);
    assert!(!third.deduplicated);

    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscriber_attached_before_submission_sees_the_exact_stream() {
    let handle = Engine::builder()
        .with_config(fast_config())
        .with_task(
            "render_report",
            StagedTask {
                stages: vec![("computing", 50), ("persisting", 90)],
                result: serde_json::json!("report-42"),
            },
        )
        .build()
        .start();

    let job_id = Uuid::new_v4();
    let mut sub = handle.subscribe(job_id);
    handle
        .submit(SubmitRequest::new("render_report", serde_json::Value::Null).with_job_id(job_id))
        .await
        .unwrap();

    let events = collect_until_terminal(&mut sub, Duration::from_secs(5)).await;
    let kinds: Vec<&JobEvent> = events.iter().map(|e| &e.event).collect();
    assert_eq!(
        kinds,
        vec![
            &JobEvent::Status {
                stage: "queued".into(),
                progress_percent: 0,
                message: None
            },
            &JobEvent::Status {
                stage: "computing".into(),
                progress_percent: 50,
                message: None
            },
            &JobEvent::Status {
                stage: "persisting".into(),
                progress_percent: 90,
                message: None
            },
            &JobEvent::Completed {
                result_ref: serde_json::json!("report-42")
            },
        ]
    );

    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_job_exits_via_the_cancellation_path() {
    let handle = Engine::builder()
        .with_config(fast_config())
        .with_task(
            "hold",
            CancelAwareTask {
                stage: "computing",
                percent: 30,
            },
        )
        .build()
        .start();

    let receipt = handle
        .submit(SubmitRequest::new("hold", serde_json::Value::Null))
        .await
        .unwrap();

    // Wait until the handler is demonstrably inside `computing`.
    wait_until(&handle, receipt.job_id, |s| {
        s.progress_percent == Some(30)
    })
    .await;

    assert!(handle.cancel(receipt.job_id).await.unwrap());
    let snapshot = wait_for_terminal(&handle, receipt.job_id).await;
    assert_eq!(snapshot.status, JobStatus::Cancelled);
    assert!(snapshot.result_ref.is_none());

    // Cancelling again is a no-op and the outcome is unchanged.
    assert!(!handle.cancel(receipt.job_id).await.unwrap());
    assert_eq!(
        handle.status(receipt.job_id).await.status,
        JobStatus::Cancelled
    );

    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uncooperative_task_is_recorded_timed_out_while_still_running() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let handle = Engine::builder()
        .with_config(EngineConfig {
            job_timeout: Duration::from_millis(100),
            ..fast_config()
        })
        .with_task(
            "spin",
            StubbornTask {
                ticks: ticks.clone(),
            },
        )
        .build()
        .start();

    let receipt = handle
        .submit(SubmitRequest::new("spin", serde_json::Value::Null))
        .await
        .unwrap();

    let snapshot = wait_for_terminal(&handle, receipt.job_id).await;
    assert_eq!(snapshot.status, JobStatus::TimedOut);

    // The handler ignores its signal, so its side effects continue after
    // timed_out was recorded. Only the recorded state changed.
    let before = ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ticks.load(Ordering::SeqCst) > before);

    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_job_is_recovered_by_the_stale_sweep() {
    let ticks = Arc::new(AtomicUsize::new(0));
    // Per-job timer is effectively off; the sweep is the only terminator.
    let handle = Engine::builder()
        .with_config(EngineConfig {
            job_timeout: Duration::from_secs(60),
            stale_after: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(20),
            ..fast_config()
        })
        .with_task("spin", StubbornTask { ticks })
        .build()
        .start();

    let receipt = handle
        .submit(SubmitRequest::new("spin", serde_json::Value::Null))
        .await
        .unwrap();

    let snapshot = wait_for_terminal(&handle, receipt.job_id).await;
    assert_eq!(snapshot.status, JobStatus::TimedOut);
    assert_eq!(snapshot.error.unwrap().code, "timed_out");

    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_failures_retry_and_then_succeed() {
    let flaky = Arc::new(FlakyTask::new(2));
    let handle = Engine::builder()
        .with_config(fast_config())
        .with_task("flaky", flaky.clone())
        .build()
        .start();

    let receipt = handle
        .submit(SubmitRequest::new("flaky", serde_json::Value::Null))
        .await
        .unwrap();

    let snapshot = wait_for_terminal(&handle, receipt.job_id).await;
    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.result_ref, Some(serde_json::json!("recovered")));
    // Two failures, one success.
    assert_eq!(flaky.runs.load(Ordering::SeqCst), 3);

    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observed_progress_never_decreases() {
    // The handler reports 60 then 30 then 80; observers must never see a dip.
    let handle = Engine::builder()
        .with_config(fast_config())
        .with_task(
            "wobble",
            StagedTask {
                stages: vec![("a", 60), ("b", 30), ("c", 80)],
                result: serde_json::Value::Null,
            },
        )
        .build()
        .start();

    let job_id = Uuid::new_v4();
    let mut sub = handle.subscribe(job_id);
    handle
        .submit(SubmitRequest::new("wobble", serde_json::Value::Null).with_job_id(job_id))
        .await
        .unwrap();

    let events = collect_until_terminal(&mut sub, Duration::from_secs(5)).await;
    let percents: Vec<u8> = events
        .iter()
        .filter_map(|e| match &e.event {
            JobEvent::Status {
                progress_percent, ..
            } => Some(*progress_percent),
            _ => None,
        })
        .collect();

    assert_eq!(percents, vec![0, 60, 60, 80]);
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert!(events.last().unwrap().event.is_terminal());

    handle.abort();
}
