//! Per-job event bus for live status streaming.
//!
//! # Guarantees
//!
//! - **Per-job ordering**: events for one job reach each subscriber in exactly
//!   the order they were produced by the owning worker or supervisor.
//! - **At-most-once delivery**: slow receivers may lag and skip events.
//! - **In-memory only**: events are not persisted and only reach subscribers
//!   in the same process as the owning worker.
//! - **Bounded memory**: a channel exists only while someone is subscribed or
//!   the job is retained in the registry; nothing grows with historical job
//!   count.
//!
//! Unsubscription is dropping the [`Subscription`].

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::events::{JobEvent, JobEventEnvelope};

/// Default capacity of each per-job channel.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug)]
struct BusInner {
    channels: DashMap<Uuid, broadcast::Sender<JobEventEnvelope>>,
    capacity: usize,
}

/// Event bus with one broadcast channel per job ID.
#[derive(Debug, Clone)]
pub struct JobEventBus {
    inner: Arc<BusInner>,
}

impl JobEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// The capacity bounds how far a subscriber may fall behind before it
    /// starts skipping events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                channels: DashMap::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Subscribe to a job's events. Events published before subscription are
    /// not replayed.
    pub fn subscribe(&self, job_id: Uuid) -> Subscription {
        let sender = self
            .inner
            .channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .clone();
        Subscription {
            job_id,
            receiver: sender.subscribe(),
            bus: self.clone(),
        }
    }

    /// Publish an event for a job. Returns the number of subscribers that
    /// received it; with no subscribers the event is dropped.
    pub fn publish(&self, job_id: Uuid, event: JobEvent) -> usize {
        let Some(sender) = self.inner.channels.get(&job_id).map(|e| e.value().clone()) else {
            return 0;
        };
        match sender.send(JobEventEnvelope { job_id, event }) {
            Ok(receivers) => receivers,
            Err(_) => {
                // Last subscriber is gone; release the channel.
                self.inner
                    .channels
                    .remove_if(&job_id, |_, s| s.receiver_count() == 0);
                0
            }
        }
    }

    /// Drop the channel for an evicted job. Any remaining subscribers observe
    /// end-of-stream after draining buffered events.
    pub fn drop_channel(&self, job_id: Uuid) {
        self.inner.channels.remove(&job_id);
    }

    /// Number of live subscribers for a job.
    pub fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.inner
            .channels
            .get(&job_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of jobs with a live channel.
    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    fn reap(&self, job_id: Uuid) {
        // Called from Subscription::drop while its receiver is still alive:
        // a count of one means we were the last subscriber.
        self.inner
            .channels
            .remove_if(&job_id, |_, sender| sender.receiver_count() <= 1);
    }
}

impl Default for JobEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription to one job's events.
#[derive(Debug)]
pub struct Subscription {
    job_id: Uuid,
    receiver: broadcast::Receiver<JobEventEnvelope>,
    bus: JobEventBus,
}

impl Subscription {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Receive the next event, or `None` once the channel is closed (job
    /// evicted). Lagged gaps are skipped with a warning.
    pub async fn recv(&mut self) -> Option<JobEventEnvelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(job_id = %self.job_id, skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.reap(self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(stage: &str, percent: u8) -> JobEvent {
        JobEvent::Status {
            stage: stage.to_string(),
            progress_percent: percent,
            message: None,
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscriber_in_order() {
        let bus = JobEventBus::new();
        let job_id = Uuid::new_v4();
        let mut sub = bus.subscribe(job_id);

        bus.publish(job_id, status("queued", 0));
        bus.publish(job_id, status("computing", 50));
        bus.publish(
            job_id,
            JobEvent::Completed {
                result_ref: serde_json::json!("r"),
            },
        );

        assert_eq!(sub.recv().await.unwrap().event, status("queued", 0));
        assert_eq!(sub.recv().await.unwrap().event, status("computing", 50));
        assert!(sub.recv().await.unwrap().event.is_terminal());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = JobEventBus::new();
        let job_id = Uuid::new_v4();
        assert_eq!(bus.publish(job_id, status("queued", 0)), 0);
        assert_eq!(bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn events_are_isolated_per_job() {
        let bus = JobEventBus::new();
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();
        let mut sub_a = bus.subscribe(job_a);
        let _sub_b = bus.subscribe(job_b);

        bus.publish(job_b, status("computing", 10));
        bus.publish(job_a, status("persisting", 90));

        let envelope = sub_a.recv().await.unwrap();
        assert_eq!(envelope.job_id, job_a);
        assert_eq!(envelope.event, status("persisting", 90));
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = JobEventBus::new();
        let job_id = Uuid::new_v4();
        let mut sub1 = bus.subscribe(job_id);
        let mut sub2 = bus.subscribe(job_id);

        assert_eq!(bus.publish(job_id, status("computing", 25)), 2);
        assert_eq!(sub1.recv().await.unwrap().event, status("computing", 25));
        assert_eq!(sub2.recv().await.unwrap().event, status("computing", 25));
    }

    #[tokio::test]
    async fn dropping_last_subscription_releases_channel() {
        let bus = JobEventBus::new();
        let job_id = Uuid::new_v4();
        let sub = bus.subscribe(job_id);
        assert_eq!(bus.channel_count(), 1);

        drop(sub);
        assert_eq!(bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn drop_channel_closes_stream_after_drain() {
        let bus = JobEventBus::new();
        let job_id = Uuid::new_v4();
        let mut sub = bus.subscribe(job_id);

        bus.publish(job_id, status("computing", 10));
        bus.drop_channel(job_id);

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus = JobEventBus::new();
        let job_id = Uuid::new_v4();
        let _early = bus.subscribe(job_id);

        bus.publish(job_id, status("queued", 0));
        let mut late = bus.subscribe(job_id);
        bus.publish(job_id, status("computing", 50));

        assert_eq!(late.recv().await.unwrap().event, status("computing", 50));
    }
}
