//! Job lifecycle events delivered through the per-job event bus.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// An event produced by the owning worker or the supervisor for one job.
///
/// These are facts about the job lifecycle, not commands. For a single job
/// they are delivered to every subscriber in exactly the order they were
/// produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEvent {
    /// Any non-terminal update, including progress reports.
    Status {
        stage: String,
        progress_percent: u8,
        message: Option<String>,
    },

    /// The job reached the terminal `completed` status.
    Completed { result_ref: serde_json::Value },

    /// The job reached the terminal `failed` status.
    Failed { error: JobError },

    /// The engine forced the terminal `timed_out` status (per-job timeout or
    /// stale sweep).
    TimedOut,

    /// The job reached the terminal `cancelled` status.
    Cancelled,
}

impl JobEvent {
    /// Whether this event marks a terminal transition.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Status { .. })
    }
}

/// A [`JobEvent`] tagged with the job it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEventEnvelope {
    pub job_id: Uuid,
    pub event: JobEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_not_terminal() {
        let event = JobEvent::Status {
            stage: "computing".to_string(),
            progress_percent: 40,
            message: None,
        };
        assert!(!event.is_terminal());
    }

    #[test]
    fn terminal_events_are_terminal() {
        assert!(JobEvent::Completed {
            result_ref: serde_json::json!({"report": "r-1"})
        }
        .is_terminal());
        assert!(JobEvent::Failed {
            error: JobError::timed_out()
        }
        .is_terminal());
        assert!(JobEvent::TimedOut.is_terminal());
        assert!(JobEvent::Cancelled.is_terminal());
    }

    #[test]
    fn envelope_roundtrips_through_json() {
        let envelope = JobEventEnvelope {
            job_id: Uuid::new_v4(),
            event: JobEvent::Status {
                stage: "persisting".to_string(),
                progress_percent: 90,
                message: Some("writing results".to_string()),
            },
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: JobEventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }
}
