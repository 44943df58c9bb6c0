//! Event types for observing queue activity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobType;

/// Events emitted by a queue and its workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A producer registered a new job with the driver.
    JobEnqueued {
        job_id: String,
        job_type: JobType,
        timestamp: DateTime<Utc>,
    },
    /// A locked, rehydrated job was handed to a worker.
    JobDispatched {
        job_id: String,
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A job finished running and its state was saved.
    JobCompleted {
        job_id: String,
        worker_id: String,
        errored: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// Saving a finished job failed; the lock is still released.
    JobSaveFailed {
        job_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// The lock on a dispatched job was released.
    JobUnlocked {
        job_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker slot started pulling jobs.
    WorkerStarted {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker slot exited.
    WorkerStopped {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::JobEnqueued { timestamp, .. } => *timestamp,
            JobEvent::JobDispatched { timestamp, .. } => *timestamp,
            JobEvent::JobCompleted { timestamp, .. } => *timestamp,
            JobEvent::JobSaveFailed { timestamp, .. } => *timestamp,
            JobEvent::JobUnlocked { timestamp, .. } => *timestamp,
            JobEvent::WorkerStarted { timestamp, .. } => *timestamp,
            JobEvent::WorkerStopped { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            JobEvent::JobEnqueued { job_id, .. }
            | JobEvent::JobDispatched { job_id, .. }
            | JobEvent::JobCompleted { job_id, .. }
            | JobEvent::JobSaveFailed { job_id, .. }
            | JobEvent::JobUnlocked { job_id, .. } => Some(job_id),
            JobEvent::WorkerStarted { .. } | JobEvent::WorkerStopped { .. } => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::JobEnqueued {
                job_id, job_type, ..
            } => format!("Job {} ({}) enqueued", job_id, job_type),
            JobEvent::JobDispatched {
                job_id, worker_id, ..
            } => format!("Job {} dispatched to {}", job_id, worker_id),
            JobEvent::JobCompleted {
                job_id,
                errored,
                duration_ms,
                ..
            } => {
                let outcome = if *errored { " with errors" } else { "" };
                format!("Job {} completed{} in {}ms", job_id, outcome, duration_ms)
            }
            JobEvent::JobSaveFailed { job_id, error, .. } => {
                format!("Job {} could not be saved: {}", job_id, error)
            }
            JobEvent::JobUnlocked { job_id, .. } => format!("Job {} unlocked", job_id),
            JobEvent::WorkerStarted { worker_id, .. } => format!("Worker {} started", worker_id),
            JobEvent::WorkerStopped { worker_id, .. } => format!("Worker {} stopped", worker_id),
        }
    }
}
