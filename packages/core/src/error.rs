//! Error taxonomy shared by drivers, the queue and the pool.

use thiserror::Error;

use crate::JobType;

/// Errors returned by every `Driver` and by queue operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job is already locked: {0}")]
    AlreadyLocked(String),

    #[error("version conflict for job {id}: expected stored version {expected}, found {found}")]
    VersionConflict { id: String, expected: u64, found: u64 },

    #[error("job already exists: {0}")]
    DuplicateJob(String),

    #[error("lock lost for job: {0}")]
    LockLost(String),

    #[error("no constructor registered for job type {0}")]
    UnknownJobType(JobType),

    #[error("duplicate constructor for job type {0}")]
    DuplicateJobType(JobType),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl QueueError {
    /// Expected races between consumers. These are retried, never surfaced.
    pub fn is_contention(&self) -> bool {
        matches!(self, QueueError::AlreadyLocked(_))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}
