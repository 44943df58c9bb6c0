//! Job domain types: identity, status, error aggregation and the `Job` contract.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::{LockToken, QueueError};

/// Identifies the registered constructor that can rebuild a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobType {
    pub name: String,
    pub version: u32,
}

impl JobType {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// Persisted status of a job.
///
/// `modification_count` is the fencing token: every write through
/// `Driver::save` must carry exactly `stored + 1`.
///
/// `in_progress` describes the dispatched copy held by a worker. A
/// dispatch does not write to the driver, so the stored flag stays false
/// and whether a job is running is read from its lease instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub completed: bool,
    pub in_progress: bool,
    pub modification_count: u64,
    pub modification_time: DateTime<Utc>,
}

impl JobStatus {
    pub fn new() -> Self {
        Self {
            completed: false,
            in_progress: false,
            modification_count: 0,
            modification_time: Utc::now(),
        }
    }

    /// Advance the fencing token ahead of a `save`.
    pub fn bump(&mut self) {
        self.modification_count += 1;
        self.modification_time = Utc::now();
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered list of failures recorded while a job ran.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorRecord(Vec<String>);

impl ErrorRecord {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn add<E: fmt::Display>(&mut self, err: E) {
        self.0.push(err.to_string());
    }

    /// Record the error of a fallible step, if any.
    pub fn check<T, E: fmt::Display>(&mut self, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.add(err);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn messages(&self) -> &[String] {
        &self.0
    }

    /// Fold every recorded failure into one error, or `None` when clean.
    pub fn resolve(&self) -> Option<JobError> {
        if self.0.is_empty() {
            None
        } else {
            Some(JobError {
                messages: self.0.clone(),
            })
        }
    }
}

impl From<Vec<String>> for ErrorRecord {
    fn from(messages: Vec<String>) -> Self {
        Self(messages)
    }
}

/// The combined failure of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    messages: Vec<String>,
}

impl JobError {
    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.messages.join("; "))
    }
}

impl std::error::Error for JobError {}

/// State shared by every job implementation.
///
/// Concrete jobs embed a `Base` and expose it through [`Job::base`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Base {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub errors: ErrorRecord,
    /// Lease held while a queue has this job dispatched. Never persisted.
    pub lock: Option<LockToken>,
}

impl Base {
    /// Create a base with a generated `"{type}.{ulid}"` ID.
    pub fn new(job_type: JobType) -> Self {
        let id = format!("{}.{}", job_type.name, Ulid::new());
        Self::with_id(id, job_type)
    }

    pub fn with_id(id: impl Into<String>, job_type: JobType) -> Self {
        Self {
            id: id.into(),
            job_type,
            status: JobStatus::new(),
            errors: ErrorRecord::new(),
            lock: None,
        }
    }

    /// Restore the base of a job fetched from a driver.
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            id: record.id.clone(),
            job_type: record.job_type.clone(),
            status: record.status.clone(),
            errors: ErrorRecord::from(record.errors.clone()),
            lock: None,
        }
    }
}

/// A unit of work.
///
/// Completion and success are orthogonal: a job that fails records the
/// failure with [`Job::add_error`] and still reaches the completed state.
/// Callers check [`Job::error`] once the job is complete.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn base(&self) -> &Base;

    fn base_mut(&mut self) -> &mut Base;

    /// Job-specific state, persisted alongside the base.
    fn payload(&self) -> Result<serde_json::Value, serde_json::Error>;

    /// Execute the work. Implementations observe `cancel` and return
    /// promptly when it fires, recording partial failures rather than
    /// panicking.
    async fn run(&mut self, cancel: CancellationToken);

    fn id(&self) -> &str {
        &self.base().id
    }

    fn job_type(&self) -> &JobType {
        &self.base().job_type
    }

    fn status(&self) -> &JobStatus {
        &self.base().status
    }

    fn status_mut(&mut self) -> &mut JobStatus {
        &mut self.base_mut().status
    }

    fn add_error(&mut self, message: String) {
        self.base_mut().errors.add(message);
    }

    fn mark_complete(&mut self) {
        self.base_mut().status.completed = true;
    }

    fn error(&self) -> Option<JobError> {
        self.base().errors.resolve()
    }

    fn to_record(&self) -> Result<JobRecord, QueueError> {
        let base = self.base();
        Ok(JobRecord {
            id: base.id.clone(),
            job_type: base.job_type.clone(),
            status: base.status.clone(),
            errors: base.errors.messages().to_vec(),
            payload: self.payload()?,
        })
    }
}

/// A job whose payload is the job struct itself, serialized with serde.
///
/// The `Base` field should be `#[serde(skip)]`; the registry restores it
/// from the stored record.
pub trait TypedJob: Job + Serialize + DeserializeOwned + Sized {
    const NAME: &'static str;
    const VERSION: u32;

    fn registered_type() -> JobType {
        JobType::new(Self::NAME, Self::VERSION)
    }

    fn with_base(self, base: Base) -> Self;
}

/// The form in which a driver stores a job.
///
/// Lock ownership is driver state and never part of the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl JobRecord {
    pub fn is_completed(&self) -> bool {
        self.status.completed
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}
