//! Core types for the distributed job queue.
//!
//! This crate contains the contracts shared by every package:
//! - `Job`, its `Base` state and the `ErrorRecord` aggregator
//! - `Driver`, the storage and locking backend contract
//! - `JobRegistry` for rebuilding jobs fetched from a driver
//! - `QueueError`, `QueueConfig`, `QueueStats` and `JobEvent`

mod driver;
mod error;
mod events;
mod job;
mod queue;
mod registry;

pub use driver::{Driver, LockToken};
pub use error::QueueError;
pub use events::JobEvent;
pub use job::{Base, ErrorRecord, Job, JobError, JobRecord, JobStatus, JobType, TypedJob};
pub use queue::{ConfigError, QueueConfig, QueueStats};
pub use registry::{JobConstructor, JobRegistry};

/// Re-exported so job implementations need not depend on `tokio-util` directly.
pub use tokio_util::sync::CancellationToken;
