//! The storage and coordination contract every backend satisfies.

use std::fmt;

use async_trait::async_trait;
use ulid::Ulid;

use crate::{JobRecord, QueueError, QueueStats};

/// Proof of one successful [`Driver::lock`].
///
/// Every acquisition mints a fresh token, so a holder whose lease expired
/// and was taken over cannot renew or release its successor's lease, even
/// from the same driver instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Mint a token for a lock taken by `owner`.
    pub fn new(owner: &str) -> Self {
        Self(format!("{}.{}", owner, Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pluggable storage and distributed-locking backend for jobs.
///
/// Every instance sharing a backend sees the same jobs and the same locks.
/// Locks are leases: a lock whose lease expired can be taken by anyone, and
/// the holder keeps it alive with [`Driver::renew_lock`]. Renewing and
/// releasing require the [`LockToken`] returned by [`Driver::lock`].
#[async_trait]
pub trait Driver: Send + Sync {
    /// Identifies this instance. Prefixes every [`LockToken`] it mints.
    fn owner(&self) -> &str;

    /// Fetch the authoritative state of a job.
    async fn get(&self, id: &str) -> Result<JobRecord, QueueError>;

    /// Insert or fully overwrite a job. Any lock on the ID is released.
    async fn put(&self, record: &JobRecord) -> Result<(), QueueError>;

    /// Persist state written by the lock holder.
    ///
    /// Fails with `VersionConflict`, leaving storage untouched, unless the
    /// stored `modification_count` is exactly one less than the record's.
    async fn save(&self, record: &JobRecord) -> Result<(), QueueError>;

    /// Take exclusive ownership of a job. `AlreadyLocked` whenever a live
    /// lease exists, including one taken through this instance, and when a
    /// concurrent attempt wins the race.
    async fn lock(&self, id: &str) -> Result<LockToken, QueueError>;

    /// Extend the lease identified by `token`. `LockLost` when the lease
    /// now belongs to someone else or was released.
    async fn renew_lock(&self, id: &str, token: &LockToken) -> Result<(), QueueError>;

    /// Release the lease identified by `token`. Releasing a lease that is
    /// no longer current is logged and otherwise ignored.
    async fn unlock(&self, id: &str, token: &LockToken) -> Result<(), QueueError>;

    /// IDs of jobs that are neither completed nor under a live lease.
    async fn eligible(&self, limit: usize) -> Result<Vec<String>, QueueError>;

    /// One page of every stored job, ordered by ID.
    async fn records(&self, start: usize, limit: usize) -> Result<Vec<JobRecord>, QueueError>;

    /// Advisory counts across the whole store. `in_progress` counts live
    /// leases, not the stored `JobStatus::in_progress` flag.
    async fn stats(&self) -> Result<QueueStats, QueueError>;
}
