//! In-process driver backed by a shared map.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use queue_core::{Driver, JobRecord, LockToken, QueueError, QueueStats};
use tracing::{debug, warn};
use ulid::Ulid;

#[derive(Debug)]
struct Lease {
    token: LockToken,
    expires_at: Instant,
}

impl Lease {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug)]
struct Entry {
    record: JobRecord,
    lease: Option<Lease>,
}

impl Entry {
    fn is_locked(&self, now: Instant) -> bool {
        self.lease.as_ref().is_some_and(|lease| lease.is_live(now))
    }

    fn holds(&self, token: &LockToken) -> bool {
        self.lease.as_ref().is_some_and(|lease| lease.token == *token)
    }
}

#[derive(Debug)]
struct Store {
    jobs: Mutex<BTreeMap<String, Entry>>,
    lock_timeout: Duration,
}

/// A driver that keeps jobs and locks in memory.
///
/// Instances created with [`MemoryDriver::sibling`] share the store and
/// behave like separate processes against one backend.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    store: Arc<Store>,
    owner: String,
}

impl MemoryDriver {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            store: Arc::new(Store {
                jobs: Mutex::new(BTreeMap::new()),
                lock_timeout,
            }),
            owner: Ulid::new().to_string(),
        }
    }

    /// A new driver over the same store with a distinct owner.
    pub fn sibling(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            owner: Ulid::new().to_string(),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        // A panic while holding the guard cannot leave an entry half-written.
        self.store
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn owner(&self) -> &str {
        &self.owner
    }

    async fn get(&self, id: &str) -> Result<JobRecord, QueueError> {
        self.jobs()
            .get(id)
            .map(|entry| entry.record.clone())
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    async fn put(&self, record: &JobRecord) -> Result<(), QueueError> {
        self.jobs().insert(
            record.id.clone(),
            Entry {
                record: record.clone(),
                lease: None,
            },
        );
        Ok(())
    }

    async fn save(&self, record: &JobRecord) -> Result<(), QueueError> {
        let mut jobs = self.jobs();
        let entry = jobs
            .get_mut(&record.id)
            .ok_or_else(|| QueueError::NotFound(record.id.clone()))?;

        let found = entry.record.status.modification_count;
        let expected = record.status.modification_count.checked_sub(1);
        if expected != Some(found) {
            return Err(QueueError::VersionConflict {
                id: record.id.clone(),
                expected: expected.unwrap_or_default(),
                found,
            });
        }

        entry.record = record.clone();
        Ok(())
    }

    async fn lock(&self, id: &str) -> Result<LockToken, QueueError> {
        let now = Instant::now();
        let mut jobs = self.jobs();
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        // Not re-entrant: two slots sharing one driver must still exclude
        // each other.
        if entry.is_locked(now) {
            return Err(QueueError::AlreadyLocked(id.to_string()));
        }

        let token = LockToken::new(&self.owner);
        entry.lease = Some(Lease {
            token: token.clone(),
            expires_at: now + self.store.lock_timeout,
        });
        Ok(token)
    }

    async fn renew_lock(&self, id: &str, token: &LockToken) -> Result<(), QueueError> {
        let now = Instant::now();
        let mut jobs = self.jobs();
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        match entry.lease.as_mut() {
            // An expired lease nobody took over is still ours to extend.
            Some(lease) if lease.token == *token => {
                lease.expires_at = now + self.store.lock_timeout;
                Ok(())
            }
            _ => Err(QueueError::LockLost(id.to_string())),
        }
    }

    async fn unlock(&self, id: &str, token: &LockToken) -> Result<(), QueueError> {
        let mut jobs = self.jobs();
        let Some(entry) = jobs.get_mut(id) else {
            warn!("Unlock of unknown job {}", id);
            return Ok(());
        };

        if entry.holds(token) {
            entry.lease = None;
            debug!("Unlocked job {}", id);
        } else {
            warn!("Unlock of job {} with stale lease {}", id, token);
        }
        Ok(())
    }

    async fn eligible(&self, limit: usize) -> Result<Vec<String>, QueueError> {
        let now = Instant::now();
        Ok(self
            .jobs()
            .iter()
            .filter(|(_, entry)| !entry.record.is_completed() && !entry.is_locked(now))
            .map(|(id, _)| id.clone())
            .take(limit)
            .collect())
    }

    async fn records(&self, start: usize, limit: usize) -> Result<Vec<JobRecord>, QueueError> {
        Ok(self
            .jobs()
            .values()
            .skip(start)
            .take(limit)
            .map(|entry| entry.record.clone())
            .collect())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let now = Instant::now();
        let jobs = self.jobs();
        let mut stats = QueueStats {
            total: jobs.len() as u64,
            ..Default::default()
        };

        for entry in jobs.values() {
            if entry.record.is_completed() {
                stats.completed += 1;
                if entry.record.has_errors() {
                    stats.errored += 1;
                }
            } else if entry.is_locked(now) {
                stats.in_progress += 1;
            } else {
                stats.pending += 1;
            }
        }

        Ok(stats)
    }
}
