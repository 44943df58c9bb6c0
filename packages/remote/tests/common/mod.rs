#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use db::MemoryDriver;
use queue_core::{
    Base, CancellationToken, Driver, Job, JobRecord, JobRegistry, JobType, LockToken,
    QueueConfig, QueueError, QueueStats, TypedJob,
};
use remote::RemoteQueue;
use serde::{Deserialize, Serialize};

pub fn config() -> QueueConfig {
    QueueConfig::default()
        .with_workers(4)
        .with_poll_interval(Duration::from_millis(10))
        .with_lock_timeout(Duration::from_secs(5))
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_redispatch_after(Duration::from_millis(100))
}

/// Records which jobs are running and how often each ran.
#[derive(Default)]
pub struct Tracker {
    running: Mutex<HashSet<String>>,
    runs: Mutex<HashMap<String, usize>>,
    overlaps: AtomicUsize,
}

impl Tracker {
    fn enter(&self, id: &str) {
        if !self.running.lock().unwrap().insert(id.to_string()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn exit(&self, id: &str) {
        self.running.lock().unwrap().remove(id);
        *self.runs.lock().unwrap().entry(id.to_string()).or_default() += 1;
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn runs(&self, id: &str) -> usize {
        self.runs.lock().unwrap().get(id).copied().unwrap_or_default()
    }

    pub fn total_runs(&self) -> usize {
        self.runs.lock().unwrap().values().sum()
    }
}

/// Sleeps for `millis`, ignoring cancellation, and reports to a tracker.
pub struct TrackedJob {
    base: Base,
    millis: u64,
    tracker: Arc<Tracker>,
}

impl TrackedJob {
    pub fn tracked_type() -> JobType {
        JobType::new("tracked", 1)
    }

    pub fn new(id: &str, millis: u64, tracker: Arc<Tracker>) -> Self {
        Self {
            base: Base::with_id(id, Self::tracked_type()),
            millis,
            tracker,
        }
    }
}

#[async_trait]
impl Job for TrackedJob {
    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        Ok(serde_json::json!({ "millis": self.millis }))
    }

    async fn run(&mut self, _cancel: CancellationToken) {
        self.tracker.enter(&self.base.id);
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        self.tracker.exit(&self.base.id);
    }
}

/// Blocks its thread for `millis` without yielding.
pub struct BlockingJob {
    base: Base,
    millis: u64,
}

impl BlockingJob {
    pub fn blocking_type() -> JobType {
        JobType::new("blocking", 1)
    }

    pub fn new(id: &str, millis: u64) -> Self {
        Self {
            base: Base::with_id(id, Self::blocking_type()),
            millis,
        }
    }
}

#[async_trait]
impl Job for BlockingJob {
    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        Ok(serde_json::json!({ "millis": self.millis }))
    }

    async fn run(&mut self, _cancel: CancellationToken) {
        std::thread::sleep(Duration::from_millis(self.millis));
    }
}

/// Records each message as an error, or panics when asked to.
#[derive(Serialize, Deserialize)]
pub struct ScriptedJob {
    #[serde(skip)]
    base: Base,
    pub errors: Vec<String>,
    pub panic: Option<String>,
}

impl ScriptedJob {
    pub fn failing(id: &str, errors: &[&str]) -> Self {
        Self {
            base: Base::with_id(id, Self::registered_type()),
            errors: errors.iter().map(|e| e.to_string()).collect(),
            panic: None,
        }
    }

    pub fn panicking(id: &str, message: &str) -> Self {
        Self {
            base: Base::with_id(id, Self::registered_type()),
            errors: Vec::new(),
            panic: Some(message.to_string()),
        }
    }
}

#[async_trait]
impl Job for ScriptedJob {
    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    async fn run(&mut self, _cancel: CancellationToken) {
        for message in self.errors.clone() {
            self.add_error(message);
        }
        if let Some(message) = &self.panic {
            panic!("{}", message);
        }
    }
}

impl TypedJob for ScriptedJob {
    const NAME: &'static str = "scripted";
    const VERSION: u32 = 1;

    fn with_base(mut self, base: Base) -> Self {
        self.base = base;
        self
    }
}

pub fn registry(tracker: &Arc<Tracker>) -> Arc<JobRegistry> {
    let mut registry = JobRegistry::new();
    let tracker = Arc::clone(tracker);
    registry
        .register(TrackedJob::tracked_type(), move |base, payload| {
            let millis = payload["millis"].as_u64().unwrap_or_default();
            Ok(Box::new(TrackedJob {
                base,
                millis,
                tracker: Arc::clone(&tracker),
            }) as Box<dyn Job>)
        })
        .unwrap();
    registry
        .register(BlockingJob::blocking_type(), |base, payload| {
            let millis = payload["millis"].as_u64().unwrap_or_default();
            Ok(Box::new(BlockingJob { base, millis }) as Box<dyn Job>)
        })
        .unwrap();
    registry.register_typed::<ScriptedJob>().unwrap();
    Arc::new(registry)
}

pub fn queue(driver: Arc<dyn Driver>, tracker: &Arc<Tracker>) -> Arc<RemoteQueue> {
    Arc::new(RemoteQueue::new(driver, registry(tracker), config()))
}

/// Wraps a driver, counting successful locks and unlocks per job.
pub struct CountingDriver {
    inner: MemoryDriver,
    locks: Mutex<HashMap<String, usize>>,
    unlocks: Mutex<HashMap<String, usize>>,
    pub fail_saves: AtomicBool,
}

impl CountingDriver {
    pub fn new(inner: MemoryDriver) -> Self {
        Self {
            inner,
            locks: Mutex::new(HashMap::new()),
            unlocks: Mutex::new(HashMap::new()),
            fail_saves: AtomicBool::new(false),
        }
    }

    pub fn locks(&self) -> HashMap<String, usize> {
        self.locks.lock().unwrap().clone()
    }

    pub fn unlocks(&self) -> HashMap<String, usize> {
        self.unlocks.lock().unwrap().clone()
    }
}

#[async_trait]
impl Driver for CountingDriver {
    fn owner(&self) -> &str {
        self.inner.owner()
    }

    async fn get(&self, id: &str) -> Result<JobRecord, QueueError> {
        self.inner.get(id).await
    }

    async fn put(&self, record: &JobRecord) -> Result<(), QueueError> {
        self.inner.put(record).await
    }

    async fn save(&self, record: &JobRecord) -> Result<(), QueueError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(QueueError::Backend("save refused".into()));
        }
        self.inner.save(record).await
    }

    async fn lock(&self, id: &str) -> Result<LockToken, QueueError> {
        let token = self.inner.lock(id).await?;
        *self.locks.lock().unwrap().entry(id.to_string()).or_default() += 1;
        Ok(token)
    }

    async fn renew_lock(&self, id: &str, token: &LockToken) -> Result<(), QueueError> {
        self.inner.renew_lock(id, token).await
    }

    async fn unlock(&self, id: &str, token: &LockToken) -> Result<(), QueueError> {
        *self.unlocks.lock().unwrap().entry(id.to_string()).or_default() += 1;
        self.inner.unlock(id, token).await
    }

    async fn eligible(&self, limit: usize) -> Result<Vec<String>, QueueError> {
        self.inner.eligible(limit).await
    }

    async fn records(&self, start: usize, limit: usize) -> Result<Vec<JobRecord>, QueueError> {
        self.inner.records(start, limit).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.inner.stats().await
    }
}
