//! Demo job types served by the worker binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use queue_core::{Base, CancellationToken, Job, JobRegistry, JobType, QueueError, TypedJob};
use remote::RemoteQueue;
use serde::{Deserialize, Serialize};

/// Logs a message, optionally after a delay.
#[derive(Debug, Serialize, Deserialize)]
pub struct EchoJob {
    #[serde(skip)]
    base: Base,
    pub message: String,
    #[serde(default)]
    pub delay_ms: u64,
}

impl EchoJob {
    pub fn new(message: impl Into<String>, delay_ms: u64) -> Self {
        Self {
            base: Base::new(Self::registered_type()),
            message: message.into(),
            delay_ms,
        }
    }
}

#[async_trait]
impl Job for EchoJob {
    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    async fn run(&mut self, cancel: CancellationToken) {
        if self.delay_ms > 0 {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.add_error("cancelled before the delay elapsed".to_string());
                    return;
                }
                _ = tokio::time::sleep(Duration::from_millis(self.delay_ms)) => {}
            }
        }
        tracing::info!("Echo {}: {}", self.base.id, self.message);
    }
}

impl TypedJob for EchoJob {
    const NAME: &'static str = "echo";
    const VERSION: u32 = 1;

    fn with_base(mut self, base: Base) -> Self {
        self.base = base;
        self
    }
}

/// Writes text to a path below the worker's output directory.
#[derive(Debug, Serialize, Deserialize)]
pub struct WriteFileJob {
    #[serde(skip)]
    base: Base,
    /// Set by the registry from the worker's configuration.
    #[serde(skip)]
    root: PathBuf,
    pub path: String,
    pub content: String,
}

impl WriteFileJob {
    pub const NAME: &'static str = "write-file";
    pub const VERSION: u32 = 1;

    pub fn registered_type() -> JobType {
        JobType::new(Self::NAME, Self::VERSION)
    }

    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            base: Base::new(Self::registered_type()),
            root: PathBuf::new(),
            path: path.into(),
            content: content.into(),
        }
    }

    fn restore(mut self, base: Base, root: PathBuf) -> Self {
        self.base = base;
        self.root = root;
        self
    }
}

#[async_trait]
impl Job for WriteFileJob {
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
        let target = match storage::resolve(&self.root, &self.path) {
            Ok(target) => target,
            Err(e) => {
                self.add_error(e.to_string());
                return;
            }
        };

        match storage::write_bytes(&target, &self.content).await {
            Ok(written) => tracing::info!("Wrote {} bytes to {}", written, target.display()),
            Err(e) => self.add_error(e.to_string()),
        }
    }
}

/// Build the registry of every job type this worker can run.
pub fn registry(output_dir: &Path) -> Result<JobRegistry, QueueError> {
    let mut registry = JobRegistry::new();
    registry.register_typed::<EchoJob>()?;

    let root = output_dir.to_path_buf();
    registry.register(WriteFileJob::registered_type(), move |base, payload| {
        let job: WriteFileJob = serde_json::from_value(payload)?;
        Ok(Box::new(job.restore(base, root.clone())) as Box<dyn Job>)
    })?;

    Ok(registry)
}

/// Enqueue a small demo backlog. Returns how many jobs were added.
pub async fn seed(queue: &RemoteQueue) -> Result<usize, QueueError> {
    let jobs: Vec<Box<dyn Job>> = vec![
        Box::new(EchoJob::new("hello", 0)),
        Box::new(EchoJob::new("from", 100)),
        Box::new(EchoJob::new("the queue", 200)),
        Box::new(WriteFileJob::new("demo/greeting.txt", "hello from the queue\n")),
        Box::new(WriteFileJob::new("demo/nested/notes.txt", "written by a worker\n")),
        // Rejected at run time; shows up as an errored job in the summary.
        Box::new(WriteFileJob::new("../outside.txt", "never written\n")),
    ];

    for job in &jobs {
        queue.put(job.as_ref()).await?;
    }
    Ok(jobs.len())
}
