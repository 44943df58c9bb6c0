//! Bounded pool of worker slots pulling from one queue.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use queue_core::{CancellationToken, Driver, Job, JobEvent, LockToken, QueueError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::RemoteQueue;

/// Backend errors seen by a pool while persisting finished jobs.
#[derive(Debug, Error)]
#[error("worker pool saw {} backend error(s)", .errors.len())]
pub struct PoolError {
    pub errors: Vec<QueueError>,
}

/// Runs up to `size` jobs at a time from one queue.
pub struct LocalWorkers {
    size: usize,
    queue: Arc<RemoteQueue>,
    slots: Vec<JoinHandle<()>>,
    errors: Arc<Mutex<Vec<QueueError>>>,
}

impl LocalWorkers {
    /// Create a pool. A size of zero is treated as one.
    pub fn new(size: usize, queue: Arc<RemoteQueue>) -> Self {
        Self {
            size: size.max(1),
            queue,
            slots: Vec::new(),
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn queue(&self) -> &Arc<RemoteQueue> {
        &self.queue
    }

    /// Start the queue and every slot. Slots exit once `cancel` fires,
    /// after finishing the job they are running.
    ///
    /// Calling `start` again is a no-op.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<(), QueueError> {
        if !self.slots.is_empty() {
            return Ok(());
        }

        self.queue.start(cancel).await?;

        let heartbeat = self.queue.config().heartbeat_interval;
        for n in 1..=self.size {
            let slot = Slot {
                worker_id: format!("worker-{}", n),
                queue: Arc::clone(&self.queue),
                errors: Arc::clone(&self.errors),
                heartbeat,
            };
            self.slots.push(tokio::spawn(slot.run(cancel.clone())));
        }

        info!("Started {} worker(s)", self.size);
        Ok(())
    }

    /// Wait for every slot to exit.
    pub async fn wait(self) -> Result<(), PoolError> {
        for handle in self.slots {
            if let Err(e) = handle.await {
                error!("Worker slot aborted: {}", e);
                self.errors
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(QueueError::Backend(format!("worker slot aborted: {}", e)));
            }
        }

        let errors = std::mem::take(
            &mut *self
                .errors
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PoolError { errors })
        }
    }
}

/// One execution slot.
struct Slot {
    worker_id: String,
    queue: Arc<RemoteQueue>,
    errors: Arc<Mutex<Vec<QueueError>>>,
    heartbeat: Duration,
}

impl Slot {
    async fn run(self, cancel: CancellationToken) {
        info!("Worker {} started", self.worker_id);
        self.queue.emit(JobEvent::WorkerStarted {
            worker_id: self.worker_id.clone(),
            timestamp: Utc::now(),
        });

        while let Some(mut job) = self.queue.next(&cancel).await {
            self.execute(job.as_mut(), &cancel).await;
        }

        info!("Worker {} stopped", self.worker_id);
        self.queue.emit(JobEvent::WorkerStopped {
            worker_id: self.worker_id.clone(),
            timestamp: Utc::now(),
        });
    }

    async fn execute(&self, job: &mut dyn Job, cancel: &CancellationToken) {
        let job_id = job.id().to_string();
        self.queue.emit(JobEvent::JobDispatched {
            job_id: job_id.clone(),
            worker_id: self.worker_id.clone(),
            timestamp: Utc::now(),
        });

        let started = Instant::now();
        // Renewed from its own task so a job that blocks its thread cannot
        // starve the lease.
        let period = self.heartbeat.max(Duration::from_millis(1));
        let heartbeat = job.base().lock.clone().map(|token| {
            tokio::spawn(keep_alive(
                Arc::clone(self.queue.driver()),
                job_id.clone(),
                token,
                period,
            ))
        });
        // Let the heartbeat get polled before a job that may hold this thread.
        tokio::task::yield_now().await;

        let outcome = AssertUnwindSafe(job.run(cancel.clone()))
            .catch_unwind()
            .await;
        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }

        if let Err(panic) = outcome {
            let message = panic_message(&*panic);
            warn!("Job {} panicked: {}", job_id, message);
            job.add_error(format!("job panicked: {}", message));
        }

        let errored = job.error().is_some();
        match self.queue.complete(job).await {
            Ok(()) => self.queue.emit(JobEvent::JobCompleted {
                job_id,
                worker_id: self.worker_id.clone(),
                errored,
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                timestamp: Utc::now(),
            }),
            Err(e) => {
                error!("Failed to save job {}: {}", job_id, e);
                self.errors
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(e);
            }
        }
    }
}

/// Renew a lease every `period` until aborted.
async fn keep_alive(driver: Arc<dyn Driver>, job_id: String, token: LockToken, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        if let Err(e) = driver.renew_lock(&job_id, &token).await {
            warn!("Failed to renew lock on job {}: {}", job_id, e);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*boxed), "static");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");

        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*boxed), "unknown panic");
    }
}
