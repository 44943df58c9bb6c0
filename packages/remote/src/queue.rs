//! A queue coupling one driver to a local candidate channel.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, Stream, StreamExt};
use queue_core::{
    CancellationToken, Driver, Job, JobEvent, JobRecord, JobRegistry, LockToken, QueueConfig,
    QueueError, QueueStats,
};
use ractor::{Actor, ActorRef};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchActor, DispatchArgs, DispatchMessage};

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 1024;

/// Decides which process runs which job.
///
/// Any number of queues, in any number of processes, may share one
/// backend. The candidate channel is only a buffer: a job is dispatched
/// after its driver lock is taken and its stored state is re-read.
///
/// Dispatch order is whatever the driver's eligibility feed yields. No
/// FIFO or priority ordering is provided.
pub struct RemoteQueue {
    driver: Arc<dyn Driver>,
    registry: Arc<JobRegistry>,
    config: QueueConfig,
    /// Handed to the dispatcher on `start`.
    sender: Mutex<Option<mpsc::Sender<String>>>,
    candidates: tokio::sync::Mutex<mpsc::Receiver<String>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    events: broadcast::Sender<JobEvent>,
}

/// The running dispatch actor.
struct Dispatcher {
    actor: ActorRef<DispatchMessage>,
    /// Child of the token given to `start`; also cancelled on drop.
    stop: CancellationToken,
}

impl RemoteQueue {
    pub fn new(driver: Arc<dyn Driver>, registry: Arc<JobRegistry>, config: QueueConfig) -> Self {
        let (sender, candidates) = mpsc::channel(config.channel_capacity.max(1));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            driver,
            registry,
            config,
            sender: Mutex::new(Some(sender)),
            candidates: tokio::sync::Mutex::new(candidates),
            dispatcher: Mutex::new(None),
            events,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Start the dispatcher. It stops when `cancel` fires, after which
    /// `next` drains the channel and then returns `None`.
    ///
    /// Calling `start` again is a no-op.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), QueueError> {
        let Some(sender) = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        let args = DispatchArgs {
            driver: Arc::clone(&self.driver),
            candidates: sender,
            poll_interval: self.config.poll_interval,
            redispatch_after: self.config.redispatch_after,
        };
        let (actor, _handle) = Actor::spawn(None, DispatchActor, args)
            .await
            .map_err(|e| QueueError::Backend(format!("Failed to spawn dispatcher: {}", e)))?;

        let stop = cancel.child_token();
        *self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Dispatcher {
            actor: actor.clone(),
            stop: stop.clone(),
        });

        tokio::spawn(async move {
            stop.cancelled().await;
            let _ = actor.send_message(DispatchMessage::Shutdown);
        });

        info!("Queue started for driver {}", self.driver.owner());
        Ok(())
    }

    /// Register a new job with the driver.
    ///
    /// Fails with `DuplicateJob` when the ID is already known.
    pub async fn put(&self, job: &dyn Job) -> Result<(), QueueError> {
        let record = job.to_record()?;

        match self.driver.get(&record.id).await {
            Ok(_) => return Err(QueueError::DuplicateJob(record.id)),
            Err(QueueError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.driver.put(&record).await?;

        debug!("Enqueued job {} ({})", record.id, record.job_type);
        self.emit(JobEvent::JobEnqueued {
            job_id: record.id,
            job_type: record.job_type,
            timestamp: Utc::now(),
        });
        self.poke();

        Ok(())
    }

    /// Wait for the next job this process may run.
    ///
    /// The returned job is locked by this queue's driver and is never
    /// completed. Its lease token is kept in `Base::lock` until
    /// [`RemoteQueue::complete`] releases it. Returns `None` once `cancel` fires or the dispatcher
    /// has stopped and the channel is drained.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<Box<dyn Job>> {
        loop {
            let candidate = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                candidate = self.recv() => candidate?,
            };

            if let Some(job) = self.claim(&candidate).await {
                return Some(job);
            }
        }
    }

    async fn recv(&self) -> Option<String> {
        self.candidates.lock().await.recv().await
    }

    /// Lock, re-read and rebuild a candidate. Any failure after the lock
    /// is taken releases it.
    async fn claim(&self, id: &str) -> Option<Box<dyn Job>> {
        let token = match self.driver.lock(id).await {
            Ok(token) => token,
            Err(e) if e.is_contention() => {
                debug!("Job {} is locked elsewhere", id);
                return None;
            }
            Err(e) => {
                warn!("Failed to lock job {}: {}", id, e);
                return None;
            }
        };

        let record = match self.driver.get(id).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to fetch locked job {}: {}", id, e);
                self.release(id, &token).await;
                return None;
            }
        };

        if record.is_completed() {
            debug!("Job {} is already completed", id);
            self.release(id, &token).await;
            return None;
        }

        match self.registry.build(record) {
            Ok(mut job) => {
                let base = job.base_mut();
                base.status.in_progress = true;
                base.lock = Some(token);
                Some(job)
            }
            Err(e) => {
                warn!("Failed to rebuild job {}: {}", id, e);
                self.release(id, &token).await;
                None
            }
        }
    }

    /// Retire a dispatched job: mark it complete, save it, then release
    /// its lock whether or not the save succeeded.
    pub async fn complete(&self, job: &mut dyn Job) -> Result<(), QueueError> {
        job.mark_complete();
        let token = job.base_mut().lock.take();
        let status = job.status_mut();
        status.in_progress = false;
        status.bump();

        let saved = match job.to_record() {
            Ok(record) => self.driver.save(&record).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &saved {
            self.emit(JobEvent::JobSaveFailed {
                job_id: job.id().to_string(),
                error: e.to_string(),
                timestamp: Utc::now(),
            });
        }

        match token {
            Some(token) => self.release(job.id(), &token).await,
            None => warn!("Completed job {} without holding its lock", job.id()),
        }
        saved
    }

    async fn release(&self, id: &str, token: &LockToken) {
        match self.driver.unlock(id, token).await {
            Ok(()) => self.emit(JobEvent::JobUnlocked {
                job_id: id.to_string(),
                timestamp: Utc::now(),
            }),
            Err(e) => warn!("Failed to unlock job {}: {}", id, e),
        }
    }

    /// Rebuild a job from its stored state, for inspection.
    pub async fn get(&self, id: &str) -> Result<Box<dyn Job>, QueueError> {
        let record = self.driver.get(id).await?;
        self.registry.build(record)
    }

    /// Every job known to the driver, fetched lazily page by page.
    ///
    /// Finite; call again to restart from the beginning.
    pub fn results(&self) -> impl Stream<Item = Result<JobRecord, QueueError>> + Send + '_ {
        let page_size = self.config.results_page_size.max(1);

        stream::unfold(Some(0usize), move |cursor| async move {
            let start = cursor?;
            match self.driver.records(start, page_size).await {
                Ok(page) if page.is_empty() => None,
                Ok(page) => {
                    let next = (page.len() == page_size).then_some(start + page.len());
                    Some((page.into_iter().map(Ok).collect::<Vec<_>>(), next))
                }
                Err(e) => Some((vec![Err(e)], None)),
            }
        })
        .flat_map(stream::iter)
    }

    /// Advisory counts. Not used for dispatch decisions.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.driver.stats().await
    }

    /// Subscribe to queue and worker events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Poll stats until every known job is completed.
    ///
    /// Returns `false` if `cancel` fired first.
    pub async fn wait_until_complete(
        &self,
        cancel: &CancellationToken,
        interval: Duration,
    ) -> Result<bool, QueueError> {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(false),
                _ = ticker.tick() => {}
            }
            if self.stats().await?.is_complete() {
                return Ok(true);
            }
        }
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Ask the dispatcher for an immediate poll.
    fn poke(&self) {
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(dispatcher) = dispatcher.as_ref() {
            let _ = dispatcher.actor.send_message(DispatchMessage::Poll);
        }
    }
}

impl Drop for RemoteQueue {
    fn drop(&mut self) {
        let dispatcher = self
            .dispatcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.stop.cancel();
            dispatcher.actor.stop(None);
        }
    }
}
