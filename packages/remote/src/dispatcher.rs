//! Dispatch actor feeding candidate job IDs into a queue's local channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use queue_core::{Driver, QueueError};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::MissedTickBehavior;

/// Messages for the dispatch actor.
#[derive(Debug)]
pub enum DispatchMessage {
    /// Ask the driver for eligible jobs and push them as candidates.
    Poll,
    /// Stop polling.
    Shutdown,
}

/// Dispatch actor arguments.
pub struct DispatchArgs {
    pub driver: Arc<dyn Driver>,
    pub candidates: mpsc::Sender<String>,
    pub poll_interval: Duration,
    pub redispatch_after: Duration,
}

/// State for the dispatch actor.
pub struct DispatchState {
    driver: Arc<dyn Driver>,
    candidates: mpsc::Sender<String>,
    redispatch_after: Duration,
    /// Candidates pushed recently, by push time.
    recent: HashMap<String, Instant>,
}

impl DispatchState {
    /// Push eligible IDs until the channel is full. Returns how many were pushed.
    async fn poll(&mut self) -> Result<usize, QueueError> {
        let now = Instant::now();
        let redispatch_after = self.redispatch_after;
        self.recent
            .retain(|_, pushed| now.duration_since(*pushed) < redispatch_after);

        let room = self.candidates.capacity();
        if room == 0 {
            return Ok(0);
        }

        // Over-fetch so recently pushed IDs cannot crowd out fresh ones.
        let ids = self.driver.eligible(room + self.recent.len()).await?;

        let mut pushed = 0;
        for id in ids {
            if self.recent.contains_key(&id) {
                continue;
            }
            match self.candidates.try_send(id.clone()) {
                Ok(()) => {
                    self.recent.insert(id, now);
                    pushed += 1;
                }
                Err(TrySendError::Full(_)) => break,
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("Candidate channel closed, dropping poll");
                    break;
                }
            }
        }

        Ok(pushed)
    }
}

/// Actor that polls the driver for eligible jobs.
///
/// The candidate channel it feeds is only a buffer. Consumers still take
/// the driver lock and re-read the job before running it.
pub struct DispatchActor;

impl Actor for DispatchActor {
    type Msg = DispatchMessage;
    type State = DispatchState;
    type Arguments = DispatchArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting dispatcher for driver {}", args.driver.owner());

        // Start the poll loop
        let poll_interval = args.poll_interval.max(Duration::from_millis(1));
        let myself_clone = myself.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if myself_clone.send_message(DispatchMessage::Poll).is_err() {
                    break;
                }
            }
        });

        Ok(DispatchState {
            driver: args.driver,
            candidates: args.candidates,
            redispatch_after: args.redispatch_after,
            recent: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DispatchMessage::Poll => match state.poll().await {
                Ok(0) => {}
                Ok(pushed) => tracing::debug!("Dispatched {} candidate(s)", pushed),
                Err(e) => tracing::warn!("Failed to poll eligible jobs: {}", e),
            },

            DispatchMessage::Shutdown => {
                tracing::info!("Shutting down dispatcher for {}", state.driver.owner());
                myself.stop(None);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_core::{JobRecord, LockToken, QueueStats};

    /// Reports a fixed list of eligible IDs.
    struct FixedDriver {
        ids: Vec<String>,
    }

    #[async_trait::async_trait]
    impl Driver for FixedDriver {
        fn owner(&self) -> &str {
            "fixed"
        }
        async fn get(&self, id: &str) -> Result<JobRecord, QueueError> {
            Err(QueueError::NotFound(id.to_string()))
        }
        async fn put(&self, _record: &JobRecord) -> Result<(), QueueError> {
            Ok(())
        }
        async fn save(&self, _record: &JobRecord) -> Result<(), QueueError> {
            Ok(())
        }
        async fn lock(&self, _id: &str) -> Result<LockToken, QueueError> {
            Ok(LockToken::new(self.owner()))
        }
        async fn renew_lock(&self, _id: &str, _token: &LockToken) -> Result<(), QueueError> {
            Ok(())
        }
        async fn unlock(&self, _id: &str, _token: &LockToken) -> Result<(), QueueError> {
            Ok(())
        }
        async fn eligible(&self, limit: usize) -> Result<Vec<String>, QueueError> {
            Ok(self.ids.iter().take(limit).cloned().collect())
        }
        async fn records(
            &self,
            _start: usize,
            _limit: usize,
        ) -> Result<Vec<JobRecord>, QueueError> {
            Ok(Vec::new())
        }
        async fn stats(&self) -> Result<QueueStats, QueueError> {
            Ok(QueueStats::default())
        }
    }

    fn state(
        ids: &[&str],
        capacity: usize,
        redispatch_after: Duration,
    ) -> (DispatchState, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let driver = FixedDriver {
            ids: ids.iter().map(|id| id.to_string()).collect(),
        };
        let state = DispatchState {
            driver: Arc::new(driver),
            candidates: tx,
            redispatch_after,
            recent: HashMap::new(),
        };
        (state, rx)
    }

    #[tokio::test]
    async fn poll_stops_when_channel_is_full() {
        let (mut state, mut rx) = state(&["a", "b", "c"], 2, Duration::from_secs(60));

        assert_eq!(state.poll().await.unwrap(), 2);
        assert_eq!(state.poll().await.unwrap(), 0);

        assert_eq!(rx.recv().await.as_deref(), Some("a"));
        assert_eq!(rx.recv().await.as_deref(), Some("b"));

        // "a" and "b" are recent, so the freed room goes to "c".
        assert_eq!(state.poll().await.unwrap(), 1);
        assert_eq!(rx.recv().await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn recent_candidates_are_pushed_again_after_the_delay() {
        let (mut state, mut rx) = state(&["a"], 4, Duration::from_millis(50));

        assert_eq!(state.poll().await.unwrap(), 1);
        assert_eq!(state.poll().await.unwrap(), 0);
        assert_eq!(rx.recv().await.as_deref(), Some("a"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(state.poll().await.unwrap(), 1);
    }
}
