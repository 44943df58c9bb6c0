//! Queue and worker pool over a shared driver.
//!
//! # Architecture
//!
//! - `RemoteQueue` - Put/Next/Complete/Results/Stats over one `Driver`
//! - `DispatchActor` - Ractor actor polling the driver for eligible jobs
//!   and feeding the queue's candidate channel
//! - `LocalWorkers` - Fixed number of slots running jobs from one queue
//!
//! # Usage
//!
//! ```ignore
//! let queue = Arc::new(RemoteQueue::new(driver, registry, config));
//! queue.put(&job).await?;
//!
//! let mut pool = LocalWorkers::new(4, queue.clone());
//! pool.start(&cancel).await?;
//! queue.wait_until_complete(&cancel, interval).await?;
//! cancel.cancel();
//! pool.wait().await?;
//! ```

mod dispatcher;
mod pool;
mod queue;

pub use pool::{LocalWorkers, PoolError};
pub use queue::RemoteQueue;
