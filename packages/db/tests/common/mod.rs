use std::sync::Arc;
use std::time::Duration;

use db::{DbConfig, DbError, MemoryDriver, SurrealDriver};
use queue_core::{Driver, JobRecord, JobStatus, JobType};
use serde_json::json;

/// Two drivers sharing one backend, each with its own owner.
pub type Pair = (Arc<dyn Driver>, Arc<dyn Driver>);

pub fn memory_pair(lock_timeout: Duration) -> Pair {
    let first = MemoryDriver::new(lock_timeout);
    let second = first.sibling();
    (Arc::new(first), Arc::new(second))
}

pub async fn surreal_pair(lock_timeout: Duration) -> Result<Pair, DbError> {
    // Every mem:// connection is a fresh store, so tests do not interfere.
    let first = SurrealDriver::connect(&DbConfig::memory(), lock_timeout).await?;
    let second = first.sibling();
    Ok((Arc::new(first), Arc::new(second)))
}

/// `size` drivers sharing one in-memory store.
pub fn memory_group(size: usize, lock_timeout: Duration) -> Vec<Arc<dyn Driver>> {
    let first = MemoryDriver::new(lock_timeout);
    (0..size)
        .map(|_| Arc::new(first.sibling()) as Arc<dyn Driver>)
        .collect()
}

/// `size` drivers sharing one SurrealDB connection.
pub async fn surreal_group(
    size: usize,
    lock_timeout: Duration,
) -> Result<Vec<Arc<dyn Driver>>, DbError> {
    let first = SurrealDriver::connect(&DbConfig::memory(), lock_timeout).await?;
    Ok((0..size)
        .map(|_| Arc::new(first.sibling()) as Arc<dyn Driver>)
        .collect())
}

pub fn record(id: &str) -> JobRecord {
    JobRecord {
        id: id.to_string(),
        job_type: JobType::new("test", 1),
        status: JobStatus::new(),
        errors: Vec::new(),
        payload: json!({ "msg": id }),
    }
}
