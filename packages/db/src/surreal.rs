//! SurrealDB-backed driver.
//!
//! Each job is one row in the `job` table keyed by the job ID. The lock is
//! two columns on the same row, so taking, renewing and releasing it are
//! single conditional `UPDATE` statements. When two of them hit the same
//! row at once, SurrealDB commits one and rejects the other.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use queue_core::{Driver, JobRecord, JobStatus, JobType, LockToken, QueueError, QueueStats};
use serde::{Deserialize, Serialize};
use surrealdb::error::{Api as ApiFailure, Db as DbFailure};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::connection::backend;
use crate::{Database, DbConfig, DbError, connect, init_schema};

const TABLE: &str = "job";

/// Stored form of a job. The record ID is the job ID and is not read back.
#[derive(Debug, Serialize, Deserialize)]
struct JobRow {
    job_id: String,
    job_type: JobType,
    status: JobStatus,
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    payload: serde_json::Value,
    /// Current lease token, empty when unlocked.
    #[serde(default)]
    lock_owner: String,
    /// Lease deadline, Unix milliseconds.
    #[serde(default)]
    lock_expires_ms: i64,
}

impl JobRow {
    fn unlocked(record: &JobRecord) -> Self {
        Self {
            job_id: record.id.clone(),
            job_type: record.job_type.clone(),
            status: record.status.clone(),
            errors: record.errors.clone(),
            payload: record.payload.clone(),
            lock_owner: String::new(),
            lock_expires_ms: 0,
        }
    }

    fn into_record(self) -> JobRecord {
        JobRecord {
            id: self.job_id,
            job_type: self.job_type,
            status: self.status,
            errors: self.errors,
            payload: self.payload,
        }
    }
}

/// Whether a write was rejected because a concurrent transaction on the
/// same row committed first. The embedded engines report this as a
/// retryable transaction error, surfaced per statement.
fn is_write_conflict(err: &surrealdb::Error) -> bool {
    let retryable = DbFailure::TxRetryable.to_string();
    match err {
        surrealdb::Error::Db(DbFailure::TxRetryable) => true,
        surrealdb::Error::Db(DbFailure::QueryNotExecutedDetail { message, .. }) => {
            *message == retryable
        }
        surrealdb::Error::Api(ApiFailure::Query(message)) => message.contains(&retryable),
        _ => false,
    }
}

#[derive(Deserialize)]
struct CountResult {
    count: i64,
}

#[derive(Deserialize)]
struct IdResult {
    job_id: String,
}

/// A driver that stores jobs and locks in SurrealDB.
#[derive(Clone)]
pub struct SurrealDriver {
    db: Database,
    owner: String,
    lock_timeout: Duration,
}

impl SurrealDriver {
    /// Wrap an open connection. The schema must already be initialized.
    pub fn new(db: Database, lock_timeout: Duration) -> Self {
        Self {
            db,
            owner: Ulid::new().to_string(),
            lock_timeout,
        }
    }

    /// Connect and initialize the schema.
    pub async fn connect(config: &DbConfig, lock_timeout: Duration) -> Result<Self, DbError> {
        let db = connect(config).await?;
        init_schema(&db).await?;
        Ok(Self::new(db, lock_timeout))
    }

    /// A new driver over the same connection with a distinct owner.
    pub fn sibling(&self) -> Self {
        Self::new(self.db.clone(), self.lock_timeout)
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn expires_ms(&self) -> i64 {
        let timeout = i64::try_from(self.lock_timeout.as_millis()).unwrap_or(i64::MAX);
        Self::now_ms().saturating_add(timeout)
    }

    async fn row(&self, id: &str) -> Result<Option<JobRow>, QueueError> {
        self.db
            .select((TABLE, id.to_string()))
            .await
            .map_err(backend)
    }

    async fn count(&self, query: &str, now: i64) -> Result<u64, QueueError> {
        let mut response = self
            .db
            .query(query)
            .bind(("now", now))
            .await
            .map_err(backend)?;
        let counts: Vec<CountResult> = response.take(0).map_err(backend)?;
        Ok(counts
            .first()
            .map(|c| u64::try_from(c.count).unwrap_or_default())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Driver for SurrealDriver {
    fn owner(&self) -> &str {
        &self.owner
    }

    async fn get(&self, id: &str) -> Result<JobRecord, QueueError> {
        self.row(id)
            .await?
            .map(JobRow::into_record)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    async fn put(&self, record: &JobRecord) -> Result<(), QueueError> {
        let _: Option<JobRow> = self
            .db
            .upsert((TABLE, record.id.clone()))
            .content(JobRow::unlocked(record))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn save(&self, record: &JobRecord) -> Result<(), QueueError> {
        let expected = record.status.modification_count.checked_sub(1);

        if let Some(expected) = expected {
            let mut response = self
                .db
                .query(
                    r#"
                    UPDATE type::thing($table, $id)
                    SET job_type = $job_type, status = $status, errors = $errors, payload = $payload
                    WHERE status.modification_count = $expected
                    RETURN AFTER
                    "#,
                )
                .bind(("table", TABLE))
                .bind(("id", record.id.clone()))
                .bind(("job_type", record.job_type.clone()))
                .bind(("status", record.status.clone()))
                .bind(("errors", record.errors.clone()))
                .bind(("payload", record.payload.clone()))
                .bind(("expected", i64::try_from(expected).unwrap_or(i64::MAX)))
                .await
                .map_err(backend)?;

            let updated: Vec<JobRow> = response.take(0).map_err(backend)?;
            if !updated.is_empty() {
                return Ok(());
            }
        }

        let stored = self
            .row(&record.id)
            .await?
            .ok_or_else(|| QueueError::NotFound(record.id.clone()))?;

        Err(QueueError::VersionConflict {
            id: record.id.clone(),
            expected: expected.unwrap_or_default(),
            found: stored.status.modification_count,
        })
    }

    async fn lock(&self, id: &str) -> Result<LockToken, QueueError> {
        let token = LockToken::new(&self.owner);
        let result = self
            .db
            .query(
                r#"
                UPDATE type::thing($table, $id)
                SET lock_owner = $lease_token, lock_expires_ms = $expires
                WHERE lock_owner = '' OR lock_expires_ms <= $now
                RETURN AFTER
                "#,
            )
            .bind(("table", TABLE))
            .bind(("id", id.to_string()))
            .bind(("lease_token", token.as_str().to_string()))
            .bind(("expires", self.expires_ms()))
            .bind(("now", Self::now_ms()))
            .await
            .and_then(|mut response| response.take::<Vec<JobRow>>(0));

        let locked = match result {
            Ok(rows) => rows,
            // Another attempt on the same row committed first.
            Err(e) if is_write_conflict(&e) => {
                debug!("Lost lock race on job {}", id);
                return Err(QueueError::AlreadyLocked(id.to_string()));
            }
            Err(e) => return Err(backend(e)),
        };
        if !locked.is_empty() {
            return Ok(token);
        }

        match self.row(id).await? {
            Some(_) => Err(QueueError::AlreadyLocked(id.to_string())),
            None => Err(QueueError::NotFound(id.to_string())),
        }
    }

    async fn renew_lock(&self, id: &str, token: &LockToken) -> Result<(), QueueError> {
        let result = self
            .db
            .query(
                r#"
                UPDATE type::thing($table, $id)
                SET lock_expires_ms = $expires
                WHERE lock_owner = $lease_token
                RETURN AFTER
                "#,
            )
            .bind(("table", TABLE))
            .bind(("id", id.to_string()))
            .bind(("lease_token", token.as_str().to_string()))
            .bind(("expires", self.expires_ms()))
            .await
            .and_then(|mut response| response.take::<Vec<JobRow>>(0));

        let conflict = match result {
            Ok(renewed) if !renewed.is_empty() => return Ok(()),
            Ok(_) => None,
            Err(e) if is_write_conflict(&e) => Some(e),
            Err(e) => return Err(backend(e)),
        };

        // A conflict only means the lease is gone if someone else now holds it.
        match self.row(id).await? {
            Some(row) if row.lock_owner == token.as_str() => match conflict {
                Some(e) => Err(backend(e)),
                None => Err(QueueError::LockLost(id.to_string())),
            },
            Some(_) => Err(QueueError::LockLost(id.to_string())),
            None => Err(QueueError::NotFound(id.to_string())),
        }
    }

    async fn unlock(&self, id: &str, token: &LockToken) -> Result<(), QueueError> {
        let mut response = self
            .db
            .query(
                r#"
                UPDATE type::thing($table, $id)
                SET lock_owner = '', lock_expires_ms = 0
                WHERE lock_owner = $lease_token
                RETURN AFTER
                "#,
            )
            .bind(("table", TABLE))
            .bind(("id", id.to_string()))
            .bind(("lease_token", token.as_str().to_string()))
            .await
            .map_err(backend)?;

        let released: Vec<JobRow> = response.take(0).map_err(backend)?;
        if released.is_empty() {
            warn!("Unlock of job {} with stale lease {}", id, token);
        } else {
            debug!("Unlocked job {}", id);
        }
        Ok(())
    }

    async fn eligible(&self, limit: usize) -> Result<Vec<String>, QueueError> {
        let mut response = self
            .db
            .query(
                r#"
                SELECT job_id FROM job
                WHERE status.completed = false AND (lock_owner = '' OR lock_expires_ms <= $now)
                ORDER BY job_id
                LIMIT $limit
                "#,
            )
            .bind(("now", Self::now_ms()))
            .bind(("limit", i64::try_from(limit).unwrap_or(i64::MAX)))
            .await
            .map_err(backend)?;

        let ids: Vec<IdResult> = response.take(0).map_err(backend)?;
        Ok(ids.into_iter().map(|row| row.job_id).collect())
    }

    async fn records(&self, start: usize, limit: usize) -> Result<Vec<JobRecord>, QueueError> {
        let mut response = self
            .db
            .query("SELECT * FROM job ORDER BY job_id LIMIT $limit START $start")
            .bind(("limit", i64::try_from(limit).unwrap_or(i64::MAX)))
            .bind(("start", i64::try_from(start).unwrap_or(i64::MAX)))
            .await
            .map_err(backend)?;

        let rows: Vec<JobRow> = response.take(0).map_err(backend)?;
        Ok(rows.into_iter().map(JobRow::into_record).collect())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let now = Self::now_ms();

        let total = self
            .count("SELECT count() AS count FROM job GROUP ALL", now)
            .await?;
        let completed = self
            .count(
                "SELECT count() AS count FROM job WHERE status.completed = true GROUP ALL",
                now,
            )
            .await?;
        let errored = self
            .count(
                "SELECT count() AS count FROM job \
                 WHERE status.completed = true AND array::len(errors) > 0 GROUP ALL",
                now,
            )
            .await?;
        let in_progress = self
            .count(
                "SELECT count() AS count FROM job \
                 WHERE status.completed = false AND lock_owner != '' AND lock_expires_ms > $now \
                 GROUP ALL",
                now,
            )
            .await?;

        // Counts come from separate statements, so clamp rather than trust
        // them to add up under concurrent writes.
        let pending = total.saturating_sub(completed).saturating_sub(in_progress);

        Ok(QueueStats {
            total,
            pending,
            in_progress,
            completed,
            errored,
        })
    }
}
