//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates the job table and its indexes.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(JOB_SCHEMA)
        .await?
        .check()
        .map_err(|e| DbError::Query(e.to_string()))?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job table schema.
///
/// The table is schemaless because job payloads are arbitrary documents.
/// Lock state lives beside the record: `lock_owner` is empty when unlocked
/// and `lock_expires_ms` is the lease deadline in Unix milliseconds.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;

DEFINE INDEX IF NOT EXISTS job_id ON job FIELDS job_id UNIQUE;
DEFINE INDEX IF NOT EXISTS job_completed ON job FIELDS status.completed;
DEFINE INDEX IF NOT EXISTS job_lock ON job FIELDS lock_owner, lock_expires_ms;
"#;
