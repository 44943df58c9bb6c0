//! Database connection management.

use std::fmt;

use queue_core::QueueError;
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect as connect_any};
use surrealdb::opt::auth::Root;
use thiserror::Error;

/// Database connection handle. Cloning shares the underlying connection.
pub type Database = Surreal<Any>;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Connection mode: "mem://", "file://path" or "rocksdb://path"
    pub endpoint: String,
    /// Namespace to use
    pub namespace: String,
    /// Database name to use
    pub database: String,
    /// Optional root credentials for authentication
    pub credentials: Option<(String, String)>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "jobqueue".to_string(),
            database: "main".to_string(),
            credentials: None,
        }
    }
}

impl DbConfig {
    /// Create a config for in-memory testing.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Create a config for file-based persistence.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("file://{}", path.into()),
            ..Default::default()
        }
    }

    /// Create a config for RocksDB persistence (requires rocksdb feature).
    pub fn rocksdb(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("rocksdb://{}", path.into()),
            ..Default::default()
        }
    }

    /// Build a config from environment variables.
    ///
    /// - `DB_ENDPOINT` (default: `mem://`)
    /// - `DB_NAMESPACE` (default: `jobqueue`)
    /// - `DB_DATABASE` (default: `main`)
    /// - `DB_USER` and `DB_PASS` (optional, both required to sign in)
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(endpoint) = std::env::var("DB_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Ok(namespace) = std::env::var("DB_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Ok(database) = std::env::var("DB_DATABASE") {
            config.database = database;
        }
        if let (Ok(user), Ok(pass)) = (std::env::var("DB_USER"), std::env::var("DB_PASS")) {
            config.credentials = Some((user, pass));
        }
        config
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set root credentials for authentication.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }
}

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(#[from] surrealdb::Error),
    #[error("Query error: {0}")]
    Query(String),
}

impl From<DbError> for QueueError {
    fn from(err: DbError) -> Self {
        QueueError::Backend(err.to_string())
    }
}

/// Map any backend failure onto the queue taxonomy.
pub(crate) fn backend(err: impl fmt::Display) -> QueueError {
    QueueError::Backend(err.to_string())
}

/// Open a database connection.
///
/// Every call opens a separate connection; for `mem://` that is a separate,
/// empty store. Clone the returned handle to share one backend.
pub async fn connect(config: &DbConfig) -> Result<Database, DbError> {
    tracing::info!("Connecting to database: {}", config.endpoint);

    let db = connect_any(config.endpoint.as_str()).await?;

    // Authenticate if credentials provided
    if let Some((username, password)) = &config.credentials {
        db.signin(Root { username, password }).await?;
    }

    // Select namespace and database
    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await?;

    tracing::info!(
        "Connected to database: {}/{}",
        config.namespace,
        config.database
    );

    Ok(db)
}
