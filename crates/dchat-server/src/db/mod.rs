//! Database module for the dChat server
//!
//! A thin libSQL layer with:
//! - File-backed or in-memory databases
//! - Embedded schema migrations
//! - Health check capabilities
//!
//! In-memory databases keep a single persistent connection, since every new
//! connection to `:memory:` would see an empty database.

mod migrations;

use std::path::Path;
use std::sync::Arc;

use libsql::{Connection, Database as LibSqlDatabase};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

pub use migrations::MigrationRunner;

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Database query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Internal database error: {0}")]
    Internal(#[from] libsql::Error),
}

/// Wrapper around a libsql database
#[derive(Clone)]
pub struct Database {
    db: Arc<LibSqlDatabase>,
    name: String,
    persistent: Option<Arc<Mutex<Connection>>>,
}

impl Database {
    /// Create a new in-memory database
    #[instrument(skip_all)]
    pub async fn in_memory(name: &str) -> Result<Self, DatabaseError> {
        debug!("Creating in-memory database: {}", name);
        let db = libsql::Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;

        Ok(Self {
            db: Arc::new(db),
            name: name.to_string(),
            persistent: Some(Arc::new(Mutex::new(conn))),
        })
    }

    /// Create or open a local file-based database
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open_local(name: &str, path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        debug!("Opening local database '{}' at: {:?}", name, path);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                let msg = format!("Failed to create database directory: {}", e);
                DatabaseError::ConnectionFailed(msg)
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await?;

        info!("Opened database '{}' at {:?}", name, path);
        Ok(Self {
            db: Arc::new(db),
            name: name.to_string(),
            persistent: None,
        })
    }

    /// Open `path`, or an in-memory database when `path` is `None`
    pub async fn open(name: &str, path: Option<&Path>) -> Result<Self, DatabaseError> {
        match path {
            Some(path) => Self::open_local(name, path).await,
            None => Self::in_memory(name).await,
        }
    }

    /// Get a fresh connection to the database
    pub fn connect(&self) -> Result<Connection, DatabaseError> {
        Ok(self.db.connect()?)
    }

    /// Shared connection for in-memory databases, `None` for file-backed ones
    pub fn persistent_connection(&self) -> Option<Arc<Mutex<Connection>>> {
        self.persistent.clone()
    }

    /// Get the database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the database is healthy by executing a simple query
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn health_check(&self) -> Result<bool, DatabaseError> {
        let result = if let Some(persistent) = &self.persistent {
            let conn = persistent.lock().await;
            conn.query("SELECT 1", ()).await.map(|_| ())
        } else {
            let conn = self.connect()?;
            conn.query("SELECT 1", ()).await.map(|_| ())
        };

        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!("Database health check failed: {}", e);
                Ok(false)
            }
        }
    }

    /// Execute a single statement
    #[cfg(test)]
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn execute(&self, sql: &str) -> Result<u64, DatabaseError> {
        let rows = if let Some(persistent) = &self.persistent {
            let conn = persistent.lock().await;
            conn.execute(sql, ()).await?
        } else {
            self.connect()?.execute(sql, ()).await?
        };
        Ok(rows)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("in_memory", &self.persistent.is_some())
            .finish()
    }
}
