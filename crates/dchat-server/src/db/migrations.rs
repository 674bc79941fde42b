//! Schema migrations for the dChat database
//!
//! Migrations are embedded SQL applied in version order and tracked in a
//! `_migrations` table, so running them again is a no-op.

use super::Database;
use super::DatabaseError;
use tracing::{debug, info, instrument};

/// A single database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number (must be unique and incrementing)
    pub version: i64,
    /// Description of what this migration does
    pub description: String,
    /// SQL to execute for the migration
    pub sql: &'static str,
}

impl Migration {
    pub fn new(version: i64, description: &str, sql: &'static str) -> Self {
        Self {
            version,
            description: description.to_string(),
            sql,
        }
    }
}

/// Direct messages table
pub const V0001_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id INTEGER NOT NULL,
    receiver_id INTEGER NOT NULL,
    content TEXT NOT NULL,
    encrypted INTEGER NOT NULL DEFAULT 0,
    read INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_sender_id ON messages(sender_id);
CREATE INDEX IF NOT EXISTS idx_messages_receiver_id ON messages(receiver_id);
"#;

/// Partial index for the unread lookup done on every read receipt
pub const V0002_UNREAD_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_messages_unread
    ON messages(sender_id, receiver_id)
    WHERE read = 0;
"#;

/// All migrations, in order
pub fn all() -> Vec<Migration> {
    vec![
        Migration::new(1, "Direct messages", V0001_MESSAGES),
        Migration::new(2, "Unread message index", V0002_UNREAD_INDEX),
    ]
}

/// Applies pending migrations to a database
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    migrations: Vec<Migration>,
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::new(all())
    }
}

impl MigrationRunner {
    /// Create a new migration runner with the given migrations
    pub fn new(migrations: Vec<Migration>) -> Self {
        let mut sorted = migrations;
        sorted.sort_by_key(|m| m.version);
        Self { migrations: sorted }
    }

    /// Run all pending migrations, returning the versions applied
    #[instrument(skip_all, fields(db_name = %db.name()))]
    pub async fn run(&self, db: &Database) -> Result<Vec<i64>, DatabaseError> {
        if let Some(persistent) = db.persistent_connection() {
            let conn = persistent.lock().await;
            self.run_with_connection(&conn).await
        } else {
            let conn = db.connect()?;
            self.run_with_connection(&conn).await
        }
    }

    async fn run_with_connection(
        &self,
        conn: &libsql::Connection,
    ) -> Result<Vec<i64>, DatabaseError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::MigrationFailed(format!("Failed to create migrations table: {}", e))
        })?;

        let applied = applied_versions(conn).await?;
        debug!("Already applied migrations: {:?}", applied);

        let mut newly_applied = Vec::new();
        for migration in &self.migrations {
            if applied.contains(&migration.version) {
                continue;
            }

            info!("Applying migration v{}: {}", migration.version, migration.description);

            conn.execute_batch(migration.sql).await.map_err(|e| {
                let msg = format!("Migration v{} failed: {}", migration.version, e);
                DatabaseError::MigrationFailed(msg)
            })?;

            conn.execute(
                "INSERT INTO _migrations (version, description) VALUES (?, ?)",
                (migration.version, migration.description.as_str()),
            )
            .await
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!(
                    "Failed to record migration v{}: {}",
                    migration.version, e
                ))
            })?;

            newly_applied.push(migration.version);
        }

        if newly_applied.is_empty() {
            debug!("No new migrations to apply");
        } else {
            info!("Applied {} new migrations", newly_applied.len());
        }

        Ok(newly_applied)
    }

    /// Highest applied version, or `None` on a fresh database
    #[instrument(skip_all, fields(db_name = %db.name()))]
    pub async fn current_version(&self, db: &Database) -> Result<Option<i64>, DatabaseError> {
        let versions = if let Some(persistent) = db.persistent_connection() {
            let conn = persistent.lock().await;
            table_versions(&conn).await?
        } else {
            let conn = db.connect()?;
            table_versions(&conn).await?
        };
        Ok(versions.into_iter().max())
    }

    /// Whether any migration has not been applied yet
    pub async fn has_pending(&self, db: &Database) -> Result<bool, DatabaseError> {
        let current = self.current_version(db).await?.unwrap_or(0);
        Ok(self.migrations.iter().any(|m| m.version > current))
    }
}

/// Versions recorded in `_migrations`, or none if the table is missing
async fn table_versions(conn: &libsql::Connection) -> Result<Vec<i64>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT name FROM sqlite_master WHERE type='table' AND name='_migrations'",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::QueryFailed(format!("Failed to check migrations table: {}", e))
        })?;

    let exists = rows
        .next()
        .await
        .map_err(|e| DatabaseError::QueryFailed(format!("Failed to read result: {}", e)))?
        .is_some();
    if !exists {
        return Ok(Vec::new());
    }
    applied_versions(conn).await
}

async fn applied_versions(conn: &libsql::Connection) -> Result<Vec<i64>, DatabaseError> {
    let mut rows = conn
        .query("SELECT version FROM _migrations ORDER BY version", ())
        .await
        .map_err(|e| DatabaseError::MigrationFailed(format!("Failed to query migrations: {}", e)))?;

    let mut versions = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| {
            DatabaseError::MigrationFailed(format!("Failed to read migration row: {}", e))
        })?
    {
        let version: i64 = row
            .get(0)
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!("Failed to get version from row: {}", e))
            })?;
        versions.push(version);
    }
    Ok(versions)
}
