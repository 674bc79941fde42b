//! libSQL-backed message store

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dchat_realtime::{MessageStore, PersistedMessage, StoreError, UserId};
use libsql::Connection;
use tracing::{debug, instrument};

use crate::db::{Database, DatabaseError};

/// Repository for direct messages
#[derive(Debug, Clone)]
pub struct MessageRepository {
    db: Arc<Database>,
}

impl MessageRepository {
    /// Create a new message repository
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageStore for MessageRepository {
    #[instrument(skip(self, content), fields(sender = %sender, recipient = %recipient))]
    async fn create_message(
        &self,
        sender: UserId,
        recipient: UserId,
        content: &str,
        encrypted: bool,
    ) -> Result<PersistedMessage, StoreError> {
        let sender_id = column_id(sender)?;
        let receiver_id = column_id(recipient)?;
        let now = Utc::now();
        let timestamp = now.to_rfc3339();

        let id = if let Some(persistent) = self.db.persistent_connection() {
            let conn = persistent.lock().await;
            insert_message(&conn, sender_id, receiver_id, content, encrypted, &timestamp).await?
        } else {
            let conn = self.db.connect().map_err(store_error)?;
            insert_message(&conn, sender_id, receiver_id, content, encrypted, &timestamp).await?
        };

        debug!(message_id = id, "Message stored");
        Ok(PersistedMessage {
            id,
            sender_id: sender,
            receiver_id: recipient,
            content: content.to_string(),
            encrypted,
            read: false,
            created_at: now,
            updated_at: now,
        })
    }

    #[instrument(skip(self), fields(sender = %sender, recipient = %recipient))]
    async fn mark_read(&self, sender: UserId, recipient: UserId) -> Result<u64, StoreError> {
        let sender_id = column_id(sender)?;
        let receiver_id = column_id(recipient)?;
        let timestamp = Utc::now().to_rfc3339();

        let updated = if let Some(persistent) = self.db.persistent_connection() {
            let conn = persistent.lock().await;
            update_read(&conn, sender_id, receiver_id, &timestamp).await?
        } else {
            let conn = self.db.connect().map_err(store_error)?;
            update_read(&conn, sender_id, receiver_id, &timestamp).await?
        };

        debug!(updated, "Messages marked read");
        Ok(updated)
    }
}

async fn insert_message(
    conn: &Connection,
    sender_id: i64,
    receiver_id: i64,
    content: &str,
    encrypted: bool,
    timestamp: &str,
) -> Result<i64, StoreError> {
    conn.execute(
        r#"
        INSERT INTO messages (sender_id, receiver_id, content, encrypted, read, created_at, updated_at)
        VALUES (?, ?, ?, ?, 0, ?, ?)
        "#,
        libsql::params![
            sender_id,
            receiver_id,
            content,
            i64::from(encrypted),
            timestamp,
            timestamp
        ],
    )
    .await
    .map_err(|e| StoreError::database(format!("Failed to insert message: {}", e)))?;

    Ok(conn.last_insert_rowid())
}

async fn update_read(
    conn: &Connection,
    sender_id: i64,
    receiver_id: i64,
    timestamp: &str,
) -> Result<u64, StoreError> {
    conn.execute(
        r#"
        UPDATE messages
        SET read = 1, updated_at = ?
        WHERE sender_id = ? AND receiver_id = ? AND read = 0
        "#,
        libsql::params![timestamp, sender_id, receiver_id],
    )
    .await
    .map_err(|e| StoreError::database(format!("Failed to mark messages read: {}", e)))
}

/// SQLite integers are signed
fn column_id(user: UserId) -> Result<i64, StoreError> {
    i64::try_from(user.get())
        .map_err(|_| StoreError::invalid_record(format!("user id {} out of range", user)))
}

fn store_error(err: DatabaseError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MigrationRunner;

    async fn setup() -> (Arc<Database>, MessageRepository) {
        let db = Arc::new(Database::in_memory("test").await.unwrap());
        MigrationRunner::default().run(&db).await.unwrap();
        (db.clone(), MessageRepository::new(db))
    }

    async fn read_flags(db: &Database) -> Vec<(i64, i64, bool)> {
        let persistent = db.persistent_connection().unwrap();
        let conn = persistent.lock().await;
        let mut rows = conn
            .query("SELECT sender_id, receiver_id, read FROM messages ORDER BY id", ())
            .await
            .unwrap();
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            let read: i64 = row.get(2).unwrap();
            out.push((row.get(0).unwrap(), row.get(1).unwrap(), read != 0));
        }
        out
    }

    #[tokio::test]
    async fn test_create_message() {
        let (db, repo) = setup().await;

        let first = repo.create_message(UserId(1), UserId(2), "hi", false).await.unwrap();
        let second = repo.create_message(UserId(1), UserId(2), "again", true).await.unwrap();

        assert!(second.id > first.id);
        assert_eq!(first.content, "hi");
        assert!(second.encrypted);
        assert!(!first.read);
        assert_eq!(read_flags(&db).await, vec![(1, 2, false), (1, 2, false)]);
    }

    #[tokio::test]
    async fn test_mark_read_only_touches_one_direction() {
        let (db, repo) = setup().await;
        repo.create_message(UserId(1), UserId(2), "a", false).await.unwrap();
        repo.create_message(UserId(1), UserId(2), "b", false).await.unwrap();
        repo.create_message(UserId(2), UserId(1), "c", false).await.unwrap();

        assert_eq!(repo.mark_read(UserId(1), UserId(2)).await.unwrap(), 2);
        assert_eq!(repo.mark_read(UserId(1), UserId(2)).await.unwrap(), 0);
        assert_eq!(
            read_flags(&db).await,
            vec![(1, 2, true), (1, 2, true), (2, 1, false)]
        );
    }

    #[tokio::test]
    async fn test_missing_table_is_reported() {
        let db = Arc::new(Database::in_memory("empty").await.unwrap());
        let repo = MessageRepository::new(db);

        let err = repo.create_message(UserId(1), UserId(2), "hi", false).await.unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[tokio::test]
    async fn test_out_of_range_id_rejected() {
        let (_db, repo) = setup().await;
        let err = repo.mark_read(UserId(u64::MAX), UserId(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
    }
}
