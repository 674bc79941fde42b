//! Persistence collaborator interface.
//!
//! The router never owns message rows; it asks a [`MessageStore`] to create
//! them and to flip read flags. `dchat-server` backs this with libSQL; the
//! [`InMemoryStore`] here serves embedded use and tests.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{StoreError, UserId};

/// A direct message as stored by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedMessage {
    pub id: i64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub encrypted: bool,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedMessage {
    /// JSON form carried in the `data` field of `chat` and `sent` envelopes.
    pub fn to_value(&self) -> Value {
        // Plain struct of JSON-native fields; serialization cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Storage operations the router depends on.
///
/// Implementations must be safe to share across every connection's read loop.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Persist a new unread message.
    async fn create_message(
        &self,
        sender: UserId,
        recipient: UserId,
        content: &str,
        encrypted: bool,
    ) -> Result<PersistedMessage, StoreError>;

    /// Mark every unread message from `sender` to `recipient` as read.
    ///
    /// Returns the number of messages updated.
    async fn mark_read(&self, sender: UserId, recipient: UserId) -> Result<u64, StoreError>;
}

/// Process-local message store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    messages: Mutex<Vec<PersistedMessage>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every stored message, oldest first.
    pub fn messages(&self) -> Vec<PersistedMessage> {
        self.lock().clone()
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PersistedMessage>> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn create_message(
        &self,
        sender: UserId,
        recipient: UserId,
        content: &str,
        encrypted: bool,
    ) -> Result<PersistedMessage, StoreError> {
        let now = Utc::now();
        let mut messages = self.lock();
        let record = PersistedMessage {
            id: messages.len() as i64 + 1,
            sender_id: sender,
            receiver_id: recipient,
            content: content.to_string(),
            encrypted,
            read: false,
            created_at: now,
            updated_at: now,
        };
        messages.push(record.clone());
        debug!(id = record.id, "Stored message in memory");
        Ok(record)
    }

    async fn mark_read(&self, sender: UserId, recipient: UserId) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut updated = 0;
        for message in self.lock().iter_mut() {
            if message.sender_id == sender && message.receiver_id == recipient && !message.read {
                message.read = true;
                message.updated_at = now;
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_assigns_sequential_ids() {
        let store = InMemoryStore::new();
        let first = store
            .create_message(UserId(1), UserId(2), "hello", false)
            .await
            .unwrap();
        let second = store
            .create_message(UserId(2), UserId(1), "hi back", true)
            .await
            .unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert!(!first.read);
        assert!(second.encrypted);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_mark_read_only_touches_matching_pair() {
        let store = InMemoryStore::new();
        store.create_message(UserId(1), UserId(2), "a", false).await.unwrap();
        store.create_message(UserId(1), UserId(2), "b", false).await.unwrap();
        store.create_message(UserId(3), UserId(2), "c", false).await.unwrap();

        let updated = store.mark_read(UserId(1), UserId(2)).await.unwrap();
        assert_eq!(updated, 2);

        // Already read messages are not counted again
        let updated = store.mark_read(UserId(1), UserId(2)).await.unwrap();
        assert_eq!(updated, 0);

        let unread: Vec<_> = store.messages().into_iter().filter(|m| !m.read).collect();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].sender_id, UserId(3));
    }

    #[test]
    fn test_record_json_shape() {
        let now = Utc::now();
        let record = PersistedMessage {
            id: 9,
            sender_id: UserId(1),
            receiver_id: UserId(2),
            content: "hi".to_string(),
            encrypted: false,
            read: false,
            created_at: now,
            updated_at: now,
        };
        let value = record.to_value();
        assert_eq!(value["id"], 9);
        assert_eq!(value["sender_id"], 1);
        assert_eq!(value["receiver_id"], 2);
        assert_eq!(value["read"], false);
    }
}
