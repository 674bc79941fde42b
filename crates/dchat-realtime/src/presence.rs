//! Presence change notifications.
//!
//! Presence is ephemeral: a [`PresenceEvent`] is built on register or
//! unregister, rendered as a `status` envelope and fanned out by
//! [`crate::ConnectionRegistry::notify_presence`]. Nothing is stored.

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::{Envelope, EnvelopeKind, UserId};

/// A user came online or went offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub user_id: UserId,
    pub online: bool,
    pub timestamp: DateTime<Utc>,
}

impl PresenceEvent {
    pub fn online(user_id: UserId) -> Self {
        Self {
            user_id,
            online: true,
            timestamp: Utc::now(),
        }
    }

    pub fn offline(user_id: UserId) -> Self {
        Self {
            user_id,
            online: false,
            timestamp: Utc::now(),
        }
    }

    /// `status` envelope sent to every other connection.
    ///
    /// Not addressed to anyone in particular, so `to` stays `0`.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(EnvelopeKind::Status, self.user_id, UserId::default())
            .with_timestamp(self.timestamp)
            .with_data(json!({
                "user_id": self.user_id,
                "online": self.online,
            }))
    }
}
