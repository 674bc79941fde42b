//! Wire envelope: the unit routed between connections.
//!
//! Envelopes travel as JSON text frames:
//!
//! ```json
//! {"type":"chat","from":1,"to":2,"content":"hi","encrypted":false,"timestamp":"2024-05-01T10:00:00Z"}
//! ```
//!
//! Clients may omit everything but `type`; missing ids decode as `0`, missing
//! content as empty, missing timestamps as the decode time. The optional `data`
//! payload is omitted on encode when absent.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::store::PersistedMessage;
use crate::{RealtimeError, UserId};

/// Envelope type tag (`type` on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EnvelopeKind {
    /// Direct message, persisted then relayed
    Chat,
    /// Typing indicator, relayed only
    Typing,
    /// Read receipt
    Read,
    /// Confirmation that a chat was persisted
    Sent,
    /// Presence change of another user
    Status,
    /// Application-level heartbeat from a client
    Ping,
    /// Heartbeat reply
    Pong,
    /// Request for / reply with the set of online users
    OnlineUsers,
    /// Failure notice to the sender
    Error,
    /// Anything else; kept verbatim for logging
    Unknown(String),
}

impl EnvelopeKind {
    /// Wire name of this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unknown(other) => other,
            known => known.label(),
        }
    }

    /// Fixed name for metric attributes. Every unrecognised kind shares
    /// `unknown`, so clients cannot mint new label values.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Typing => "typing",
            Self::Read => "read",
            Self::Sent => "sent",
            Self::Status => "status",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::OnlineUsers => "online_users",
            Self::Error => "error",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<String> for EnvelopeKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "chat" => Self::Chat,
            "typing" => Self::Typing,
            "read" => Self::Read,
            "sent" => Self::Sent,
            "status" => Self::Status,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "online_users" => Self::OnlineUsers,
            "error" => Self::Error,
            _ => Self::Unknown(value),
        }
    }
}

impl From<EnvelopeKind> for String {
    fn from(kind: EnvelopeKind) -> Self {
        match kind {
            EnvelopeKind::Unknown(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One routed message unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    #[serde(default)]
    from: UserId,
    #[serde(default)]
    to: UserId,
    #[serde(default)]
    content: String,
    #[serde(default)]
    encrypted: bool,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl Envelope {
    /// Create an envelope with empty content, stamped now.
    pub fn new(kind: EnvelopeKind, from: UserId, to: UserId) -> Self {
        Self {
            kind,
            from,
            to,
            content: String::new(),
            encrypted: false,
            timestamp: Utc::now(),
            data: None,
        }
    }

    /// Set the body text.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Mark the body as end-to-end encrypted (opaque to the server).
    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// Set the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach a structured payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Replace the sender and timestamp with server-side values.
    ///
    /// Applied to every inbound envelope: clients never get to choose their
    /// own `from`.
    pub fn stamped(mut self, sender: UserId, received_at: DateTime<Utc>) -> Self {
        self.from = sender;
        self.timestamp = received_at;
        self
    }

    /// Decode an envelope from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, RealtimeError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode this envelope as a JSON text frame.
    pub fn encode(&self) -> Result<String, RealtimeError> {
        serde_json::to_string(self).map_err(|e| RealtimeError::encode(e.to_string()))
    }

    pub fn kind(&self) -> &EnvelopeKind {
        &self.kind
    }

    pub fn from(&self) -> UserId {
        self.from
    }

    pub fn to(&self) -> UserId {
        self.to
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    // ------------------------------------------------------------------------
    // Outbound envelopes built by the router and presence notifier
    // ------------------------------------------------------------------------

    /// `chat` relayed to the recipient, carrying the persisted record.
    pub fn chat_relay(record: &PersistedMessage) -> Self {
        Self::new(EnvelopeKind::Chat, record.sender_id, record.receiver_id)
            .with_content(record.content.clone())
            .with_encrypted(record.encrypted)
            .with_timestamp(record.created_at)
            .with_data(record.to_value())
    }

    /// `sent` confirmation for the originating connection.
    pub fn sent_confirmation(record: &PersistedMessage) -> Self {
        Self::new(EnvelopeKind::Sent, record.sender_id, record.receiver_id)
            .with_timestamp(record.created_at)
            .with_data(record.to_value())
    }

    /// `typing` relay.
    pub fn typing(from: UserId, to: UserId, at: DateTime<Utc>) -> Self {
        Self::new(EnvelopeKind::Typing, from, to).with_timestamp(at)
    }

    /// `read` notification for the original sender.
    pub fn read_receipt(reader: UserId, original_sender: UserId, at: DateTime<Utc>) -> Self {
        Self::new(EnvelopeKind::Read, reader, original_sender).with_timestamp(at)
    }

    /// `pong` reply to a client heartbeat.
    pub fn pong(to: UserId) -> Self {
        Self::new(EnvelopeKind::Pong, UserId::default(), to)
    }

    /// `online_users` reply.
    pub fn online_users(to: UserId, users: &BTreeSet<UserId>) -> Self {
        Self::new(EnvelopeKind::OnlineUsers, UserId::default(), to).with_data(json!({
            "users": users,
            "count": users.len(),
        }))
    }

    /// `error` notice for the sender of a failed envelope.
    pub fn failure(to: UserId, code: &str, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::new(EnvelopeKind::Error, UserId::default(), to).with_data(json!({
            "code": code,
            "message": message,
        }))
    }
}
