//! Error types for the real-time hub.

use std::fmt;

use thiserror::Error;

/// Errors raised while moving envelopes between transports, the router and
/// the persistence collaborator.
///
/// Only transport-level variants end a connection; everything else is logged
/// by the read loop and the offending envelope is dropped.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Transport failure (socket reset, closed sink)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Inbound frame exceeded the configured maximum
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Size of the offending frame
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// Envelope could not be decoded from the wire
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Envelope could not be encoded for the wire
    #[error("Encode error: {0}")]
    Encode(String),

    /// Persistence collaborator failed
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Envelope kind the router does not accept from clients
    #[error("Unsupported envelope kind: {0}")]
    UnsupportedKind(String),

    /// Envelope is missing required fields
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Outbound write did not complete in time
    #[error("Write timed out")]
    WriteTimeout,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RealtimeError {
    /// Create a new encode error.
    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    /// Create a new invalid envelope error.
    pub fn invalid_envelope(msg: impl Into<String>) -> Self {
        Self::InvalidEnvelope(msg.into())
    }

    /// Create a new unsupported kind error.
    pub fn unsupported_kind(kind: impl Into<String>) -> Self {
        Self::UnsupportedKind(kind.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Errors reported by a [`crate::MessageStore`] implementation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Underlying database failure
    #[error("Database error: {0}")]
    Database(String),

    /// A stored row could not be turned into a record
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Store is not reachable right now
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Create a new database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a new invalid record error.
    pub fn invalid_record(msg: impl Into<String>) -> Self {
        Self::InvalidRecord(msg.into())
    }
}

/// Opaque error produced by a transport adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    message: String,
}

impl TransportError {
    /// Wrap a transport failure description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Build from any displayable error.
    pub fn from_display(err: impl fmt::Display) -> Self {
        Self::new(err.to_string())
    }

    /// Description of the failure.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TransportError {}
