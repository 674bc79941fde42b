//! Hub configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RealtimeError;

/// What a sender is told when its envelope could not be handled.
///
/// Under the default the sender infers failure from the absence of a `sent`
/// confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureNotice {
    /// Drop silently, log only.
    #[default]
    Silent,
    /// Send an `error` envelope back to the originating connection.
    NotifySender,
}

impl FailureNotice {
    /// Parse a policy name.
    ///
    /// Valid values (case-insensitive):
    /// - "silent", "none", "off" -> Silent
    /// - "notify", "notify_sender", "notify-sender" -> NotifySender
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "silent" | "none" | "off" => Some(Self::Silent),
            "notify" | "notify_sender" | "notify-sender" => Some(Self::NotifySender),
            _ => None,
        }
    }

    /// Whether failures are reported to the sender.
    pub fn notifies(self) -> bool {
        matches!(self, Self::NotifySender)
    }
}

impl fmt::Display for FailureNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Silent => write!(f, "silent"),
            Self::NotifySender => write!(f, "notify_sender"),
        }
    }
}

/// Tuning knobs for connections and routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Capacity of each connection's outbound queue. A full queue evicts the
    /// connection.
    pub outbound_capacity: usize,
    /// Idle time on the write side before a keepalive ping is sent.
    pub keepalive_interval: Duration,
    /// How long a ping may go unanswered before the connection is dropped.
    pub keepalive_timeout: Duration,
    /// Deadline for one outbound write cycle (batch + flush).
    pub write_timeout: Duration,
    /// Largest inbound frame accepted, in bytes.
    pub max_frame_bytes: usize,
    /// Most queued envelopes coalesced into one write cycle.
    pub max_batch: usize,
    /// Failure reporting policy.
    pub failure_notice: FailureNotice,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            keepalive_interval: Duration::from_secs(54),
            keepalive_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            max_frame_bytes: 512 * 1024,
            max_batch: 64,
            failure_notice: FailureNotice::Silent,
        }
    }
}

impl HubConfig {
    /// Check that every knob is usable.
    pub fn validate(&self) -> Result<(), RealtimeError> {
        if self.outbound_capacity == 0 {
            return Err(RealtimeError::config("outbound_capacity must be at least 1"));
        }
        if self.max_batch == 0 {
            return Err(RealtimeError::config("max_batch must be at least 1"));
        }
        if self.max_frame_bytes == 0 {
            return Err(RealtimeError::config("max_frame_bytes must be at least 1"));
        }
        if self.keepalive_interval.is_zero() || self.keepalive_timeout.is_zero() {
            return Err(RealtimeError::config("keepalive durations must be non-zero"));
        }
        if self.write_timeout.is_zero() {
            return Err(RealtimeError::config("write_timeout must be non-zero"));
        }
        Ok(())
    }
}
