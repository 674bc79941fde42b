//! Per-user connection state and the non-blocking delivery path.
//!
//! A [`Connection`] is created for every accepted transport. Producers (the
//! router, the presence notifier) push serialized envelopes through
//! [`Connection::deliver`]; the write loop drains the matching
//! [`OutboundQueue`]. Delivery never waits: when the queue is full the
//! connection is judged unresponsive and evicts itself, so a single slow
//! consumer cannot stall routing for everyone else.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::ConnectionRegistry;
use crate::transport::CloseFrame;
use crate::{metrics, ConnectionId, Envelope, RealtimeError, UserId};

/// Receiving half of a connection's outbound queue, drained by the write loop.
pub type OutboundQueue = mpsc::Receiver<String>;

/// Result of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Envelope queued for the write loop
    Delivered,
    /// Connection was already closed; nothing happened
    Closed,
    /// Queue was full; the connection closed itself and left the registry
    Evicted,
}

impl DeliveryOutcome {
    pub fn is_delivered(self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Why a connection was closed. The first recorded reason wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection for the same user was registered
    Superseded,
    /// Outbound queue overflowed
    Backpressure,
    /// Client closed or the stream ended
    Disconnected,
    /// Keepalive ping went unanswered
    KeepaliveTimeout,
    /// Read or write on the transport failed
    TransportFailure,
    /// Client sent something the transport layer cannot accept
    ProtocolViolation,
    /// Server is shutting down
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Superseded => "superseded",
            Self::Backpressure => "backpressure",
            Self::Disconnected => "disconnected",
            Self::KeepaliveTimeout => "keepalive_timeout",
            Self::TransportFailure => "transport_failure",
            Self::ProtocolViolation => "protocol_violation",
            Self::Shutdown => "shutdown",
        }
    }

    /// Close frame sent to the client for this reason.
    pub fn close_frame(self) -> CloseFrame {
        match self {
            Self::Superseded => CloseFrame::new(4000, "session replaced by a newer login"),
            Self::Backpressure => CloseFrame::new(1008, "outbound queue overflow"),
            Self::Disconnected => CloseFrame::new(1000, "closed"),
            Self::KeepaliveTimeout => CloseFrame::new(1001, "keepalive timeout"),
            Self::TransportFailure => CloseFrame::new(1011, "transport failure"),
            Self::ProtocolViolation => CloseFrame::new(1009, "frame rejected"),
            Self::Shutdown => CloseFrame::new(1001, "server shutting down"),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One authenticated user's live session.
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    connected_at: DateTime<Utc>,
    /// `None` once closed; dropping the sender closes the queue for good.
    queue: Mutex<Option<mpsc::Sender<String>>>,
    shutdown: CancellationToken,
    close_reason: OnceLock<CloseReason>,
    epoch: Instant,
    /// Microseconds since `epoch` of the last pong, plus one. Zero means never.
    last_pong: AtomicU64,
    registry: OnceLock<Weak<ConnectionRegistry>>,
}

impl Connection {
    /// Create a connection for `user_id` with a bounded outbound queue.
    pub fn new(user_id: UserId, capacity: usize) -> (Arc<Self>, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            user_id,
            connected_at: Utc::now(),
            queue: Mutex::new(Some(tx)),
            shutdown: CancellationToken::new(),
            close_reason: OnceLock::new(),
            epoch: Instant::now(),
            last_pong: AtomicU64::new(0),
            registry: OnceLock::new(),
        });
        (connection, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Whether the connection has been closed for any reason.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Reason recorded by the first close, if closed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Encode and enqueue an envelope without blocking.
    ///
    /// Only an encoding failure is an error; every queue condition is reported
    /// through [`DeliveryOutcome`].
    pub fn deliver(&self, envelope: &Envelope) -> Result<DeliveryOutcome, RealtimeError> {
        if self.is_closed() {
            return Ok(DeliveryOutcome::Closed);
        }
        let payload = envelope.encode()?;
        Ok(self.deliver_encoded(payload))
    }

    /// Enqueue an already encoded envelope without blocking.
    pub fn deliver_encoded(&self, payload: String) -> DeliveryOutcome {
        let result = {
            let queue = self.lock_queue();
            match queue.as_ref() {
                Some(sender) => sender.try_send(payload),
                None => return DeliveryOutcome::Closed,
            }
        };

        match result {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(TrySendError::Full(_)) => {
                if !self.close(CloseReason::Backpressure) {
                    return DeliveryOutcome::Closed;
                }
                warn!(
                    user_id = %self.user_id,
                    connection_id = %self.id,
                    "Outbound queue full, evicting connection"
                );
                metrics::record_eviction(CloseReason::Backpressure);
                self.leave_registry();
                DeliveryOutcome::Evicted
            }
            Err(TrySendError::Closed(_)) => {
                // The write loop is gone without having closed us yet.
                self.close(CloseReason::Disconnected);
                DeliveryOutcome::Closed
            }
        }
    }

    /// Close the connection.
    ///
    /// Drops the outbound queue sender and signals both pumps to stop.
    /// Returns `true` for the call that actually closed it.
    pub fn close(&self, reason: CloseReason) -> bool {
        let first = self.close_reason.set(reason).is_ok();
        self.lock_queue().take();
        self.shutdown.cancel();
        if first {
            debug!(
                user_id = %self.user_id,
                connection_id = %self.id,
                reason = %reason,
                "Connection closed"
            );
        }
        first
    }

    /// Note that the client answered a keepalive ping.
    pub(crate) fn record_pong(&self) {
        let micros = self.epoch.elapsed().as_micros() as u64;
        self.last_pong.store(micros + 1, Ordering::Release);
    }

    /// Whether a pong was seen at or after `since`.
    pub(crate) fn pong_since(&self, since: Instant) -> bool {
        match self.last_pong.load(Ordering::Acquire) {
            0 => false,
            stamp => {
                let since = since.saturating_duration_since(self.epoch).as_micros() as u64;
                stamp - 1 >= since
            }
        }
    }

    /// Remember which registry owns this connection so that self-eviction can
    /// remove it.
    pub(crate) fn attach(&self, registry: Weak<ConnectionRegistry>) {
        let _ = self.registry.set(registry);
    }

    fn leave_registry(&self) {
        if let Some(registry) = self.registry.get().and_then(Weak::upgrade) {
            registry.unregister(self);
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, Option<mpsc::Sender<String>>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .field("close_reason", &self.close_reason())
            .finish()
    }
}
