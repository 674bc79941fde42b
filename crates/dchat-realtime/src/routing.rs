//! Inbound envelope dispatch.
//!
//! The router is the only component that talks to the [`MessageStore`]. It
//! runs inline on the sender's read loop, so a slow store round trip only
//! throttles that one sender.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::connection::{Connection, DeliveryOutcome};
use crate::registry::ConnectionRegistry;
use crate::store::MessageStore;
use crate::{metrics, Envelope, EnvelopeKind, FailureNotice, RealtimeError};

/// Failure codes carried in `error` envelopes.
pub mod codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const MESSAGE_SAVE_FAILED: &str = "MESSAGE_SAVE_FAILED";
    pub const MARK_READ_FAILED: &str = "MARK_READ_FAILED";
    pub const RECIPIENT_UNREACHABLE: &str = "RECIPIENT_UNREACHABLE";
}

/// Classifies inbound envelopes and turns them into persistence calls and
/// deliveries.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn MessageStore>,
    failure_notice: FailureNotice,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn MessageStore>,
        failure_notice: FailureNotice,
    ) -> Self {
        Self {
            registry,
            store,
            failure_notice,
        }
    }

    /// Handle one stamped envelope from `origin`.
    ///
    /// Every error returned here is non-terminal: the read loop logs it and
    /// moves on to the next frame.
    #[instrument(
        skip(self, origin, envelope),
        fields(user_id = %origin.user_id(), kind = %envelope.kind())
    )]
    pub async fn route(
        &self,
        origin: &Connection,
        envelope: Envelope,
    ) -> Result<(), RealtimeError> {
        metrics::record_routed(envelope.kind().label());

        match envelope.kind() {
            EnvelopeKind::Chat => self.route_chat(origin, &envelope).await,
            EnvelopeKind::Typing => self.route_typing(origin, &envelope),
            EnvelopeKind::Read => self.route_read(origin, &envelope).await,
            EnvelopeKind::Ping => {
                reply(origin, &Envelope::pong(origin.user_id()));
                Ok(())
            }
            EnvelopeKind::OnlineUsers => {
                let users = self.registry.online_users();
                reply(origin, &Envelope::online_users(origin.user_id(), &users));
                Ok(())
            }
            other => {
                debug!(kind = %other, "Dropping envelope of unsupported kind");
                Err(RealtimeError::unsupported_kind(other.as_str()))
            }
        }
    }

    async fn route_chat(
        &self,
        origin: &Connection,
        envelope: &Envelope,
    ) -> Result<(), RealtimeError> {
        let sender = origin.user_id();
        let recipient = envelope.to();

        if recipient.is_unset() {
            return Err(self.reject(origin, "chat requires a recipient"));
        }

        let record = match self
            .store
            .create_message(sender, recipient, envelope.content(), envelope.encrypted())
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!(to = %recipient, error = %e, "Failed to persist message");
                metrics::record_persistence_failure("create_message");
                self.notify(origin, codes::MESSAGE_SAVE_FAILED, "failed to save message");
                return Err(e.into());
            }
        };
        debug!(message_id = record.id, to = %recipient, "Message persisted");

        if let Some(target) = self.registry.lookup(recipient) {
            if deliver(&target, &Envelope::chat_relay(&record)) == DeliveryOutcome::Evicted {
                self.notify(
                    origin,
                    codes::RECIPIENT_UNREACHABLE,
                    "message saved but the recipient connection was dropped",
                );
            }
        } else {
            debug!(to = %recipient, "Recipient offline, message stored only");
        }

        reply(origin, &Envelope::sent_confirmation(&record));
        Ok(())
    }

    fn route_typing(&self, origin: &Connection, envelope: &Envelope) -> Result<(), RealtimeError> {
        let recipient = envelope.to();
        if recipient.is_unset() {
            return Err(self.reject(origin, "typing requires a recipient"));
        }

        if let Some(target) = self.registry.lookup(recipient) {
            let relay = Envelope::typing(origin.user_id(), recipient, envelope.timestamp());
            deliver(&target, &relay);
        }
        Ok(())
    }

    async fn route_read(
        &self,
        origin: &Connection,
        envelope: &Envelope,
    ) -> Result<(), RealtimeError> {
        let reader = origin.user_id();
        // `to` names the author of the messages being acknowledged.
        let original_sender = envelope.to();
        if original_sender.is_unset() {
            return Err(self.reject(origin, "read requires the original sender"));
        }

        let updated = match self.store.mark_read(original_sender, reader).await {
            Ok(updated) => updated,
            Err(e) => {
                warn!(sender = %original_sender, error = %e, "Failed to mark messages read");
                metrics::record_persistence_failure("mark_read");
                self.notify(origin, codes::MARK_READ_FAILED, "failed to mark messages as read");
                return Err(e.into());
            }
        };
        debug!(sender = %original_sender, updated, "Messages marked read");

        if let Some(target) = self.registry.lookup(original_sender) {
            let receipt = Envelope::read_receipt(reader, original_sender, envelope.timestamp());
            deliver(&target, &receipt);
        }
        Ok(())
    }

    fn reject(&self, origin: &Connection, reason: &str) -> RealtimeError {
        self.notify(origin, codes::INVALID_REQUEST, reason);
        RealtimeError::invalid_envelope(reason)
    }

    fn notify(&self, origin: &Connection, code: &str, message: &str) {
        if self.failure_notice.notifies() {
            reply(origin, &Envelope::failure(origin.user_id(), code, message));
        }
    }
}

/// Best-effort delivery; outcome is logged and returned, never an error.
fn deliver(target: &Connection, envelope: &Envelope) -> DeliveryOutcome {
    match target.deliver(envelope) {
        Ok(outcome) => {
            if !outcome.is_delivered() {
                debug!(
                    to = %target.user_id(),
                    ?outcome,
                    kind = %envelope.kind(),
                    "Envelope not delivered"
                );
            }
            outcome
        }
        Err(e) => {
            warn!(to = %target.user_id(), error = %e, "Failed to encode outbound envelope");
            DeliveryOutcome::Closed
        }
    }
}

fn reply(origin: &Connection, envelope: &Envelope) {
    deliver(origin, envelope);
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("failure_notice", &self.failure_notice)
            .finish_non_exhaustive()
    }
}
