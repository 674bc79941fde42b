//! Connection Registry implementation.
//!
//! Tracks live connections by user id for routing and presence.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use crate::connection::{CloseReason, Connection};
use crate::presence::PresenceEvent;
use crate::{metrics, UserId};

/// Registry of live connections, one per user.
///
/// Backed by a [`DashMap`], so register, unregister and lookup only contend
/// on the shard holding the user. No method holds a shard lock while
/// delivering to a connection.
///
/// ## Usage
///
/// ```ignore
/// let registry = Arc::new(ConnectionRegistry::new());
///
/// let (conn, outbound) = Connection::new(user_id, 256);
/// registry.register(Arc::clone(&conn));
///
/// if let Some(peer) = registry.lookup(recipient) {
///     peer.deliver(&envelope)?;
/// }
///
/// registry.unregister(&conn);
/// ```
pub struct ConnectionRegistry {
    connections: DashMap<UserId, Arc<Connection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        info!("Creating connection registry");
        Self {
            connections: DashMap::new(),
        }
    }

    /// Install `connection` as the live connection of its user.
    ///
    /// A connection already registered for the same user is closed with
    /// [`CloseReason::Superseded`] and returned. Peers are then told the user
    /// is online; the replaced session does not produce an offline notice.
    #[instrument(
        skip(self, connection),
        fields(user_id = %connection.user_id(), connection_id = %connection.id())
    )]
    pub fn register(self: &Arc<Self>, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        connection.attach(Arc::downgrade(self));
        let user_id = connection.user_id();

        // The old connection is closed before the new one becomes visible,
        // both under the shard lock.
        let mut superseded = false;
        let previous = match self.connections.entry(user_id) {
            Entry::Occupied(mut entry) => {
                let old = Arc::clone(entry.get());
                superseded = old.close(CloseReason::Superseded);
                entry.insert(connection);
                Some(old)
            }
            Entry::Vacant(entry) => {
                entry.insert(connection);
                None
            }
        };
        match &previous {
            Some(old) => {
                debug!(replaced = %old.id(), "Replaced existing connection");
                if superseded {
                    metrics::record_eviction(CloseReason::Superseded);
                }
            }
            None => debug!("Registered new connection"),
        }
        metrics::record_connection_count(self.len());

        self.notify_presence(&PresenceEvent::online(user_id));
        previous
    }

    /// Remove `connection` if it is still the one registered for its user.
    ///
    /// Returns `false` for a stale call (the user has since reconnected, or the
    /// connection was already removed); nothing changes and nobody is told.
    pub fn unregister(&self, connection: &Connection) -> bool {
        self.unregister_with_reason(connection, CloseReason::Disconnected)
    }

    /// Like [`ConnectionRegistry::unregister`], recording `reason` if this
    /// call is the one that closes the connection.
    #[instrument(
        skip(self, connection),
        fields(user_id = %connection.user_id(), connection_id = %connection.id(), reason = %reason)
    )]
    pub fn unregister_with_reason(&self, connection: &Connection, reason: CloseReason) -> bool {
        let removed = self
            .connections
            .remove_if(&connection.user_id(), |_, current| {
                let registered = current.id() == connection.id();
                if registered {
                    connection.close(reason);
                }
                registered
            })
            .is_some();

        if !removed {
            debug!("Connection was not registered");
            return false;
        }

        debug!("Unregistered connection");
        metrics::record_connection_count(self.len());
        self.notify_presence(&PresenceEvent::offline(connection.user_id()));
        true
    }

    /// Live connection of `user`, if any.
    ///
    /// The handle stays safe to deliver to after the connection is evicted;
    /// delivery then reports [`DeliveryOutcome::Closed`](crate::DeliveryOutcome::Closed).
    pub fn lookup(&self, user: UserId) -> Option<Arc<Connection>> {
        self.connections
            .get(&user)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `user` has a registered connection.
    pub fn is_online(&self, user: UserId) -> bool {
        self.connections.contains_key(&user)
    }

    /// Ids of every registered user, sorted.
    pub fn online_users(&self) -> BTreeSet<UserId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Clone every registered connection handle.
    ///
    /// Shard locks are released before this returns.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Close and remove every connection without presence fan-out.
    ///
    /// Used on shutdown; returns how many connections were closed.
    #[instrument(skip(self))]
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let connections = self.snapshot();
        let mut closed = 0;
        for connection in &connections {
            let mut first = false;
            let removed = self
                .connections
                .remove_if(&connection.user_id(), |_, current| {
                    let registered = current.id() == connection.id();
                    if registered {
                        first = connection.close(reason);
                    }
                    registered
                })
                .is_some();
            if !removed {
                first = connection.close(reason);
            }
            if first {
                closed += 1;
            }
        }
        metrics::record_connection_count(self.len());
        info!(closed, reason = %reason, "Closed all connections");
        closed
    }

    /// Deliver a presence change to every connection except its subject.
    ///
    /// The event is encoded once. Connections evicted while receiving it
    /// remove themselves, which may start their own offline fan-out.
    pub fn notify_presence(&self, event: &PresenceEvent) {
        let payload = match event.to_envelope().encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode presence event");
                return;
            }
        };

        let recipients = self.snapshot();
        let mut delivered = 0usize;
        for connection in recipients {
            if connection.user_id() == event.user_id {
                continue;
            }
            if connection.deliver_encoded(payload.clone()).is_delivered() {
                delivered += 1;
            }
        }
        debug!(
            user_id = %event.user_id,
            online = event.online,
            delivered,
            "Presence fan-out complete"
        );
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.len())
            .finish()
    }
}
