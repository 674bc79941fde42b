//! Hub facade.
//!
//! The [`Hub`] ties the registry, the router and the pumps together. Hosts
//! hand it authenticated transports and query it for presence; everything
//! else happens on the tasks it spawns.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio_util::task::TaskTracker;
use tracing::{info, instrument, warn};

use crate::connection::{CloseReason, Connection};
use crate::pump::{self, PumpContext};
use crate::registry::ConnectionRegistry;
use crate::routing::MessageRouter;
use crate::store::MessageStore;
use crate::transport::Transport;
use crate::{HubConfig, RealtimeError, UserId};

/// Real-time delivery hub. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    config: Arc<HubConfig>,
    tasks: TaskTracker,
}

impl Hub {
    /// Create a hub persisting through `store`.
    pub fn new(store: Arc<dyn MessageStore>, config: HubConfig) -> Result<Self, RealtimeError> {
        config.validate()?;

        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            store,
            config.failure_notice,
        ));

        info!(
            outbound_capacity = config.outbound_capacity,
            keepalive_interval = ?config.keepalive_interval,
            failure_notice = %config.failure_notice,
            "Real-time hub ready"
        );

        Ok(Self {
            registry,
            router,
            config: Arc::new(config),
            tasks: TaskTracker::new(),
        })
    }

    /// Take over an authenticated transport for `user`.
    ///
    /// Registers the new connection (closing any previous one for the same
    /// user) and spawns its read and write loops. Must be called from within
    /// a tokio runtime.
    #[instrument(skip(self, transport), fields(user_id = %user))]
    pub fn accept<T: Transport>(&self, transport: T, user: UserId) -> Arc<Connection> {
        let (connection, outbound) = Connection::new(user, self.config.outbound_capacity);
        info!(connection_id = %connection.id(), "Accepted connection");

        if let Some(previous) = self.registry.register(Arc::clone(&connection)) {
            info!(replaced = %previous.id(), "Previous session superseded");
        }

        pump::spawn(
            &self.tasks,
            transport,
            Arc::clone(&connection),
            outbound,
            PumpContext {
                registry: Arc::clone(&self.registry),
                router: Arc::clone(&self.router),
                config: Arc::clone(&self.config),
            },
        );
        connection
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.registry.is_online(user)
    }

    pub fn online_users(&self) -> BTreeSet<UserId> {
        self.registry.online_users()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn lookup(&self, user: UserId) -> Option<Arc<Connection>> {
        self.registry.lookup(user)
    }

    /// Remove `connection` from the registry (stale calls are no-ops).
    pub fn unregister(&self, connection: &Connection) -> bool {
        self.registry.unregister(connection)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Close every connection and wait for the pumps to finish.
    ///
    /// Pumps get one write timeout to send their close frames before the
    /// wait is abandoned. Returns the number of connections closed.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> usize {
        let closed = self.registry.close_all(CloseReason::Shutdown);
        self.tasks.close();

        let grace = self.config.write_timeout * 2;
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "Connection tasks still running after shutdown grace period"
            );
        }
        self.tasks.reopen();

        info!(closed, "Real-time hub shut down");
        closed
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("connections", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}
