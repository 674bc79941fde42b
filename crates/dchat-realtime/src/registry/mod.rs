//! Connection Registry for real-time delivery.
//!
//! Single source of truth for which users are reachable right now. At most
//! one [`crate::Connection`] is registered per user; registering a second one
//! closes the first. Every successful register or unregister fans a presence
//! change out to all other registered connections.
//!
//! ```text
//! read loop (user 1) ──► MessageRouter ──► ConnectionRegistry::lookup(2) ──► Connection(2)::deliver
//!                                                  │
//!                                    DashMap<UserId, Arc<Connection>>
//! ```

mod connection_registry;

pub use connection_registry::ConnectionRegistry;
