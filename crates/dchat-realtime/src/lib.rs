//! # dchat-realtime
//!
//! Real-time delivery hub for dChat direct messages.
//!
//! This crate owns everything between an authenticated transport socket and the
//! persistence layer: the connection registry, the per-connection pump pair, and
//! the router that turns inbound envelopes into persistence calls, deliveries and
//! presence notifications. It is embedded in `dchat-server`, which supplies the
//! WebSocket transport, the identity check and a [`MessageStore`] implementation.
//!
//! ## Architecture
//!
//! ```text
//!  transport ──► read loop ──► MessageRouter ──► MessageStore
//!                    │               │
//!                    │               ▼
//!                    │      ConnectionRegistry ──► Connection::deliver ──► outbound queue
//!                    ▼                                                         │
//!               unregister ◄────────────────────── write loop ◄────────────────┘
//! ```
//!
//! - **Connection**: one per authenticated user, bounded outbound queue,
//!   non-blocking [`Connection::deliver`] that evicts slow consumers.
//! - **ConnectionRegistry**: at most one live connection per user, presence
//!   fan-out on register/unregister.
//! - **MessageRouter**: `chat`, `typing`, `read`, `ping` and `online_users`
//!   dispatch.
//! - **Hub**: facade that accepts transports and answers status queries.

pub mod config;
pub mod connection;
pub mod envelope;
pub mod hub;
pub mod metrics;
pub mod presence;
pub mod registry;
pub mod routing;
pub mod store;
pub mod transport;

mod error;
mod pump;
mod types;

pub use config::{FailureNotice, HubConfig};
pub use connection::{CloseReason, Connection, DeliveryOutcome, OutboundQueue};
pub use envelope::{Envelope, EnvelopeKind};
pub use error::{RealtimeError, StoreError, TransportError};
pub use hub::Hub;
pub use presence::PresenceEvent;
pub use registry::ConnectionRegistry;
pub use routing::MessageRouter;
pub use store::{InMemoryStore, MessageStore, PersistedMessage};
pub use transport::{CloseFrame, Frame, Transport};
pub use types::{ConnectionId, UserId};
