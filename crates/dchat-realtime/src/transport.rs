//! Transport abstraction.
//!
//! The hub does not know about WebSockets. A transport is anything that yields
//! inbound [`Frame`]s and accepts outbound ones; `dchat-server` adapts axum's
//! WebSocket to this shape, tests use in-memory channels.

use futures::{Sink, Stream};

use crate::TransportError;

/// Close code and reason sent when the server ends a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// One transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 payload (envelopes travel as text)
    Text(String),
    /// Binary payload; accepted only if it is valid UTF-8
    Binary(Vec<u8>),
    /// Keepalive request
    Ping(Vec<u8>),
    /// Keepalive answer
    Pong(Vec<u8>),
    /// Close handshake
    Close(Option<CloseFrame>),
}

impl Frame {
    /// Frame type name for tracing.
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
            Frame::Ping(_) => "ping",
            Frame::Pong(_) => "pong",
            Frame::Close(_) => "close",
        }
    }
}

/// A duplex, framed connection to one client.
pub trait Transport:
    Stream<Item = Result<Frame, TransportError>>
    + Sink<Frame, Error = TransportError>
    + Send
    + Unpin
    + 'static
{
}

impl<T> Transport for T where
    T: Stream<Item = Result<Frame, TransportError>>
        + Sink<Frame, Error = TransportError>
        + Send
        + Unpin
        + 'static
{
}
