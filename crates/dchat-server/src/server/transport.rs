//! Adapter from axum's WebSocket to the hub's frame transport

use std::borrow::Cow;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::ws::{self, Message, WebSocket};
use dchat_realtime::{CloseFrame, Frame, TransportError};
use futures::{Sink, SinkExt, Stream, StreamExt};

/// An upgraded WebSocket speaking [`Frame`]s.
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl Stream for WsTransport {
    type Item = Result<Frame, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.socket.poll_next_unpin(cx).map(|item| {
            item.map(|result| result.map(into_frame).map_err(TransportError::from_display))
        })
    }
}

impl Sink<Frame> for WsTransport {
    type Error = TransportError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.socket
            .poll_ready_unpin(cx)
            .map_err(TransportError::from_display)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        self.socket
            .start_send_unpin(into_message(item))
            .map_err(TransportError::from_display)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.socket
            .poll_flush_unpin(cx)
            .map_err(TransportError::from_display)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.socket
            .poll_close_unpin(cx)
            .map_err(TransportError::from_display)
    }
}

fn into_frame(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text),
        Message::Binary(bytes) => Frame::Binary(bytes),
        Message::Ping(payload) => Frame::Ping(payload),
        Message::Pong(payload) => Frame::Pong(payload),
        Message::Close(close) => {
            Frame::Close(close.map(|c| CloseFrame::new(c.code, c.reason.into_owned())))
        }
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(bytes) => Message::Binary(bytes),
        Frame::Ping(payload) => Message::Ping(payload),
        Frame::Pong(payload) => Message::Pong(payload),
        Frame::Close(close) => Message::Close(close.map(|c| ws::CloseFrame {
            code: c.code,
            reason: Cow::Owned(c.reason),
        })),
    }
}
