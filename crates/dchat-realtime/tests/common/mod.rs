//! Test utilities for hub scenarios.
//!
//! Provides an in-memory transport, a client handle that plays the remote
//! end of it, and stores that record or fail every call.

#![allow(dead_code)]

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::timeout;

use dchat_realtime::{
    CloseFrame, Envelope, EnvelopeKind, Frame, Hub, HubConfig, InMemoryStore, MessageStore,
    PersistedMessage, StoreError, TransportError, UserId,
};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Server half of an in-memory duplex channel.
pub struct TestTransport {
    inbound: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    outbound: mpsc::UnboundedSender<Frame>,
    /// When set, the sink never becomes ready (a client that stopped reading).
    stalled: bool,
}

impl Stream for TestTransport {
    type Item = Result<Frame, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.poll_next_unpin(cx)
    }
}

impl Sink<Frame> for TestTransport {
    type Error = TransportError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.stalled {
            return Poll::Pending;
        }
        self.outbound
            .poll_ready_unpin(cx)
            .map_err(TransportError::from_display)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        self.outbound
            .start_send_unpin(item)
            .map_err(TransportError::from_display)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.outbound
            .poll_flush_unpin(cx)
            .map_err(TransportError::from_display)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.outbound
            .poll_close_unpin(cx)
            .map_err(TransportError::from_display)
    }
}

/// Remote end of a [`TestTransport`].
pub struct TestClient {
    tx: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

/// Create a connected transport/client pair.
pub fn transport_pair() -> (TestTransport, TestClient) {
    build_pair(false)
}

/// Create a pair whose server side can never write.
pub fn stalled_transport_pair() -> (TestTransport, TestClient) {
    build_pair(true)
}

fn build_pair(stalled: bool) -> (TestTransport, TestClient) {
    let (client_tx, server_rx) = mpsc::unbounded();
    let (server_tx, client_rx) = mpsc::unbounded();
    (
        TestTransport {
            inbound: server_rx,
            outbound: server_tx,
            stalled,
        },
        TestClient {
            tx: client_tx,
            rx: client_rx,
        },
    )
}

impl TestClient {
    /// Send a raw frame to the server.
    pub fn send_frame(&self, frame: Frame) {
        let _ = self.tx.unbounded_send(Ok(frame));
    }

    /// Send a JSON text frame.
    pub fn send_json(&self, json: &str) {
        self.send_frame(Frame::Text(json.to_string()));
    }

    /// Inject a transport error into the server's read side.
    pub fn fail(&self, message: &str) {
        let _ = self.tx.unbounded_send(Err(TransportError::new(message)));
    }

    /// End the inbound stream, as if the socket dropped.
    pub fn hang_up(&self) {
        self.tx.close_channel();
    }

    /// Next frame from the server, or `None` when the server side is gone.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        timeout(DEFAULT_TIMEOUT, self.rx.next())
            .await
            .expect("Timed out waiting for a frame")
    }

    /// Next envelope from the server, skipping keepalive pings.
    pub async fn next_envelope(&mut self) -> Envelope {
        loop {
            match self.next_frame().await {
                Some(Frame::Text(text)) => return Envelope::decode(&text).expect("valid envelope"),
                Some(Frame::Ping(_)) => continue,
                other => panic!("Expected an envelope, got {other:?}"),
            }
        }
    }

    /// Next envelope of `kind`, skipping everything else.
    pub async fn expect_kind(&mut self, kind: EnvelopeKind) -> Envelope {
        loop {
            let envelope = self.next_envelope().await;
            if envelope.kind() == &kind {
                return envelope;
            }
        }
    }

    /// Read until the server sends a close frame or the channel ends.
    pub async fn expect_closed(&mut self) -> Option<CloseFrame> {
        loop {
            match self.next_frame().await {
                Some(Frame::Close(frame)) => return frame,
                None => return None,
                Some(_) => continue,
            }
        }
    }

    /// Envelopes that arrive within `window`, keepalive pings excluded.
    pub async fn collect_for(&mut self, window: Duration) -> Vec<Envelope> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, self.rx.next()).await {
            if let Frame::Text(text) = frame {
                out.push(Envelope::decode(&text).expect("valid envelope"));
            }
        }
        out
    }
}

/// Call recorded by [`RecordingStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Create {
        sender: UserId,
        recipient: UserId,
        content: String,
        encrypted: bool,
    },
    MarkRead {
        sender: UserId,
        recipient: UserId,
    },
}

/// In-memory store that also records every call.
#[derive(Default)]
pub struct RecordingStore {
    inner: InMemoryStore,
    calls: Mutex<Vec<StoreCall>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<PersistedMessage> {
        self.inner.messages()
    }
}

#[async_trait]
impl MessageStore for RecordingStore {
    async fn create_message(
        &self,
        sender: UserId,
        recipient: UserId,
        content: &str,
        encrypted: bool,
    ) -> Result<PersistedMessage, StoreError> {
        self.calls.lock().unwrap().push(StoreCall::Create {
            sender,
            recipient,
            content: content.to_string(),
            encrypted,
        });
        self.inner
            .create_message(sender, recipient, content, encrypted)
            .await
    }

    async fn mark_read(&self, sender: UserId, recipient: UserId) -> Result<u64, StoreError> {
        self.calls
            .lock()
            .unwrap()
            .push(StoreCall::MarkRead { sender, recipient });
        self.inner.mark_read(sender, recipient).await
    }
}

/// Store whose every operation fails.
pub struct FailingStore;

#[async_trait]
impl MessageStore for FailingStore {
    async fn create_message(
        &self,
        _sender: UserId,
        _recipient: UserId,
        _content: &str,
        _encrypted: bool,
    ) -> Result<PersistedMessage, StoreError> {
        Err(StoreError::Unavailable("database offline".to_string()))
    }

    async fn mark_read(&self, _sender: UserId, _recipient: UserId) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("database offline".to_string()))
    }
}

/// Hub over `store` with short timeouts suited to tests.
pub fn test_hub(store: Arc<dyn MessageStore>, config: HubConfig) -> Hub {
    Hub::new(store, config).expect("valid hub config")
}

/// Accept a fresh client for `user`.
pub fn connect(hub: &Hub, user: u64) -> TestClient {
    let (transport, client) = transport_pair();
    hub.accept(transport, UserId(user));
    client
}

/// Wait until `condition` holds or fail after [`DEFAULT_TIMEOUT`].
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(DEFAULT_TIMEOUT, wait)
        .await
        .expect("Condition not met in time");
}
