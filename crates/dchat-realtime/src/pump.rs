//! Per-connection read and write loops.
//!
//! Each accepted transport is split in two halves driven by separate tasks.
//! Whichever loop exits first closes the connection, which wakes the other
//! one; both unregister on the way out; only the first call has any effect.

use std::sync::Arc;

use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, trace, warn};

use crate::connection::{CloseReason, Connection, OutboundQueue};
use crate::registry::ConnectionRegistry;
use crate::routing::MessageRouter;
use crate::transport::{Frame, Transport};
use crate::{metrics, Envelope, HubConfig, RealtimeError, TransportError};

/// Shared pieces every pump needs.
#[derive(Clone)]
pub(crate) struct PumpContext {
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<MessageRouter>,
    pub config: Arc<HubConfig>,
}

/// Split `transport` and start both loops for `connection` on `tasks`.
pub(crate) fn spawn<T: Transport>(
    tasks: &TaskTracker,
    transport: T,
    connection: Arc<Connection>,
    outbound: OutboundQueue,
    ctx: PumpContext,
) {
    let (sink, stream) = transport.split::<Frame>();

    tasks.spawn(run_reader(stream, Arc::clone(&connection), ctx.clone()));
    tasks.spawn(run_writer(sink, outbound, connection, ctx));
}

#[instrument(
    name = "read_loop",
    skip_all,
    fields(user_id = %connection.user_id(), connection_id = %connection.id())
)]
async fn run_reader<S>(stream: S, connection: Arc<Connection>, ctx: PumpContext)
where
    S: Stream<Item = Result<Frame, TransportError>> + Unpin,
{
    let reason = read_loop(stream, &connection, &ctx.router, ctx.config.max_frame_bytes).await;
    let session_secs = (Utc::now() - connection.connected_at()).num_seconds();
    debug!(reason = %reason, session_secs, "Read loop finished");
    ctx.registry.unregister_with_reason(&connection, reason);
    connection.close(reason);
}

#[instrument(
    name = "write_loop",
    skip_all,
    fields(user_id = %connection.user_id(), connection_id = %connection.id())
)]
async fn run_writer<K>(
    mut sink: K,
    mut outbound: OutboundQueue,
    connection: Arc<Connection>,
    ctx: PumpContext,
)
where
    K: Sink<Frame, Error = TransportError> + Unpin,
{
    let reason = write_loop(&mut sink, &mut outbound, &connection, &ctx.config).await;
    debug!(reason = %reason, "Write loop finished");
    ctx.registry.unregister_with_reason(&connection, reason);
    connection.close(reason);

    let reason = connection.close_reason().unwrap_or(reason);
    if reason == CloseReason::KeepaliveTimeout {
        metrics::record_eviction(reason);
    }
    if reason != CloseReason::TransportFailure {
        let frame = Frame::Close(Some(reason.close_frame()));
        if timeout(ctx.config.write_timeout, sink.send(frame)).await.is_err() {
            trace!("Close frame not sent in time");
        }
    }
    let _ = timeout(ctx.config.write_timeout, sink.close()).await;
}

/// Receive frames until the peer goes away, the transport fails, or the
/// connection is closed from elsewhere.
async fn read_loop<S>(
    mut stream: S,
    connection: &Connection,
    router: &MessageRouter,
    max_frame_bytes: usize,
) -> CloseReason
where
    S: Stream<Item = Result<Frame, TransportError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = connection.closed() => {
                return connection.close_reason().unwrap_or(CloseReason::Disconnected);
            }
            next = stream.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(error = %e, "Transport read failed");
                return CloseReason::TransportFailure;
            }
            None => {
                debug!("Transport stream ended");
                return CloseReason::Disconnected;
            }
        };
        trace!(frame = frame.name(), "Frame received");

        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(bytes) => {
                if let Err(e) = check_size(bytes.len(), max_frame_bytes) {
                    warn!(error = %e, "Rejecting oversized frame");
                    return CloseReason::ProtocolViolation;
                }
                match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Binary frame is not UTF-8");
                        return CloseReason::ProtocolViolation;
                    }
                }
            }
            Frame::Pong(_) => {
                connection.record_pong();
                continue;
            }
            Frame::Ping(_) => continue,
            Frame::Close(frame) => {
                debug!(?frame, "Peer closed the connection");
                return CloseReason::Disconnected;
            }
        };

        if let Err(e) = check_size(text.len(), max_frame_bytes) {
            warn!(error = %e, "Rejecting oversized frame");
            return CloseReason::ProtocolViolation;
        }

        let envelope = match Envelope::decode(&text) {
            Ok(envelope) => envelope.stamped(connection.user_id(), Utc::now()),
            Err(e) => {
                debug!(error = %e, "Dropping malformed envelope");
                continue;
            }
        };

        if let Err(e) = router.route(connection, envelope).await {
            debug!(error = %e, "Envelope not routed");
        }
    }
}

/// Drain the outbound queue, pinging the peer whenever the line goes idle.
async fn write_loop<K>(
    sink: &mut K,
    outbound: &mut OutboundQueue,
    connection: &Connection,
    config: &HubConfig,
) -> CloseReason
where
    K: Sink<Frame, Error = TransportError> + Unpin,
{
    let mut deadline = Instant::now() + config.keepalive_interval;
    // Send time of the ping awaiting a pong.
    let mut pending: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;

            _ = connection.closed() => {
                return connection.close_reason().unwrap_or(CloseReason::Disconnected);
            }

            payload = outbound.recv() => {
                let Some(first) = payload else {
                    return connection.close_reason().unwrap_or(CloseReason::Disconnected);
                };
                match write_batch(sink, outbound, first, config).await {
                    Ok(written) => trace!(written, "Flushed outbound batch"),
                    Err(e) => {
                        debug!(error = %e, "Transport write failed");
                        return CloseReason::TransportFailure;
                    }
                }
                if pending.is_none() {
                    deadline = Instant::now() + config.keepalive_interval;
                }
            }

            _ = sleep_until(deadline) => {
                match pending {
                    Some(sent_at) if !connection.pong_since(sent_at) => {
                        warn!("Keepalive ping unanswered");
                        return CloseReason::KeepaliveTimeout;
                    }
                    Some(_) => {
                        pending = None;
                        deadline = Instant::now() + config.keepalive_interval;
                    }
                    None => {
                        let sent_at = Instant::now();
                        let ping = sink.send(Frame::Ping(Vec::new()));
                        let sent = timeout(config.write_timeout, ping).await;
                        if !matches!(sent, Ok(Ok(()))) {
                            debug!("Keepalive ping could not be written");
                            return CloseReason::TransportFailure;
                        }
                        trace!("Keepalive ping sent");
                        pending = Some(sent_at);
                        deadline = sent_at + config.keepalive_timeout;
                    }
                }
            }
        }
    }
}

/// Write `first` plus whatever else is already queued, then flush once.
async fn write_batch<K>(
    sink: &mut K,
    outbound: &mut OutboundQueue,
    first: String,
    config: &HubConfig,
) -> Result<usize, RealtimeError>
where
    K: Sink<Frame, Error = TransportError> + Unpin,
{
    let cycle = async {
        sink.feed(Frame::Text(first)).await?;
        let mut written = 1;
        while written < config.max_batch {
            match outbound.try_recv() {
                Ok(payload) => {
                    sink.feed(Frame::Text(payload)).await?;
                    written += 1;
                }
                Err(_) => break,
            }
        }
        sink.flush().await?;
        Ok::<_, TransportError>(written)
    };

    match timeout(config.write_timeout, cycle).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(RealtimeError::WriteTimeout),
    }
}

fn check_size(size: usize, max: usize) -> Result<(), RealtimeError> {
    if size > max {
        return Err(RealtimeError::FrameTooLarge { size, max });
    }
    Ok(())
}
