use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use dchat_realtime::Hub;
use serde_json::json;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

use crate::auth::TokenVerifier;
use crate::db::Database;

mod routes;
mod transport;

const SERVICE_NAME: &str = "dchat-server";

/// Server application state
pub struct AppState {
    /// Real-time delivery hub
    pub hub: Hub,
    /// Message database, checked by the health endpoint
    pub db: Arc<Database>,
    /// Verifies bearer tokens before WebSocket upgrades
    pub verifier: TokenVerifier,
}

impl AppState {
    pub fn new(hub: Hub, db: Arc<Database>, verifier: TokenVerifier) -> Self {
        Self { hub, db, verifier }
    }
}

/// Serve HTTP and WebSocket traffic on `addr` until `shutdown` resolves
pub async fn start(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = create_router(state);

    info!("Starting Axum HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Create the Axum router with all routes and middleware
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .merge(routes::websocket::router())
        .merge(routes::presence::router())
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CompressionLayer::new())
        // TODO: restrict origins once the web client's deployment origin is fixed
        .layer(CorsLayer::permissive())
}

/// Health check endpoint (for load balancers)
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let online_users = state.hub.connection_count();

    match state.db.health_check().await {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "service": SERVICE_NAME,
                "version": env!("CARGO_PKG_VERSION"),
                "online_users": online_users
            })),
        ),
        Ok(false) => {
            warn!("Health check: database unhealthy");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": SERVICE_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                    "online_users": online_users,
                    "error": "database unhealthy"
                })),
            )
        }
        Err(e) => {
            warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": SERVICE_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                    "online_users": online_users,
                    "error": format!("database error: {}", e)
                })),
            )
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::MigrationRunner;
    use crate::messages::MessageRepository;
    use axum::body::Body;
    use axum::http::Request;
    use dchat_realtime::{Frame, HubConfig, TransportError, UserId};
    use futures::channel::mpsc;
    use futures::{Sink, SinkExt, Stream, StreamExt};
    use http_body_util::BodyExt;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tower::ServiceExt;

    pub(crate) const TEST_SECRET: &str = "test-secret-test-secret";

    pub(crate) async fn test_state() -> Arc<AppState> {
        let db = Arc::new(Database::in_memory("test").await.unwrap());
        MigrationRunner::default().run(&db).await.unwrap();

        let store = Arc::new(MessageRepository::new(db.clone()));
        let hub = Hub::new(store, HubConfig::default()).unwrap();
        Arc::new(AppState::new(hub, db, TokenVerifier::new(TEST_SECRET)))
    }

    /// Transport that never sends and accepts everything.
    struct IdleTransport {
        inbound: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
        outbound: mpsc::UnboundedSender<Frame>,
    }

    impl Stream for IdleTransport {
        type Item = Result<Frame, TransportError>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.inbound.poll_next_unpin(cx)
        }
    }

    impl Sink<Frame> for IdleTransport {
        type Error = TransportError;

        fn poll_ready(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            self.outbound.poll_ready_unpin(cx).map_err(TransportError::from_display)
        }

        fn start_send(mut self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
            self.outbound.start_send_unpin(item).map_err(TransportError::from_display)
        }

        fn poll_flush(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            self.outbound.poll_flush_unpin(cx).map_err(TransportError::from_display)
        }

        fn poll_close(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            self.outbound.poll_close_unpin(cx).map_err(TransportError::from_display)
        }
    }

    /// Remote end of an idle connection; dropping it hangs up.
    pub(crate) struct IdlePeer {
        _inbound: mpsc::UnboundedSender<Result<Frame, TransportError>>,
        _outbound: mpsc::UnboundedReceiver<Frame>,
    }

    /// Register `user` on `hub` over a transport nobody talks on.
    pub(crate) fn connect_idle(hub: &Hub, user: u64) -> IdlePeer {
        let (inbound_tx, inbound_rx) = mpsc::unbounded();
        let (outbound_tx, outbound_rx) = mpsc::unbounded();
        hub.accept(
            IdleTransport {
                inbound: inbound_rx,
                outbound: outbound_tx,
            },
            UserId(user),
        );
        IdlePeer {
            _inbound: inbound_tx,
            _outbound: outbound_rx,
        }
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let state = test_state().await;
        let _peer = connect_idle(&state.hub, 1);
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "dchat-server");
        assert_eq!(json["online_users"], 1);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let app = create_router(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
