//! WebSocket endpoint
//!
//! Authenticates the bearer token before upgrading, then hands the socket to
//! the real-time hub, which owns it from there on.

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{request_token, AuthError};
use crate::server::transport::WsTransport;
use crate::server::AppState;

/// Create the WebSocket router
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(websocket_handler))
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    token: Option<String>,
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

/// GET /ws
///
/// Upgrades to a WebSocket once the token (`?token=` or
/// `Authorization: Bearer`) checks out; anything else is a 401.
async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let user = match request_token(params.token.as_deref(), &headers)
        .and_then(|token| state.verifier.verify(&token))
    {
        Ok(user) => user,
        Err(err) => {
            warn!(error = %err, "Rejected WebSocket request");
            return unauthorized(&err).into_response();
        }
    };

    let Some(ws) = ws else {
        debug!(user_id = %user, "Authenticated request without upgrade headers");
        return (
            StatusCode::UPGRADE_REQUIRED,
            Json(ErrorResponse::new("upgrade_required", "WebSocket upgrade required")),
        )
            .into_response();
    };

    info!(user_id = %user, "WebSocket connection request");
    let max_frame_bytes = state.hub.config().max_frame_bytes;
    let hub = state.hub.clone();

    ws.max_message_size(max_frame_bytes)
        .max_frame_size(max_frame_bytes)
        .on_upgrade(move |socket| async move {
            hub.accept(WsTransport::new(socket), user);
        })
}

fn unauthorized(err: &AuthError) -> (StatusCode, Json<ErrorResponse>) {
    let code = match err {
        AuthError::Missing => "missing_token",
        AuthError::Expired => "token_expired",
        AuthError::Malformed(_) | AuthError::BadSignature | AuthError::InvalidKey => {
            "invalid_token"
        }
    };
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::new(code, &err.to_string())),
    )
}
