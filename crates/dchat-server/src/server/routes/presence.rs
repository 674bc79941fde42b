//! Online user queries

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::Json,
    routing::get,
    Router,
};
use dchat_realtime::UserId;
use serde::Serialize;

use crate::server::AppState;

/// Create the presence router
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/online", get(online_users_handler))
        .route("/api/v1/online/:user_id", get(user_status_handler))
}

#[derive(Debug, Serialize)]
pub struct OnlineUsersResponse {
    pub users: Vec<UserId>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct UserStatusResponse {
    pub user_id: UserId,
    pub online: bool,
}

/// GET /api/v1/online
async fn online_users_handler(State(state): State<Arc<AppState>>) -> Json<OnlineUsersResponse> {
    let users: Vec<UserId> = state.hub.online_users().into_iter().collect();
    Json(OnlineUsersResponse {
        count: users.len(),
        users,
    })
}

/// GET /api/v1/online/:user_id
async fn user_status_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<u64>,
) -> Json<UserStatusResponse> {
    let user_id = UserId(user_id);
    Json(UserStatusResponse {
        user_id,
        online: state.hub.is_online(user_id),
    })
}
