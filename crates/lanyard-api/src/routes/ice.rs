use axum::{extract::State, Json};
use lanyard_core::AppState;
use serde_json::{json, Value};

use crate::middleware::AuthUser;

/// Time-limited TURN credentials are minted per request, so clients should
/// fetch this shortly before call setup, not cache it across sessions.
pub async fn ice_servers(State(state): State<AppState>, auth: AuthUser) -> Json<Value> {
    let servers = state.ice.ice_servers(auth.user_id);
    Json(json!({ "ice_servers": servers }))
}
