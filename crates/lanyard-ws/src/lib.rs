mod handler;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use lanyard_core::{auth, AppState};
use serde::Deserialize;

pub fn gateway_router() -> Router<AppState> {
    Router::new().route("/socket", get(ws_upgrade))
}

#[derive(Deserialize)]
struct SocketParams {
    token: Option<String>,
}

/// The credential rides a query parameter because browser WebSocket clients
/// cannot set request headers. Authentication happens before the upgrade so
/// bad tokens never hold a socket open.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<SocketParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let Some(token) = params.token else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let claims = match auth::validate_token(&token, &state.config.jwt_secret) {
        Ok(claims) => claims,
        Err(_) => {
            tracing::debug!("socket upgrade rejected: invalid token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };
    ws.on_upgrade(move |socket| handler::handle_connection(socket, state, claims.sub))
        .into_response()
}
