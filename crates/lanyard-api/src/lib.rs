use axum::{
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use lanyard_core::AppState;
use serde_json::json;

pub mod error;
pub mod middleware;
pub mod routes;

pub fn build_router() -> Router<AppState> {
    let cors = build_cors_layer();
    Router::new()
        // Health
        .route("/health", get(health))
        .route("/api/v1/health", get(health))
        // Calls
        .route("/api/v1/calls", post(routes::calls::initiate))
        .route("/api/v1/calls/active", get(routes::calls::active))
        .route("/api/v1/calls/history", get(routes::calls::history))
        .route("/api/v1/calls/{call_id}", get(routes::calls::get_call))
        .route("/api/v1/calls/{call_id}/answer", post(routes::calls::answer))
        .route("/api/v1/calls/{call_id}/reject", post(routes::calls::reject))
        .route("/api/v1/calls/{call_id}/end", post(routes::calls::end))
        // Huddles
        .route("/api/v1/huddles", post(routes::huddles::create))
        .route(
            "/api/v1/huddles/force-leave",
            post(routes::huddles::force_leave),
        )
        .route("/api/v1/huddles/{huddle_id}", get(routes::huddles::get_huddle))
        .route("/api/v1/huddles/{huddle_id}/join", post(routes::huddles::join))
        .route("/api/v1/huddles/{huddle_id}/leave", post(routes::huddles::leave))
        .route("/api/v1/huddles/{huddle_id}/end", post(routes::huddles::end))
        .route("/api/v1/huddles/{huddle_id}/mute", patch(routes::huddles::mute))
        .route("/api/v1/huddles/{huddle_id}/video", patch(routes::huddles::video))
        .route(
            "/api/v1/channels/{channel_id}/huddles",
            get(routes::huddles::list_for_channel),
        )
        // ICE
        .route("/api/v1/ice-servers", get(routes::ice::ice_servers))
        .layer(cors)
}

fn build_cors_layer() -> tower_http::cors::CorsLayer {
    // Desktop and mobile clients connect from app-scheme origins, so origin
    // restrictions buy nothing here.
    tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}

async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": "lanyard" })),
    )
}
