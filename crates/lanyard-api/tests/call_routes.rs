use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use lanyard_core::{auth, AppConfig, AppState, IceProvider};
use serde_json::{json, Value};
use tower::ServiceExt;

const JWT_SECRET: &str = "call-routes-test-secret";

struct TestContext {
    app: Router,
}

impl TestContext {
    fn new() -> Self {
        let state = AppState::new(
            AppConfig {
                jwt_secret: JWT_SECRET.into(),
                push_timeout_ms: 10_000,
                heartbeat_interval_ms: 30_000,
            },
            IceProvider::new(
                vec!["stun:stun.example.org:3478".into()],
                vec!["turn:turn.example.org:3478".into()],
                Some("turn-test-secret".into()),
                600,
            ),
        );
        let app = lanyard_api::build_router().with_state(state);
        Self { app }
    }

    fn token_for(&self, user_id: i64) -> String {
        auth::create_token(user_id, JWT_SECRET, 3600).expect("mint test token")
    }

    async fn request_json(
        &self,
        method: Method,
        path: &str,
        user_id: i64,
        body: Option<Value>,
    ) -> anyhow::Result<(StatusCode, Value)> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.token_for(user_id)),
            );

        let request = if let Some(payload) = body {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            builder.body(Body::from(payload.to_string()))?
        } else {
            builder.body(Body::empty())?
        };

        let response = self.app.clone().oneshot(request).await?;
        let status = response.status();
        let body_bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let payload = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes)
                .unwrap_or_else(|_| json!({ "raw": String::from_utf8_lossy(&body_bytes) }))
        };

        Ok((status, payload))
    }
}

#[tokio::test]
async fn initiate_answer_end_lifecycle() -> anyhow::Result<()> {
    let ctx = TestContext::new();

    let (status, call) = ctx
        .request_json(
            Method::POST,
            "/api/v1/calls",
            1,
            Some(json!({ "callee_ids": [2], "type": "audio" })),
        )
        .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(call["status"], "ringing");
    assert_eq!(call["initiator_id"], 1);
    let call_id = call["id"].as_str().expect("call id").to_string();

    let (status, answered) = ctx
        .request_json(
            Method::POST,
            &format!("/api/v1/calls/{call_id}/answer"),
            2,
            Some(json!({ "sdp": { "type": "answer", "sdp": "v=0" } })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(answered["status"], "active");
    assert!(answered["answered_at"].is_string());

    let (status, ended) = ctx
        .request_json(
            Method::POST,
            &format!("/api/v1/calls/{call_id}/end"),
            1,
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ended["status"], "ended");
    assert_eq!(ended["end_reason"], "completed");
    Ok(())
}

#[tokio::test]
async fn initiating_while_busy_is_a_conflict() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    let (status, _) = ctx
        .request_json(
            Method::POST,
            "/api/v1/calls",
            1,
            Some(json!({ "callee_ids": [2], "type": "audio" })),
        )
        .await?;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = ctx
        .request_json(
            Method::POST,
            "/api/v1/calls",
            1,
            Some(json!({ "callee_ids": [3], "type": "audio" })),
        )
        .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "already_in_call");
    Ok(())
}

#[tokio::test]
async fn unknown_call_type_is_a_bad_request() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    let (status, body) = ctx
        .request_json(
            Method::POST,
            "/api/v1/calls",
            1,
            Some(json!({ "callee_ids": [2], "type": "hologram" })),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unknown_value");
    Ok(())
}

#[tokio::test]
async fn call_records_are_private_to_participants() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    let (_, call) = ctx
        .request_json(
            Method::POST,
            "/api/v1/calls",
            1,
            Some(json!({ "callee_ids": [2], "type": "video" })),
        )
        .await?;
    let call_id = call["id"].as_str().expect("call id");

    let (status, _) = ctx
        .request_json(Method::GET, &format!("/api/v1/calls/{call_id}"), 2, None)
        .await?;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = ctx
        .request_json(Method::GET, &format!("/api/v1/calls/{call_id}"), 99, None)
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");
    Ok(())
}

#[tokio::test]
async fn active_endpoint_tracks_the_callers_call() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    let (status, body) = ctx
        .request_json(Method::GET, "/api/v1/calls/active", 1, None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_null());

    let (_, call) = ctx
        .request_json(
            Method::POST,
            "/api/v1/calls",
            1,
            Some(json!({ "callee_ids": [2], "type": "audio" })),
        )
        .await?;

    let (_, active) = ctx
        .request_json(Method::GET, "/api/v1/calls/active", 1, None)
        .await?;
    assert_eq!(active["id"], call["id"]);
    Ok(())
}

#[tokio::test]
async fn declined_calls_land_in_history() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    let (_, call) = ctx
        .request_json(
            Method::POST,
            "/api/v1/calls",
            1,
            Some(json!({ "callee_ids": [2], "type": "audio" })),
        )
        .await?;
    let call_id = call["id"].as_str().expect("call id");

    let (status, rejected) = ctx
        .request_json(
            Method::POST,
            &format!("/api/v1/calls/{call_id}/reject"),
            2,
            Some(json!({ "reason": "busy" })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rejected["status"], "declined");
    assert_eq!(rejected["duration_seconds"], 0);

    let (status, history) = ctx
        .request_json(Method::GET, "/api/v1/calls/history?limit=10", 1, None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().map(Vec::len), Some(1));
    assert_eq!(history[0]["id"].as_str(), Some(call_id));
    Ok(())
}

#[tokio::test]
async fn requests_without_a_token_are_unauthorized() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    let request = Request::builder()
        .method(Method::GET)
        .uri("/api/v1/calls/active")
        .body(Body::empty())?;
    let response = ctx.app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn ice_servers_carry_fresh_turn_credentials() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    let (status, body) = ctx
        .request_json(Method::GET, "/api/v1/ice-servers", 7, None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    let servers = body["ice_servers"].as_array().expect("server list");
    assert_eq!(servers.len(), 2);
    assert!(servers[0]["username"].is_null());
    let username = servers[1]["username"].as_str().expect("turn username");
    assert!(username.ends_with(":7"));
    assert!(servers[1]["credential"].is_string());
    Ok(())
}
