use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use lanyard_core::{auth, AppConfig, AppState, IceProvider};
use serde_json::{json, Value};
use tower::ServiceExt;

const JWT_SECRET: &str = "huddle-routes-test-secret";

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
            IceProvider::new(vec!["stun:stun.example.org:3478".into()], vec![], None, 600),
        );
        let app = lanyard_api::build_router().with_state(state);
        Self { app }
    }

    async fn request_json(
        &self,
        method: Method,
        path: &str,
        user_id: i64,
        body: Option<Value>,
    ) -> anyhow::Result<(StatusCode, Value)> {
        let token = auth::create_token(user_id, JWT_SECRET, 3600)?;
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {token}"));

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

    async fn create_huddle(&self, initiator: i64, channel: &str) -> anyhow::Result<String> {
        let (status, huddle) = self
            .request_json(
                Method::POST,
                "/api/v1/huddles",
                initiator,
                Some(json!({ "channel_id": channel })),
            )
            .await?;
        anyhow::ensure!(status == StatusCode::CREATED, "create failed: {status}");
        Ok(huddle["id"].as_str().expect("huddle id").to_string())
    }
}

#[tokio::test]
async fn create_join_leave_lifecycle() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    let huddle_id = ctx.create_huddle(1, "channel-42").await?;

    let (status, joined) = ctx
        .request_json(
            Method::POST,
            &format!("/api/v1/huddles/{huddle_id}/join"),
            2,
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(joined["participants"].as_object().map(|m| m.len()), Some(2));

    let (status, after_leave) = ctx
        .request_json(
            Method::POST,
            &format!("/api/v1/huddles/{huddle_id}/leave"),
            2,
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(after_leave["status"], "active");
    Ok(())
}

#[tokio::test]
async fn join_metadata_lands_on_the_participant_record() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    let huddle_id = ctx.create_huddle(1, "channel-42").await?;

    let (status, joined) = ctx
        .request_json(
            Method::POST,
            &format!("/api/v1/huddles/{huddle_id}/join"),
            2,
            Some(json!({ "metadata": { "device": "mobile" } })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(joined["participants"]["2"]["metadata"]["device"], "mobile");
    Ok(())
}

#[tokio::test]
async fn last_leave_ends_the_huddle() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    let huddle_id = ctx.create_huddle(1, "channel-42").await?;

    let (status, ended) = ctx
        .request_json(
            Method::POST,
            &format!("/api/v1/huddles/{huddle_id}/leave"),
            1,
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ended["status"], "ended");

    // The channel listing only shows live huddles.
    let (_, list) = ctx
        .request_json(Method::GET, "/api/v1/channels/channel-42/huddles", 1, None)
        .await?;
    assert_eq!(list.as_array().map(Vec::len), Some(0));
    Ok(())
}

#[tokio::test]
async fn joining_an_ended_huddle_is_a_conflict() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    let huddle_id = ctx.create_huddle(1, "channel-42").await?;
    ctx.request_json(
        Method::POST,
        &format!("/api/v1/huddles/{huddle_id}/end"),
        1,
        None,
    )
    .await?;

    let (status, body) = ctx
        .request_json(
            Method::POST,
            &format!("/api/v1/huddles/{huddle_id}/join"),
            2,
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "huddle_ended");
    Ok(())
}

#[tokio::test]
async fn only_the_initiator_may_end() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    let huddle_id = ctx.create_huddle(1, "channel-42").await?;
    ctx.request_json(
        Method::POST,
        &format!("/api/v1/huddles/{huddle_id}/join"),
        2,
        None,
    )
    .await?;

    let (status, body) = ctx
        .request_json(
            Method::POST,
            &format!("/api/v1/huddles/{huddle_id}/end"),
            2,
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");
    Ok(())
}

#[tokio::test]
async fn mute_toggle_returns_no_content() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    let huddle_id = ctx.create_huddle(1, "channel-42").await?;

    let (status, _) = ctx
        .request_json(
            Method::PATCH,
            &format!("/api/v1/huddles/{huddle_id}/mute"),
            1,
            Some(json!({ "muted": true })),
        )
        .await?;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, huddle) = ctx
        .request_json(Method::GET, &format!("/api/v1/huddles/{huddle_id}"), 1, None)
        .await?;
    assert_eq!(huddle["participants"]["1"]["is_muted"], true);
    Ok(())
}

#[tokio::test]
async fn force_leave_clears_every_membership() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    let own = ctx.create_huddle(1, "channel-a").await?;
    let other = ctx.create_huddle(2, "channel-b").await?;
    ctx.request_json(
        Method::POST,
        &format!("/api/v1/huddles/{other}/join"),
        1,
        None,
    )
    .await?;

    let (status, _) = ctx
        .request_json(Method::POST, "/api/v1/huddles/force-leave", 1, None)
        .await?;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Solo-initiated huddle ends, the other keeps running without user 1.
    let (_, own_state) = ctx
        .request_json(Method::GET, &format!("/api/v1/huddles/{own}"), 1, None)
        .await?;
    assert_eq!(own_state["status"], "ended");
    let (_, other_state) = ctx
        .request_json(Method::GET, &format!("/api/v1/huddles/{other}"), 2, None)
        .await?;
    assert_eq!(other_state["status"], "active");
    Ok(())
}
