use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use lanyard_core::relay::RelayEvent;
use lanyard_core::{AppState, CoreError, ParticipantFlag};
use lanyard_models::frame::{
    EVENT_HEARTBEAT, EVENT_JOIN, EVENT_LEAVE,
};
use lanyard_models::{Frame, Reply, SignalKind, Topic};
use serde_json::{json, Value};
use tokio::sync::mpsc;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub async fn handle_connection(socket: WebSocket, state: AppState, user_id: i64) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
    state.relay.register_connection(user_id, conn_id, relay_tx);
    tracing::info!(user_id, conn_id, "gateway connection opened");

    let (mut sender, mut receiver) = socket.split();
    let mut joined: HashSet<String> = HashSet::new();

    // Anything addressed to this user while they were briefly offline is
    // delivered first, before new traffic can interleave.
    for event in state.relay.drain_buffered(user_id) {
        if send_relay_event(&mut sender, &event).await.is_err() {
            state.relay.unregister_connection(conn_id);
            return;
        }
    }

    let reason = loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = match serde_json::from_str::<Frame>(text.as_str()) {
                            Ok(frame) => frame,
                            Err(e) => {
                                // Malformed input is the client's problem,
                                // never the connection's.
                                tracing::warn!(user_id, conn_id, error = %e, "malformed frame dropped");
                                continue;
                            }
                        };
                        let was_join = frame.event == EVENT_JOIN;
                        if let Some(reply) = handle_frame(&state, user_id, conn_id, &mut joined, &frame) {
                            if send_frame(&mut sender, &reply).await.is_err() {
                                break "send failed";
                            }
                        }
                        // Only a join that actually subscribed the topic
                        // re-drains; a rejected join delivers nothing.
                        if was_join && joined.contains(&frame.topic) {
                            for event in state.relay.drain_buffered(user_id) {
                                if send_relay_event(&mut sender, &event).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break "client closed",
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(user_id, conn_id, error = %e, "socket receive error");
                        break "receive error";
                    }
                }
            }
            event = relay_rx.recv() => {
                let Some(event) = event else { break "relay closed" };
                if send_relay_event(&mut sender, &event).await.is_err() {
                    break "send failed";
                }
            }
            _ = state.shutdown.notified() => {
                let _ = sender.send(Message::Close(None)).await;
                break "server shutdown";
            }
        }
    };

    state.relay.unregister_connection(conn_id);
    tracing::info!(user_id, conn_id, reason, "gateway connection closed");
}

async fn send_frame(
    sender: &mut (impl SinkExt<Message> + Unpin),
    frame: &Frame,
) -> Result<(), ()> {
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn send_relay_event(
    sender: &mut (impl SinkExt<Message> + Unpin),
    event: &RelayEvent,
) -> Result<(), ()> {
    let frame = Frame::new(event.topic.clone(), event.event.clone(), event.payload.clone());
    send_frame(sender, &frame).await
}

/// One inbound frame, one optional reply. Fan-out happens through the relay
/// as a side effect of the manager calls, never through the return value.
fn handle_frame(
    state: &AppState,
    user_id: i64,
    conn_id: u64,
    joined: &mut HashSet<String>,
    frame: &Frame,
) -> Option<Frame> {
    let topic = match frame.topic.parse::<Topic>() {
        Ok(topic) => topic,
        Err(e) => {
            tracing::debug!(user_id, topic = %frame.topic, "frame for unparseable topic");
            return reply_err(frame, CoreError::from(e));
        }
    };

    if topic == Topic::Phoenix {
        // Liveness only; nothing to route.
        if frame.event == EVENT_HEARTBEAT {
            return Some(Frame::reply_to(frame, &Reply::ok(json!({}))));
        }
        return error_reply(frame, "unknown_event", "phoenix topic only accepts heartbeat");
    }

    match frame.event.as_str() {
        EVENT_JOIN => handle_join(state, user_id, conn_id, joined, frame, &topic),
        EVENT_LEAVE => {
            state.relay.unsubscribe(&frame.topic, conn_id);
            joined.remove(&frame.topic);
            Some(Frame::reply_to(frame, &Reply::ok(json!({}))))
        }
        _ => {
            if !joined.contains(&frame.topic) {
                return error_reply(frame, "not_joined", "push on a channel that was never joined");
            }
            match &topic {
                Topic::Call(call_id) => handle_call_event(state, user_id, call_id, frame),
                Topic::Huddle(huddle_id) => handle_huddle_event(state, user_id, huddle_id, frame),
                // Conversation channels are fan-out only; clients push
                // nothing beyond join/leave.
                Topic::Conversation(_) => {
                    error_reply(frame, "unknown_event", "conversation channels accept no pushes")
                }
                Topic::Phoenix => unreachable!(),
            }
        }
    }
}

/// Channel authorization: call topics are private to the call's
/// participants; huddle and conversation topics are open to any
/// authenticated user. The join reply carries a state snapshot so clients
/// rejoining after a drop can resync without a REST round trip.
fn handle_join(
    state: &AppState,
    user_id: i64,
    conn_id: u64,
    joined: &mut HashSet<String>,
    frame: &Frame,
    topic: &Topic,
) -> Option<Frame> {
    let snapshot = match topic {
        Topic::Call(call_id) => {
            let Some(call) = state.calls.get(call_id) else {
                return reply_err(frame, CoreError::NotFound);
            };
            if !call.is_participant(user_id) {
                return reply_err(frame, CoreError::Forbidden);
            }
            serde_json::to_value(&call).unwrap_or(Value::Null)
        }
        Topic::Huddle(huddle_id) => match state.huddles.get(huddle_id) {
            Some(huddle) => serde_json::to_value(&huddle).unwrap_or(Value::Null),
            None => return reply_err(frame, CoreError::NotFound),
        },
        Topic::Conversation(_) => json!({}),
        Topic::Phoenix => unreachable!(),
    };

    state.relay.subscribe(&frame.topic, conn_id);
    joined.insert(frame.topic.clone());
    tracing::debug!(user_id, conn_id, topic = %frame.topic, "channel joined");
    Some(Frame::reply_to(frame, &Reply::ok(snapshot)))
}

fn handle_call_event(
    state: &AppState,
    user_id: i64,
    call_id: &str,
    frame: &Frame,
) -> Option<Frame> {
    let result = match frame.event.as_str() {
        "answer" => {
            let sdp = frame.payload.get("sdp").cloned().unwrap_or(Value::Null);
            state.calls.answer(call_id, user_id, sdp).map(snapshot_of)
        }
        "reject" => {
            let reason = frame.payload.get("reason").and_then(|v| v.as_str());
            state.calls.reject(call_id, user_id, reason).map(snapshot_of)
        }
        "end" => state.calls.end(call_id, user_id).map(snapshot_of),
        "leave" => state.calls.leave(call_id, user_id).map(snapshot_of),
        "signal" => relay_call_signal(state, user_id, call_id, &frame.payload).map(|()| json!({})),
        "toggle_mute" => toggle_call_flag(state, user_id, call_id, frame, ParticipantFlag::Muted),
        "toggle_video" => toggle_call_flag(state, user_id, call_id, frame, ParticipantFlag::VideoOff),
        "toggle_screen_share" => {
            toggle_call_flag(state, user_id, call_id, frame, ParticipantFlag::ScreenSharing)
        }
        other => {
            tracing::debug!(user_id, call_id, event = other, "unknown call event");
            return error_reply(frame, "unknown_event", "unknown call channel event");
        }
    };
    match result {
        Ok(response) => Some(Frame::reply_to(frame, &Reply::ok(response))),
        Err(e) => reply_err(frame, e),
    }
}

fn toggle_call_flag(
    state: &AppState,
    user_id: i64,
    call_id: &str,
    frame: &Frame,
    flag: ParticipantFlag,
) -> Result<Value, CoreError> {
    let value = frame
        .payload
        .get(flag.key())
        .and_then(|v| v.as_bool())
        .ok_or_else(|| CoreError::BadRequest(format!("boolean `{}` required", flag.key())))?;
    state
        .calls
        .update_participant_flag(call_id, user_id, flag, value)?;
    Ok(json!({}))
}

fn relay_call_signal(
    state: &AppState,
    user_id: i64,
    call_id: &str,
    payload: &Value,
) -> Result<(), CoreError> {
    let to = payload
        .get("to")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| CoreError::BadRequest("numeric `to` required".into()))?;
    let kind = payload
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::BadRequest("string `type` required".into()))?
        .parse::<SignalKind>()?;
    let inner = payload.get("payload").cloned().unwrap_or(Value::Null);
    state.calls.relay_signal(call_id, user_id, to, kind, inner)
}

fn handle_huddle_event(
    state: &AppState,
    user_id: i64,
    huddle_id: &str,
    frame: &Frame,
) -> Option<Frame> {
    let result = match frame.event.as_str() {
        "join" => {
            let metadata = frame.payload.get("metadata").cloned().unwrap_or(Value::Null);
            state.huddles.join(huddle_id, user_id, metadata).map(snapshot_of)
        }
        "leave" => state.huddles.leave(huddle_id, user_id).map(snapshot_of),
        "end" => state.huddles.end(huddle_id, user_id).map(snapshot_of),
        "toggle_mute" => {
            let muted = frame.payload.get("muted").and_then(|v| v.as_bool());
            match muted {
                Some(muted) => state
                    .huddles
                    .toggle_mute(huddle_id, user_id, muted)
                    .map(|()| json!({})),
                None => Err(CoreError::BadRequest("boolean `muted` required".into())),
            }
        }
        "toggle_video" => {
            let video_off = frame.payload.get("video_off").and_then(|v| v.as_bool());
            match video_off {
                Some(video_off) => state
                    .huddles
                    .toggle_video(huddle_id, user_id, video_off)
                    .map(|()| json!({})),
                None => Err(CoreError::BadRequest("boolean `video_off` required".into())),
            }
        }
        other => {
            tracing::debug!(user_id, huddle_id, event = other, "unknown huddle event");
            return error_reply(frame, "unknown_event", "unknown huddle channel event");
        }
    };
    match result {
        Ok(response) => Some(Frame::reply_to(frame, &Reply::ok(response))),
        Err(e) => reply_err(frame, e),
    }
}

fn snapshot_of<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(&value).unwrap_or(Value::Null)
}

fn reply_err(frame: &Frame, e: CoreError) -> Option<Frame> {
    Some(Frame::reply_to(
        frame,
        &Reply::error(json!({ "reason": e.code(), "message": e.to_string() })),
    ))
}

fn error_reply(frame: &Frame, reason: &str, message: &str) -> Option<Frame> {
    Some(Frame::reply_to(
        frame,
        &Reply::error(json!({ "reason": reason, "message": message })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanyard_core::{AppConfig, IceProvider};
    use lanyard_models::{CallType, ReplyStatus};

    fn test_state() -> AppState {
        AppState::new(
            AppConfig {
                jwt_secret: "test-secret".into(),
                push_timeout_ms: 10_000,
                heartbeat_interval_ms: 30_000,
            },
            IceProvider::new(vec!["stun:stun.example.org:3478".into()], vec![], None, 600),
        )
    }

    fn push(topic: &str, event: &str, payload: Value) -> Frame {
        Frame::new(topic, event, payload)
            .with_ref("1")
            .with_join_ref("1")
    }

    fn reply_of(frame: Option<Frame>) -> Reply {
        let frame = frame.expect("expected a reply frame");
        serde_json::from_value(frame.payload).expect("reply payload")
    }

    #[tokio::test]
    async fn heartbeat_gets_ok_reply_with_same_ref() {
        let state = test_state();
        let mut joined = HashSet::new();
        let frame = Frame::new("phoenix", EVENT_HEARTBEAT, Value::Null).with_ref("42");
        let reply = handle_frame(&state, 1, 1, &mut joined, &frame).unwrap();
        assert_eq!(reply.frame_ref.as_deref(), Some("42"));
        assert_eq!(reply_of(Some(reply)).status, ReplyStatus::Ok);
    }

    #[tokio::test]
    async fn joining_a_call_requires_participation() {
        let state = test_state();
        let call = state
            .calls
            .initiate(1, &[2], CallType::Audio, vec![])
            .unwrap();
        let topic = format!("call:{}", call.id);

        let mut joined = HashSet::new();
        let outsider = handle_frame(&state, 99, 1, &mut joined, &push(&topic, EVENT_JOIN, json!({})));
        let reply = reply_of(outsider);
        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.response["reason"], "forbidden");
        // A rejected join must not count as joined; the connection loop keys
        // its post-join buffered-signal drain off this set.
        assert!(!joined.contains(&topic));

        let callee = handle_frame(&state, 2, 2, &mut joined, &push(&topic, EVENT_JOIN, json!({})));
        let reply = reply_of(callee);
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert_eq!(reply.response["id"], call.id);
        assert!(joined.contains(&topic));
    }

    #[tokio::test]
    async fn pushes_before_join_are_rejected() {
        let state = test_state();
        let call = state
            .calls
            .initiate(1, &[2], CallType::Audio, vec![])
            .unwrap();
        let topic = format!("call:{}", call.id);
        let mut joined = HashSet::new();
        let reply = reply_of(handle_frame(
            &state,
            2,
            1,
            &mut joined,
            &push(&topic, "answer", json!({"sdp": "v=0"})),
        ));
        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.response["reason"], "not_joined");
    }

    #[tokio::test]
    async fn answer_over_channel_activates_the_call() {
        let state = test_state();
        let call = state
            .calls
            .initiate(1, &[2], CallType::Audio, vec![])
            .unwrap();
        let topic = format!("call:{}", call.id);
        let mut joined = HashSet::new();
        reply_of(handle_frame(&state, 2, 1, &mut joined, &push(&topic, EVENT_JOIN, json!({}))));
        let reply = reply_of(handle_frame(
            &state,
            2,
            1,
            &mut joined,
            &push(&topic, "answer", json!({"sdp": {"type": "answer"}})),
        ));
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert_eq!(reply.response["status"], "active");
    }

    #[tokio::test]
    async fn signal_with_bad_kind_is_a_typed_error() {
        let state = test_state();
        let call = state
            .calls
            .initiate(1, &[2], CallType::Audio, vec![])
            .unwrap();
        let topic = format!("call:{}", call.id);
        let mut joined = HashSet::new();
        reply_of(handle_frame(&state, 1, 1, &mut joined, &push(&topic, EVENT_JOIN, json!({}))));
        let reply = reply_of(handle_frame(
            &state,
            1,
            1,
            &mut joined,
            &push(&topic, "signal", json!({"to": 2, "type": "renegotiate", "payload": {}})),
        ));
        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.response["reason"], "unknown_value");
    }

    #[tokio::test]
    async fn huddle_join_and_leave_round_trip() {
        let state = test_state();
        let huddle = state.huddles.create(1, "channel-9", None, json!({}));
        let topic = format!("huddle:{}", huddle.id);
        let mut joined = HashSet::new();
        reply_of(handle_frame(&state, 2, 1, &mut joined, &push(&topic, EVENT_JOIN, json!({}))));
        let reply = reply_of(handle_frame(&state, 2, 1, &mut joined, &push(&topic, "join", json!({}))));
        assert_eq!(reply.status, ReplyStatus::Ok);

        let reply = reply_of(handle_frame(&state, 2, 1, &mut joined, &push(&topic, "leave", json!({}))));
        assert_eq!(reply.status, ReplyStatus::Ok);
    }

    #[tokio::test]
    async fn unknown_topic_prefix_is_rejected() {
        let state = test_state();
        let mut joined = HashSet::new();
        let reply = reply_of(handle_frame(
            &state,
            1,
            1,
            &mut joined,
            &push("presence:lobby", EVENT_JOIN, json!({})),
        ));
        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.response["reason"], "unknown_value");
    }

    #[tokio::test]
    async fn leave_unsubscribes_and_later_pushes_fail() {
        let state = test_state();
        let huddle = state.huddles.create(1, "channel-9", None, json!({}));
        let topic = format!("huddle:{}", huddle.id);
        let mut joined = HashSet::new();
        reply_of(handle_frame(&state, 1, 1, &mut joined, &push(&topic, EVENT_JOIN, json!({}))));
        reply_of(handle_frame(&state, 1, 1, &mut joined, &push(&topic, EVENT_LEAVE, json!({}))));
        let reply = reply_of(handle_frame(
            &state,
            1,
            1,
            &mut joined,
            &push(&topic, "toggle_mute", json!({"muted": true})),
        ));
        assert_eq!(reply.response["reason"], "not_joined");
    }
}
