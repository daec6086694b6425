use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lanyard_models::frame::{EVENT_CLOSE, EVENT_ERROR, EVENT_JOIN, EVENT_LEAVE, EVENT_REPLY};
use lanyard_models::{Frame, Reply};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

/// Default bound on join/push round trips.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Push attempted while the channel is not joined. Rejected locally, no
    /// frame is sent.
    #[error("channel_not_joined")]
    NotJoined,
    /// The socket's outbound queue is gone; the connection was torn down.
    #[error("socket_disconnected")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Joining,
    Joined,
    Errored,
}

pub type HandlerId = u64;

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

struct Pending {
    tx: oneshot::Sender<Reply>,
}

struct ChannelCore {
    state: ChannelState,
    /// Set once per successful join round trip; stamped on every subsequent
    /// frame so the server can detect pushes from a prior join.
    join_ref: Option<String>,
    join_result: Option<Reply>,
    pending: HashMap<String, Pending>,
    handlers: HashMap<String, Vec<(HandlerId, Handler)>>,
    next_handler_id: HandlerId,
}

/// One subscription to one topic. All waiting happens in the caller's task;
/// the socket's dispatch path only ever takes the lock briefly.
pub struct Channel {
    topic: String,
    wire: mpsc::UnboundedSender<Frame>,
    refs: Arc<AtomicU64>,
    timeout: Duration,
    core: Mutex<ChannelCore>,
    /// Rendezvous for concurrent joins: the leader publishes the outcome,
    /// followers await it without issuing a second wire frame.
    join_watch: watch::Sender<Option<Reply>>,
}

enum JoinRole {
    Done(Reply),
    Follower(watch::Receiver<Option<Reply>>),
    Leader {
        join_ref: String,
        rx: oneshot::Receiver<Reply>,
    },
}

impl Channel {
    pub(crate) fn new(
        topic: impl Into<String>,
        wire: mpsc::UnboundedSender<Frame>,
        refs: Arc<AtomicU64>,
        timeout: Duration,
    ) -> Self {
        let (join_watch, _) = watch::channel(None);
        Self {
            topic: topic.into(),
            wire,
            refs,
            timeout,
            core: Mutex::new(ChannelCore {
                state: ChannelState::Closed,
                join_ref: None,
                join_result: None,
                pending: HashMap::new(),
                handlers: HashMap::new(),
                next_handler_id: 0,
            }),
            join_watch,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    /// Subscribe to a topic. Idempotent while joining/joined: a second call
    /// issues no wire frame and resolves to the same outcome as the first.
    pub async fn join(&self, payload: Value) -> Result<Reply, ChannelError> {
        let role = {
            let mut core = self.lock();
            match core.state {
                ChannelState::Joined => {
                    let reply = core
                        .join_result
                        .clone()
                        .unwrap_or_else(|| Reply::ok(Value::Null));
                    JoinRole::Done(reply)
                }
                ChannelState::Joining => JoinRole::Follower(self.join_watch.subscribe()),
                ChannelState::Closed | ChannelState::Errored => {
                    core.state = ChannelState::Joining;
                    let join_ref = self.next_ref();
                    core.join_ref = Some(join_ref.clone());
                    core.join_result = None;
                    self.join_watch.send_replace(None);
                    let (tx, rx) = oneshot::channel();
                    core.pending.insert(join_ref.clone(), Pending { tx });
                    JoinRole::Leader { join_ref, rx }
                }
            }
        };

        match role {
            JoinRole::Done(reply) => Ok(reply),
            JoinRole::Follower(mut rx) => loop {
                if let Some(reply) = rx.borrow().clone() {
                    return Ok(reply);
                }
                if rx.changed().await.is_err() {
                    return Ok(Reply::timeout());
                }
            },
            JoinRole::Leader { join_ref, rx } => {
                let frame = Frame::new(&self.topic, EVENT_JOIN, payload)
                    .with_ref(&join_ref)
                    .with_join_ref(&join_ref);
                if self.wire.send(frame).is_err() {
                    self.finish_join(Reply::timeout(), ChannelState::Errored, &join_ref);
                    return Err(ChannelError::Disconnected);
                }
                let reply = match tokio::time::timeout(self.timeout, rx).await {
                    Ok(Ok(reply)) => reply,
                    // Sender dropped without a reply: the channel was torn
                    // down while the join was in flight.
                    Ok(Err(_)) => Reply::timeout(),
                    Err(_) => Reply::timeout(),
                };
                let next_state = if reply.is_ok() {
                    ChannelState::Joined
                } else {
                    ChannelState::Errored
                };
                self.finish_join(reply.clone(), next_state, &join_ref);
                Ok(reply)
            }
        }
    }

    fn finish_join(&self, reply: Reply, next_state: ChannelState, join_ref: &str) {
        {
            let mut core = self.lock();
            // A forced close may have won the race; never resurrect it.
            if core.state == ChannelState::Joining {
                core.state = next_state;
            }
            core.pending.remove(join_ref);
            core.join_result = Some(reply.clone());
        }
        let _ = self.join_watch.send(Some(reply));
    }

    /// Ref-correlated request. Resolves with the matching reply or a
    /// synthetic timeout reply; valid only while joined.
    pub async fn push(&self, event: &str, payload: Value) -> Result<Reply, ChannelError> {
        let (frame_ref, join_ref, rx) = {
            let mut core = self.lock();
            if core.state != ChannelState::Joined {
                return Err(ChannelError::NotJoined);
            }
            let frame_ref = self.next_ref();
            let (tx, rx) = oneshot::channel();
            core.pending.insert(frame_ref.clone(), Pending { tx });
            (frame_ref, core.join_ref.clone(), rx)
        };

        let mut frame = Frame::new(&self.topic, event, payload).with_ref(&frame_ref);
        frame.join_ref = join_ref;
        if self.wire.send(frame).is_err() {
            self.lock().pending.remove(&frame_ref);
            return Err(ChannelError::Disconnected);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Ok(Reply::timeout()),
            Err(_) => {
                // Remove the correlation so a late reply is dropped rather
                // than resolving a waiter that no longer exists.
                self.lock().pending.remove(&frame_ref);
                Ok(Reply::timeout())
            }
        }
    }

    /// Fire-and-forget push. Dropped silently when not joined; callers that
    /// need durability layer acks on top.
    pub fn push_no_reply(&self, event: &str, payload: Value) {
        let join_ref = {
            let core = self.lock();
            if core.state != ChannelState::Joined {
                tracing::debug!(topic = %self.topic, event, "dropping push on unjoined channel");
                return;
            }
            core.join_ref.clone()
        };
        let mut frame = Frame::new(&self.topic, event, payload);
        frame.join_ref = join_ref;
        let _ = self.wire.send(frame);
    }

    /// Register a handler for an application event. Multiple handlers per
    /// event are invoked in registration order.
    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut core = self.lock();
        let id = core.next_handler_id;
        core.next_handler_id += 1;
        core.handlers
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one handler, or every handler for the event when `id` is None.
    pub fn off(&self, event: &str, id: Option<HandlerId>) {
        let mut core = self.lock();
        match id {
            None => {
                core.handlers.remove(event);
            }
            Some(id) => {
                if let Some(list) = core.handlers.get_mut(event) {
                    list.retain(|(hid, _)| *hid != id);
                    if list.is_empty() {
                        core.handlers.remove(event);
                    }
                }
            }
        }
    }

    /// Send a best-effort leave frame, then clean up locally right away so
    /// the caller can free resources synchronously.
    pub fn leave(&self) {
        let join_ref = self.lock().join_ref.clone();
        let mut frame = Frame::new(&self.topic, EVENT_LEAVE, Value::Null).with_ref(self.next_ref());
        frame.join_ref = join_ref;
        let _ = self.wire.send(frame);
        self.force_close();
    }

    /// Transition to closed, resolving every pending correlation with a
    /// terminal status and clearing the handler table. Invoked on leave and
    /// on transport close.
    pub(crate) fn force_close(&self) {
        let pending = {
            let mut core = self.lock();
            core.state = ChannelState::Closed;
            core.join_ref = None;
            core.handlers.clear();
            std::mem::take(&mut core.pending)
        };
        for (_, p) in pending {
            let _ = p.tx.send(Reply::timeout());
        }
        let _ = self.join_watch.send(Some(Reply::timeout()));
    }

    /// Inbound frame for this channel's topic, in transport order.
    pub(crate) fn handle_frame(&self, frame: Frame) {
        match frame.event.as_str() {
            EVENT_REPLY => self.handle_reply(frame),
            EVENT_ERROR => {
                tracing::debug!(topic = %self.topic, "channel errored by server");
                let pending = {
                    let mut core = self.lock();
                    core.state = ChannelState::Errored;
                    std::mem::take(&mut core.pending)
                };
                for (_, p) in pending {
                    let _ = p.tx.send(Reply::timeout());
                }
            }
            EVENT_CLOSE => self.force_close(),
            _ => self.dispatch(&frame),
        }
    }

    fn handle_reply(&self, frame: Frame) {
        let Some(frame_ref) = frame.frame_ref.clone() else {
            tracing::debug!(topic = %self.topic, "reply frame without ref dropped");
            return;
        };
        let pending = {
            let mut core = self.lock();
            // A reply stamped with a prior join's ref belongs to a dead
            // subscription instance.
            if frame.join_ref.is_some() && frame.join_ref != core.join_ref {
                tracing::debug!(topic = %self.topic, "stale join_ref reply dropped");
                return;
            }
            core.pending.remove(&frame_ref)
        };
        match pending {
            Some(p) => {
                let reply: Reply = serde_json::from_value(frame.payload)
                    .unwrap_or_else(|_| Reply::error(Value::Null));
                let _ = p.tx.send(reply);
            }
            // Already timed out, or a superseded join. Not an error.
            None => {
                tracing::debug!(topic = %self.topic, frame_ref, "reply for unknown ref dropped")
            }
        }
    }

    fn dispatch(&self, frame: &Frame) {
        {
            let core = self.lock();
            if frame.join_ref.is_some() && frame.join_ref != core.join_ref {
                tracing::debug!(topic = %self.topic, event = %frame.event, "stale join_ref frame dropped");
                return;
            }
        }
        let handlers: Vec<Handler> = {
            let core = self.lock();
            core.handlers
                .get(&frame.event)
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            // A panicking handler must not break dispatch for its siblings
            // or for subsequent frames.
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&frame.payload))) {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                tracing::error!(topic = %self.topic, event = %frame.event, panic = %msg, "event handler panicked");
            }
        }
    }

    fn next_ref(&self) -> String {
        self.refs.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }
}
