use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

/// How long an undelivered user-addressed signal is kept before it is
/// dropped. Calls and huddles are inherently real-time; a signal this stale
/// must not resurrect a dead negotiation.
pub const BUFFER_TTL: Duration = Duration::from_secs(300);

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const MAX_BUFFERED_PER_USER: usize = 64;

/// One event on its way to a subscriber's live connection.
#[derive(Debug, Clone)]
pub struct RelayEvent {
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

pub type RelaySender = mpsc::UnboundedSender<RelayEvent>;

/// Server-side fan-out seam. Managers publish through this trait so a
/// single-process map and a clustered pub/sub backend stay interchangeable.
pub trait SignalRelay: Send + Sync {
    /// Register a live connection for a user. Must be called before any
    /// `subscribe` for that connection.
    fn register_connection(&self, user_id: i64, conn_id: u64, tx: RelaySender);

    /// Drop a connection and every subscription it holds.
    fn unregister_connection(&self, conn_id: u64);

    fn subscribe(&self, topic: &str, conn_id: u64);

    fn unsubscribe(&self, topic: &str, conn_id: u64);

    /// Broadcast to every current subscriber of `topic`.
    fn publish(&self, topic: &str, event: &str, payload: Value);

    /// Deliver to every live connection of `user_id`; buffered with a TTL
    /// when the user is briefly disconnected.
    fn publish_to_user(&self, user_id: i64, topic: &str, event: &str, payload: Value);

    /// Take everything buffered for a user while they were away. Expired
    /// entries are discarded, not returned.
    fn drain_buffered(&self, user_id: i64) -> Vec<RelayEvent>;
}

struct BufferedSignal {
    event: RelayEvent,
    expires_at: DateTime<Utc>,
}

struct Connection {
    user_id: i64,
    tx: RelaySender,
}

/// In-process relay: topic -> connection set, user -> connection set, plus
/// the short-TTL buffer for user-addressed signals.
pub struct InMemoryRelay {
    connections: DashMap<u64, Connection>,
    topics: DashMap<String, Vec<u64>>,
    user_conns: DashMap<i64, Vec<u64>>,
    buffered: DashMap<i64, VecDeque<BufferedSignal>>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            topics: DashMap::new(),
            user_conns: DashMap::new(),
            buffered: DashMap::new(),
        }
    }

    /// Periodically drop expired buffered signals so users who never return
    /// do not leak memory.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await; // skip immediate first tick
            loop {
                interval.tick().await;
                relay.sweep_expired(Utc::now());
            }
        });
    }

    fn sweep_expired(&self, now: DateTime<Utc>) {
        let users: Vec<i64> = self.buffered.iter().map(|r| *r.key()).collect();
        for user_id in users {
            self.buffered.remove_if_mut(&user_id, |_, queue| {
                queue.retain(|s| s.expires_at > now);
                queue.is_empty()
            });
        }
    }

    fn send_to_conn(&self, conn_id: u64, event: &RelayEvent) {
        if let Some(conn) = self.connections.get(&conn_id) {
            // A closed receiver just means the connection is tearing down;
            // unregister_connection will clean up shortly.
            let _ = conn.tx.send(event.clone());
        }
    }

    #[cfg(test)]
    fn buffered_count(&self, user_id: i64) -> usize {
        self.buffered.get(&user_id).map(|q| q.len()).unwrap_or(0)
    }
}

impl Default for InMemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalRelay for InMemoryRelay {
    fn register_connection(&self, user_id: i64, conn_id: u64, tx: RelaySender) {
        self.connections.insert(conn_id, Connection { user_id, tx });
        self.user_conns.entry(user_id).or_default().push(conn_id);
    }

    fn unregister_connection(&self, conn_id: u64) {
        let Some((_, conn)) = self.connections.remove(&conn_id) else {
            return;
        };
        self.user_conns.remove_if_mut(&conn.user_id, |_, conns| {
            conns.retain(|&c| c != conn_id);
            conns.is_empty()
        });
        let topics: Vec<String> = self
            .topics
            .iter()
            .filter(|r| r.value().contains(&conn_id))
            .map(|r| r.key().clone())
            .collect();
        for topic in topics {
            self.unsubscribe(&topic, conn_id);
        }
    }

    fn subscribe(&self, topic: &str, conn_id: u64) {
        let mut subs = self.topics.entry(topic.to_string()).or_default();
        if !subs.contains(&conn_id) {
            subs.push(conn_id);
        }
    }

    fn unsubscribe(&self, topic: &str, conn_id: u64) {
        self.topics.remove_if_mut(topic, |_, subs| {
            subs.retain(|&c| c != conn_id);
            subs.is_empty()
        });
    }

    fn publish(&self, topic: &str, event: &str, payload: Value) {
        let subscribers: Vec<u64> = self
            .topics
            .get(topic)
            .map(|subs| subs.clone())
            .unwrap_or_default();
        if subscribers.is_empty() {
            return;
        }
        let event = RelayEvent {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        };
        for conn_id in subscribers {
            self.send_to_conn(conn_id, &event);
        }
    }

    fn publish_to_user(&self, user_id: i64, topic: &str, event: &str, payload: Value) {
        let event = RelayEvent {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        };
        let conns: Vec<u64> = self
            .user_conns
            .get(&user_id)
            .map(|c| c.clone())
            .unwrap_or_default();
        if !conns.is_empty() {
            for conn_id in conns {
                self.send_to_conn(conn_id, &event);
            }
            return;
        }

        tracing::debug!(user_id, topic = %event.topic, event = %event.event, "buffering signal for offline user");
        let mut queue = self.buffered.entry(user_id).or_default();
        if queue.len() >= MAX_BUFFERED_PER_USER {
            queue.pop_front();
        }
        queue.push_back(BufferedSignal {
            event,
            expires_at: Utc::now() + chrono::Duration::from_std(BUFFER_TTL).unwrap_or_default(),
        });
    }

    fn drain_buffered(&self, user_id: i64) -> Vec<RelayEvent> {
        let Some((_, queue)) = self.buffered.remove(&user_id) else {
            return Vec::new();
        };
        let now = Utc::now();
        queue
            .into_iter()
            .filter(|s| s.expires_at > now)
            .map(|s| s.event)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscriber() -> (RelaySender, mpsc::UnboundedReceiver<RelayEvent>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn publish_reaches_every_topic_subscriber() {
        let relay = InMemoryRelay::new();
        let (tx1, mut rx1) = subscriber();
        let (tx2, mut rx2) = subscriber();
        relay.register_connection(1, 10, tx1);
        relay.register_connection(2, 20, tx2);
        relay.subscribe("huddle:h1", 10);
        relay.subscribe("huddle:h1", 20);

        relay.publish("huddle:h1", "participant_joined", json!({"user_id": 3}));

        assert_eq!(rx1.try_recv().unwrap().event, "participant_joined");
        assert_eq!(rx2.try_recv().unwrap().event, "participant_joined");
    }

    #[test]
    fn publish_skips_other_topics() {
        let relay = InMemoryRelay::new();
        let (tx, mut rx) = subscriber();
        relay.register_connection(1, 10, tx);
        relay.subscribe("call:a", 10);

        relay.publish("call:b", "signal", json!({}));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn user_addressed_delivery_bypasses_subscriptions() {
        let relay = InMemoryRelay::new();
        let (tx, mut rx) = subscriber();
        relay.register_connection(7, 10, tx);

        relay.publish_to_user(7, "call:c1", "incoming_call", json!({"call_id": "c1"}));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.topic, "call:c1");
        assert_eq!(event.event, "incoming_call");
    }

    #[test]
    fn offline_user_signals_are_buffered_then_drained() {
        let relay = InMemoryRelay::new();
        relay.publish_to_user(7, "call:c1", "incoming_call", json!({}));
        assert_eq!(relay.buffered_count(7), 1);

        let drained = relay.drain_buffered(7);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].event, "incoming_call");
        // Drain takes ownership; a second drain finds nothing.
        assert!(relay.drain_buffered(7).is_empty());
    }

    #[test]
    fn sweep_drops_expired_signals() {
        let relay = InMemoryRelay::new();
        relay.publish_to_user(7, "call:c1", "signal", json!({}));
        relay.sweep_expired(Utc::now() + chrono::Duration::seconds(301));
        assert_eq!(relay.buffered_count(7), 0);
    }

    #[test]
    fn unregister_removes_topic_subscriptions() {
        let relay = InMemoryRelay::new();
        let (tx, mut rx) = subscriber();
        relay.register_connection(1, 10, tx);
        relay.subscribe("call:a", 10);
        relay.unregister_connection(10);

        relay.publish("call:a", "signal", json!({}));
        assert!(rx.try_recv().is_err());
        // Subsequent user-addressed publishes now buffer instead.
        relay.publish_to_user(1, "call:a", "signal", json!({}));
        assert_eq!(relay.buffered_count(1), 1);
    }

    #[test]
    fn buffer_is_bounded_per_user() {
        let relay = InMemoryRelay::new();
        for i in 0..(MAX_BUFFERED_PER_USER + 5) {
            relay.publish_to_user(7, "call:c1", "signal", json!({ "seq": i }));
        }
        assert_eq!(relay.buffered_count(7), MAX_BUFFERED_PER_USER);
    }
}
