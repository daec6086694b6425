use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use lanyard_models::frame::EVENT_HEARTBEAT;
use lanyard_models::Frame;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub heartbeat_interval: Duration,
    /// Bound on every join/push round trip.
    pub push_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// After this many consecutive failed connect attempts the socket goes
    /// terminally disconnected.
    pub reconnect_max_attempts: u32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            push_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal: retry budget exhausted or `disconnect()` called.
    Disconnected,
}

struct SocketShared {
    url: String,
    credential: String,
    opts: SocketOptions,
    refs: Arc<AtomicU64>,
    channels: DashMap<String, Arc<crate::Channel>>,
    outbound_tx: mpsc::UnboundedSender<Frame>,
    status_tx: watch::Sender<SocketStatus>,
    shutdown: Arc<Notify>,
}

/// Owns one transport connection and multiplexes frames to channels by
/// topic. Reconnection is automatic and transparent to channels, but a
/// channel that was joined before a disconnect is not auto-rejoined: join
/// parameters may need recomputing, so rejoin is the caller's call.
pub struct Socket {
    shared: Arc<SocketShared>,
}

impl Socket {
    /// Open the transport and start the driver task. The credential is an
    /// opaque bearer token appended to the connect URL.
    pub fn connect(url: impl Into<String>, credential: impl Into<String>, opts: SocketOptions) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(SocketStatus::Connecting);
        let shared = Arc::new(SocketShared {
            url: url.into(),
            credential: credential.into(),
            opts,
            refs: Arc::new(AtomicU64::new(1)),
            channels: DashMap::new(),
            outbound_tx,
            status_tx,
            shutdown: Arc::new(Notify::new()),
        });
        tokio::spawn(drive(shared.clone(), outbound_rx));
        Self { shared }
    }

    /// The channel for a topic, created on first use. Joining is a separate,
    /// explicit step.
    pub fn channel(&self, topic: &str) -> Arc<crate::Channel> {
        self.shared
            .channels
            .entry(topic.to_string())
            .or_insert_with(|| {
                Arc::new(crate::Channel::new(
                    topic,
                    self.shared.outbound_tx.clone(),
                    self.shared.refs.clone(),
                    self.shared.opts.push_timeout,
                ))
            })
            .clone()
    }

    pub fn status(&self) -> SocketStatus {
        *self.shared.status_tx.borrow()
    }

    /// Watch socket status transitions, e.g. to trigger rejoins after a
    /// reconnect.
    pub fn status_watch(&self) -> watch::Receiver<SocketStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Voluntary close. Every channel is force-closed, which resolves all
    /// pending correlations with a terminal status.
    pub fn disconnect(&self) {
        self.shared.shutdown.notify_waiters();
        self.shared.set_status(SocketStatus::Disconnected);
        self.shared.close_all_channels();
    }
}

impl SocketShared {
    fn set_status(&self, status: SocketStatus) {
        let _ = self.status_tx.send(status);
    }

    fn close_all_channels(&self) {
        for entry in self.channels.iter() {
            entry.value().force_close();
        }
    }

    fn dispatch(&self, frame: Frame) {
        if frame.topic == "phoenix" {
            // Heartbeat replies carry no channel state.
            return;
        }
        match self.channels.get(&frame.topic) {
            Some(channel) => channel.handle_frame(frame),
            None => {
                tracing::debug!(topic = %frame.topic, event = %frame.event, "frame for unknown topic dropped")
            }
        }
    }

    fn connect_url(&self) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}token={}", self.url, sep, self.credential)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .opts
            .reconnect_base_delay
            .saturating_mul(1u32 << attempt.min(16));
        exp.min(self.opts.reconnect_max_delay)
    }
}

async fn drive(shared: Arc<SocketShared>, outbound_rx: mpsc::UnboundedReceiver<Frame>) {
    let outbound_rx = Arc::new(Mutex::new(outbound_rx));
    let mut attempt: u32 = 0;
    loop {
        let connecting = tokio_tungstenite::connect_async(shared.connect_url());
        let conn = tokio::select! {
            _ = shared.shutdown.notified() => return,
            conn = connecting => conn,
        };
        match conn {
            Ok((ws, _)) => {
                attempt = 0;
                shared.set_status(SocketStatus::Connected);
                tracing::info!(url = %shared.url, "socket connected");
                run_connection(&shared, ws, &outbound_rx).await;
                // Transport closed underneath the channels: every owned
                // channel goes to closed, resolving its correlations now
                // instead of waiting out individual timers.
                shared.close_all_channels();
                shared.set_status(SocketStatus::Reconnecting);
            }
            Err(e) => {
                tracing::warn!(url = %shared.url, error = %e, "socket connect failed");
            }
        }

        attempt += 1;
        if attempt > shared.opts.reconnect_max_attempts {
            tracing::error!(url = %shared.url, attempts = attempt - 1, "reconnect budget exhausted");
            shared.set_status(SocketStatus::Disconnected);
            shared.close_all_channels();
            return;
        }
        let delay = shared.backoff_delay(attempt - 1);
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        tokio::select! {
            _ = shared.shutdown.notified() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_connection(
    shared: &Arc<SocketShared>,
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    outbound_rx: &Arc<Mutex<mpsc::UnboundedReceiver<Frame>>>,
) {
    let (mut sink, mut stream) = ws.split();
    let mut outbound = outbound_rx.lock().await;
    let mut heartbeat = tokio::time::interval(shared.opts.heartbeat_interval);
    heartbeat.tick().await; // the connect itself counts as liveness

    loop {
        tokio::select! {
            _ = shared.shutdown.notified() => {
                let _ = sink.close().await;
                return;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { return };
                match serde_json::to_string(&frame) {
                    Ok(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "failed to encode outbound frame"),
                }
            }
            _ = heartbeat.tick() => {
                let frame = Frame::new("phoenix", EVENT_HEARTBEAT, Value::Null)
                    .with_ref(shared.refs.fetch_add(1, std::sync::atomic::Ordering::Relaxed).to_string());
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(_) => continue,
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Frame>(text.as_str()) {
                            Ok(frame) => shared.dispatch(frame),
                            // Malformed frames are dropped, never fatal.
                            Err(e) => tracing::warn!(error = %e, "malformed inbound frame dropped"),
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "socket read error");
                        return;
                    }
                }
            }
        }
    }
}
