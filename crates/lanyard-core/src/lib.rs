pub mod auth;
pub mod call;
pub mod error;
pub mod huddle;
pub mod ice;
pub mod relay;

use std::sync::Arc;

use tokio::sync::Notify;

pub use call::{CallSessionManager, ParticipantFlag};
pub use error::CoreError;
pub use huddle::HuddleManager;
pub use ice::IceProvider;
pub use relay::{InMemoryRelay, RelayEvent, SignalRelay};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub jwt_secret: String,
    /// Bound on join/push round trips, milliseconds.
    pub push_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub relay: Arc<dyn SignalRelay>,
    pub calls: Arc<CallSessionManager>,
    pub huddles: Arc<HuddleManager>,
    pub ice: Arc<IceProvider>,
    pub shutdown: Arc<Notify>,
}

impl AppState {
    /// Wire the managers to a fresh in-memory relay. The relay sweeper is
    /// the binary's to spawn; tests drive expiry by hand.
    pub fn new(config: AppConfig, ice: IceProvider) -> Self {
        let relay: Arc<InMemoryRelay> = Arc::new(InMemoryRelay::new());
        Self::with_relay(config, ice, relay)
    }

    pub fn with_relay(
        config: AppConfig,
        ice: IceProvider,
        relay: Arc<dyn SignalRelay + 'static>,
    ) -> Self {
        Self {
            config,
            calls: Arc::new(CallSessionManager::new(relay.clone())),
            huddles: Arc::new(HuddleManager::new(relay.clone())),
            relay,
            ice: Arc::new(ice),
            shutdown: Arc::new(Notify::new()),
        }
    }
}
