use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use lanyard_core::{AppConfig, AppState, IceProvider, InMemoryRelay};
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("lanyard=info,tower_http=debug")),
        )
        .init();

    let args = cli::Args::parse();
    let mut config = config::Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    let relay = Arc::new(InMemoryRelay::new());
    relay.spawn_sweeper();

    let ice = IceProvider::new(
        config.ice.stun_urls.clone(),
        config.ice.turn_urls.clone(),
        config.ice.turn_secret.clone(),
        config.ice.credential_ttl_secs,
    );
    let state = AppState::with_relay(
        AppConfig {
            jwt_secret: config.auth.jwt_secret.clone(),
            push_timeout_ms: config.socket.push_timeout_ms,
            heartbeat_interval_ms: config.socket.heartbeat_interval_ms,
        },
        ice,
        relay,
    );

    let app = lanyard_api::build_router()
        .merge(lanyard_ws::gateway_router())
        .with_state(state.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(bind = %config.server.bind_address, "lanyard server listening");

    let shutdown = state.shutdown.clone();
    let shutdown_signal = async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
        // Gateway connections select on this and close cleanly.
        shutdown.notify_waiters();
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}
