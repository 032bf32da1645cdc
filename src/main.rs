#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # camlink
//!
//! NAT-traversing video tunnel. Devices with camera recordings open a
//! persistent outbound WebSocket to a reachable proxy; HTTP clients browse
//! and range-stream those recordings through the proxy as if the device
//! were directly reachable.
//!
//! ## Subcommands
//!
//! - `camlink proxy` — run the reachable proxy: HTTP API + device tunnels
//! - `camlink agent` — run the on-device agent: connects out to the proxy
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! auth.rs          — constant-time shared-secret comparison
//! protocol.rs      — text envelope + binary chunk codec, payload types
//! tunnel/
//!   session.rs     — pending-request table, demux, dual-mode streaming
//!   registry.rs    — device id → session, supersession, idle sweep
//!   gateway.rs     — device WS endpoint: handshake + frame pump
//!   agent.rs       — device-side client: reconnect, request servicing
//! recordings.rs    — on-disk recording layout: list, filter, range reads
//! routes/
//!   health.rs      — GET /health
//!   cameras.rs     — GET /cameras
//!   videos.rs      — listing + range-aware streaming endpoints
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use camlink::tunnel::{agent, session::CloseReason};
use camlink::{Config, ProxyState};

/// NAT-traversing video tunnel proxy and device agent.
#[derive(Parser)]
#[command(name = "camlink", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reachable proxy: HTTP surface + device tunnel endpoint.
    Proxy {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the on-device agent: outbound tunnel + recording store.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Proxy { config } => run_proxy(config.as_deref()).await,
        Commands::Agent { config } => run_agent(config.as_deref()).await,
    }
}

fn init_tracing(config: &Config) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_proxy(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    info!("camlink proxy v{} starting", env!("CARGO_PKG_VERSION"));
    if config.auth.device_token == "change-me" {
        warn!("Using default device token — set CAMLINK_DEVICE_TOKEN or update config");
    }

    let state = ProxyState::new(Arc::new(config));
    let app = camlink::routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.proxy.listen)
        .await
        .expect("Failed to bind");
    info!("Listening on {}", state.config.proxy.listen);

    // Heartbeat sweep: close device sessions that have gone silent.
    let sweep_registry = state.registry.clone();
    let heartbeat_timeout = Duration::from_secs(state.config.proxy.heartbeat_timeout_secs.max(1));
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval((heartbeat_timeout / 3).max(Duration::from_secs(1)));
        loop {
            interval.tick().await;
            sweep_registry.sweep_idle(heartbeat_timeout).await;
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    info!("Shutting down...");
    sweep_task.abort();
    state.registry.close_all(CloseReason::Shutdown).await;
    info!("Goodbye");
}

async fn run_agent(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    info!("camlink agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Device id: {}", config.agent.device_id);
    info!("Recordings root: {}", config.agent.recordings_root);

    let config = Arc::new(config);
    tokio::select! {
        () = agent::run(config) => {}
        () = shutdown_signal() => info!("Shutting down..."),
    }
    info!("Goodbye");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
