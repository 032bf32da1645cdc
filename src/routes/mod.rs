//! HTTP surface of the proxy.
//!
//! | Method | Path                              | Description                     |
//! |--------|-----------------------------------|---------------------------------|
//! | GET    | `/health`                         | Liveness + connected devices    |
//! | GET    | `/cameras`                        | All cameras on all devices      |
//! | GET    | `/devices/{id}/videos`            | Proxied recording listing       |
//! | GET    | `/devices/{id}/videos/{filename}` | Range-aware proxied streaming   |
//! | GET    | `/ws/device`                      | Device tunnel (WebSocket)       |
//!
//! `{id}` accepts a device id or a camera id; resolution tries the device
//! id first, then scans camera registrations.

pub mod cameras;
pub mod health;
pub mod videos;

use std::sync::Arc;
use std::time::Instant;

use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::Config;
use crate::tunnel::gateway;
use crate::tunnel::registry::DeviceRegistry;

/// Shared proxy state passed to every handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct ProxyState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// device id → live tunnel session.
    pub registry: DeviceRegistry,
    /// Monotonic instant when the proxy started (for uptime).
    pub start_time: Instant,
}

impl ProxyState {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            registry: DeviceRegistry::new(),
            start_time: Instant::now(),
        }
    }
}

/// Build the proxy router.
pub fn router(state: ProxyState) -> Router {
    let cors = cors_layer(&state.config.proxy.cors_origins);
    Router::new()
        .route("/health", get(health::health))
        .route("/cameras", get(cameras::list_cameras))
        .route("/devices/{device}/videos", get(videos::list_videos))
        .route(
            "/devices/{device}/videos/{filename}",
            get(videos::stream_video),
        )
        .route("/ws/device", get(gateway::device_ws))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}
