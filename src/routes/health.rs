//! `GET /health` — liveness probe.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use super::ProxyState;

pub async fn health(State(state): State<ProxyState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "devices_connected": state.registry.len().await,
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}
