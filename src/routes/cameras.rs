//! `GET /cameras` — every camera on every connected device.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use super::ProxyState;

pub async fn list_cameras(State(state): State<ProxyState>) -> Json<Value> {
    let cameras = state.registry.cameras().await;
    Json(json!({
        "total": cameras.len(),
        "cameras": cameras,
    }))
}
