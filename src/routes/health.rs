//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;
use crate::tunnel::TunnelStatus;

/// `GET /health` — liveness probe.
///
/// Returns status, uptime, version, and the current tunnel status. Suitable
/// for a bot-testing client polling whether the front door is up.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let snapshot = state.snapshot();

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "tunnel": {
            "status": snapshot.tunnel_status.as_str(),
            "connected": snapshot.tunnel_status == TunnelStatus::Connected,
        },
    }))
}
