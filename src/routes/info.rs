//! Service information endpoint.
//!
//! `GET /info` exposes the controller's published snapshot. This is the
//! pattern external route collaborators follow when they need absolute links
//! in a response body: read the snapshot, prefix paths with `service_url`.
//! The snapshot is a consistent copy, so the service URL and inspect URL
//! always come from the same configuration.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /info` — the published service/inspect URLs and applied configuration.
pub async fn info(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.snapshot();

    Json(json!({
        "service_url": snapshot.service_url,
        "inspect_url": snapshot.inspect_url,
        "port": snapshot.port,
        "ngrok_path": snapshot.ngrok_path,
        "tunnel_status": snapshot.tunnel_status.as_str(),
        "links": {
            "health": format!("{}/health", snapshot.service_url),
            "info": format!("{}/info", snapshot.service_url),
        },
    }))
}
