//! Shared application state passed to every handler via Axum's `State` extractor.

use std::time::Instant;

use tokio::sync::watch;

use crate::controller::ControllerSnapshot;

/// Shared application state for the botgate server.
///
/// Deliberately small: route handlers never touch the listener or the tunnel
/// directly. Everything they need to build absolute links comes from the
/// controller's published snapshot.
#[derive(Clone)]
pub struct AppState {
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Receiver side of the controller's snapshot channel.
    pub snapshot_rx: watch::Receiver<ControllerSnapshot>,
}

impl AppState {
    pub fn new(snapshot_rx: watch::Receiver<ControllerSnapshot>) -> Self {
        Self {
            start_time: Instant::now(),
            snapshot_rx,
        }
    }

    /// A consistent copy of the current snapshot. The URL pair is published
    /// atomically by the controller, so a handler never observes a service
    /// URL from one configuration and an inspect URL from another.
    pub fn snapshot(&self) -> ControllerSnapshot {
        self.snapshot_rx.borrow().clone()
    }
}
