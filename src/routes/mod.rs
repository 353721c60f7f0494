//! HTTP route registration surface and built-in handlers.
//!
//! External collaborators (conversation CRUD, attachments, bot state, direct
//! line) each hand a `Router<AppState>` fragment to the [`RouteRegistry`];
//! the Listener Manager asks the registry for the composed router every time
//! it (re)starts. The two built-in endpoints exercise the same path:
//!
//! - [`health`] — `GET /health`, liveness
//! - [`info`] — `GET /info`, the published service/inspect URLs

pub mod health;
pub mod info;

use std::sync::Mutex;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Collects route fragments from collaborators and builds the served router.
///
/// Fragments may be mounted before or after the listener starts; the registry
/// is consulted at every listener (re)start, so fragments mounted while the
/// listener is running become visible at the next restart.
pub struct RouteRegistry {
    base_path: String,
    fragments: Mutex<Vec<Router<AppState>>>,
}

impl RouteRegistry {
    /// `base_path` nests every route (e.g. `"emulator"` → `/emulator/health`);
    /// empty or `"/"` serves at the root.
    pub fn new(base_path: impl Into<String>) -> Self {
        let raw = base_path.into();
        let trimmed = raw.trim_matches('/');
        let base_path = if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        };
        Self {
            base_path,
            fragments: Mutex::new(Vec::new()),
        }
    }

    /// Register a route fragment.
    pub fn mount(&self, router: Router<AppState>) {
        self.fragments
            .lock()
            .expect("route registry lock poisoned")
            .push(router);
    }

    /// Compose all mounted fragments into the router the listener serves.
    pub fn build(&self, state: AppState) -> Router {
        let fragments = self
            .fragments
            .lock()
            .expect("route registry lock poisoned");
        let mut app = Router::new();
        for fragment in fragments.iter() {
            app = app.merge(fragment.clone());
        }
        if !self.base_path.is_empty() {
            app = Router::new().nest(&self.base_path, app);
        }
        app.layer(TraceLayer::new_for_http()).with_state(state)
    }
}

/// The built-in endpoint fragment, mounted by `main` at startup.
pub fn builtin_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route("/info", get(info::info))
}
