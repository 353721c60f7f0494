//! HTTP listener lifecycle.
//!
//! [`ListenerManager`] owns the one TCP listener this service is ever bound
//! to. The reconfiguration controller is its only caller; route handlers
//! never touch it. A restart is atomic from the caller's perspective: stop
//! the old listener, bind the new port, serve the Route Registry's current
//! router. There is never a moment with two ports bound.
//!
//! Drain policy: in-flight requests on the old listener are **dropped** on
//! restart (the serve task is aborted). Dropping rather than draining keeps
//! the single-listener guarantee without an unbounded wait on slow clients.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::routes::RouteRegistry;
use crate::state::AppState;

/// The listener could not be bound on the requested port. Fatal to that
/// reconfiguration attempt; the service keeps serving on the previous port.
#[derive(Debug)]
pub struct BindError {
    pub port: u16,
    pub source: std::io::Error,
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to bind port {}: {}", self.port, self.source)
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Restart surface the reconfiguration controller drives. [`ListenerManager`]
/// is the production implementation; tests substitute a recording mock.
#[allow(async_fn_in_trait)]
pub trait ListenerControl {
    /// Stop the current listener (if any) and start a new one on `port`,
    /// changing the effective base URL of every registered route.
    async fn restart(&mut self, port: u16) -> Result<(), BindError>;
}

/// Owns the single HTTP listener and its serve task.
pub struct ListenerManager {
    registry: Arc<RouteRegistry>,
    state: AppState,
    active: Option<ActiveListener>,
}

struct ActiveListener {
    port: u16,
    task: JoinHandle<()>,
}

impl ListenerManager {
    pub fn new(registry: Arc<RouteRegistry>, state: AppState) -> Self {
        Self {
            registry,
            state,
            active: None,
        }
    }

    /// Port the listener is currently bound to, if any.
    pub fn port(&self) -> Option<u16> {
        self.active.as_ref().map(|a| a.port)
    }

    /// Abort the serve task and wait until it (and its listener socket) are
    /// gone, freeing the port. Returns the port that was bound.
    async fn stop_active(&mut self) -> Option<u16> {
        let active = self.active.take()?;
        active.task.abort();
        let _ = active.task.await;
        Some(active.port)
    }

    /// Bind `port` on localhost and serve the registry's current router.
    async fn bind_and_serve(&mut self, port: u16) -> Result<(), BindError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|source| BindError { port, source })?;
        let app = self.registry.build(self.state.clone());
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("listener on port {port} exited: {e}");
            }
        });
        self.active = Some(ActiveListener { port, task });
        Ok(())
    }
}

impl ListenerControl for ListenerManager {
    async fn restart(&mut self, port: u16) -> Result<(), BindError> {
        let prev_port = self.stop_active().await;
        match self.bind_and_serve(port).await {
            Ok(()) => {
                info!("listening on http://localhost:{port}");
                Ok(())
            }
            Err(e) => {
                // Keep the service reachable on the old port when we can.
                if let Some(prev) = prev_port.filter(|&p| p != port) {
                    match self.bind_and_serve(prev).await {
                        Ok(()) => warn!("bind to port {port} failed, still listening on {prev}"),
                        Err(restore) => {
                            error!("could not re-bind previous port {prev}: {restore}");
                        }
                    }
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerSnapshot;
    use crate::routes;
    use tokio::net::TcpStream;
    use tokio::sync::watch;

    fn manager() -> (ListenerManager, watch::Sender<ControllerSnapshot>) {
        let registry = Arc::new(RouteRegistry::new(""));
        registry.mount(routes::builtin_router());
        let (tx, rx) = watch::channel(ControllerSnapshot::local(3000, String::new()));
        (ListenerManager::new(registry, AppState::new(rx)), tx)
    }

    async fn free_port() -> u16 {
        TcpListener::bind(("127.0.0.1", 0))
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_restart_binds_new_port_and_releases_old() {
        let (mut mgr, _tx) = manager();
        let p1 = free_port().await;
        mgr.restart(p1).await.unwrap();
        assert_eq!(mgr.port(), Some(p1));
        assert!(TcpStream::connect(("127.0.0.1", p1)).await.is_ok());

        let p2 = free_port().await;
        mgr.restart(p2).await.unwrap();
        assert_eq!(mgr.port(), Some(p2));
        assert!(TcpStream::connect(("127.0.0.1", p2)).await.is_ok());
        assert!(
            TcpStream::connect(("127.0.0.1", p1)).await.is_err(),
            "old port must be released after restart"
        );
    }

    #[tokio::test]
    async fn test_bind_error_when_port_in_use() {
        let (mut mgr, _tx) = manager();
        let occupied = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        let err = mgr.restart(port).await.unwrap_err();
        assert_eq!(err.port, port);
        assert_eq!(mgr.port(), None);
    }

    #[tokio::test]
    async fn test_failed_bind_restores_previous_port() {
        let (mut mgr, _tx) = manager();
        let p1 = free_port().await;
        mgr.restart(p1).await.unwrap();

        let occupied = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let p2 = occupied.local_addr().unwrap().port();
        assert!(mgr.restart(p2).await.is_err());

        assert_eq!(mgr.port(), Some(p1), "service must stay on the old port");
        assert!(TcpStream::connect(("127.0.0.1", p1)).await.is_ok());
    }
}
