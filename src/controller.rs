//! Reconfiguration controller — the state machine between configuration
//! changes and the listener/tunnel lifecycles.
//!
//! On every delivered configuration the controller compares port and ngrok
//! path against the last-applied values and sequences the transitions:
//!
//! 1. Port changed → restart the listener on the new port. A bind failure
//!    aborts the whole apply; the previous configuration stays in effect.
//! 2. Port or path changed → the published URLs are stale the instant either
//!    changes, so the snapshot immediately falls back to
//!    `http://localhost:<port>` with no inspect URL. Then:
//!    - path changed: `kill()` any previous process (a different binary
//!      means a different subprocess, no graceful handshake applies);
//!    - port-only change: `disconnect()` the last known good public URL;
//!    - either way, once teardown has completed, `connect()` on the new
//!      port if a path is configured.
//! 3. Neither changed → no-op.
//!
//! Events are consumed one at a time from an mpsc channel and every
//! lifecycle call is awaited before the next is issued, so there is never
//! more than one tunnel operation in flight. A failed connect is quiet
//! degradation: logged, snapshot stays local-only, the HTTP service keeps
//! serving.

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{FrameworkSettings, Settings};
use crate::listener::{BindError, ListenerControl};
use crate::tunnel::{TunnelControl, TunnelSession, TunnelStatus};

/// The externally visible state route handlers read to build absolute links.
///
/// Published atomically over a watch channel; `service_url` is never empty —
/// it is either a live tunnel URL or `http://localhost:<port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSnapshot {
    /// Base URL under which the service is reachable.
    pub service_url: String,
    /// Tunnel inspection UI, present only while a tunnel is connected.
    pub inspect_url: Option<String>,
    /// Port the listener is bound to.
    pub port: u16,
    /// Applied ngrok binary path (empty = tunneling disabled).
    pub ngrok_path: String,
    pub tunnel_status: TunnelStatus,
}

impl ControllerSnapshot {
    /// A local-only snapshot for the given configuration.
    pub fn local(port: u16, ngrok_path: String) -> Self {
        Self {
            service_url: format!("http://localhost:{port}"),
            inspect_url: None,
            port,
            ngrok_path,
            tunnel_status: TunnelStatus::Idle,
        }
    }
}

/// Single owner of the listener and tunnel lifecycles. Route handlers never
/// touch either directly; they read the published snapshot.
pub struct ReconfigController<L, T> {
    listener: L,
    tunnel: T,
    applied: Option<FrameworkSettings>,
    session: TunnelSession,
    snapshot_tx: watch::Sender<ControllerSnapshot>,
}

impl<L: ListenerControl, T: TunnelControl> ReconfigController<L, T> {
    pub fn new(listener: L, tunnel: T, snapshot_tx: watch::Sender<ControllerSnapshot>) -> Self {
        Self {
            listener,
            tunnel,
            applied: None,
            session: TunnelSession::idle(0, String::new()),
            snapshot_tx,
        }
    }

    /// Apply one configuration change. Returns `Err` only for a listener
    /// bind failure, in which case nothing was applied and the previous
    /// configuration remains in effect.
    pub async fn apply(&mut self, cfg: FrameworkSettings) -> Result<(), BindError> {
        let port_changed = self.applied.as_ref().map(|a| a.port) != Some(cfg.port);
        if port_changed {
            info!(
                "port changed ({:?} -> {}), restarting listener",
                self.applied.as_ref().map(|a| a.port),
                cfg.port
            );
            self.listener.restart(cfg.port).await?;
        }

        let prev_path = self
            .applied
            .as_ref()
            .map(|a| a.ngrok_path.clone())
            .unwrap_or_default();
        let path_changed = prev_path != cfg.ngrok_path;

        if port_changed || path_changed {
            let last_good_url = self.session.public_url.take();

            // The published URLs are stale the moment the port or binary
            // changes; fall back to the local base URL right away.
            self.session = TunnelSession::idle(cfg.port, cfg.ngrok_path.clone());
            self.publish(&cfg);

            if path_changed {
                // Switching binaries: no graceful handshake applies. A
                // previous empty path means no process can exist, so there
                // is nothing to tear down at all.
                if !prev_path.is_empty() && self.tunnel.kill().await {
                    debug!("killed previous tunnel process");
                }
            } else if let Some(url) = last_good_url {
                if let Err(e) = self.tunnel.disconnect(&url).await {
                    warn!("tunnel disconnect failed: {e}");
                }
            } else if !prev_path.is_empty() {
                // Same binary, but the previous session never connected;
                // reap any half-started process before relaunching.
                self.tunnel.kill().await;
            }

            if cfg.ngrok_path.is_empty() {
                info!("tunneling disabled, serving on http://localhost:{}", cfg.port);
            } else {
                self.session.status = TunnelStatus::Connecting;
                self.publish(&cfg);
                match self.tunnel.connect(cfg.port, &cfg.ngrok_path).await {
                    Ok(endpoints) => {
                        info!(
                            "ngrok listening on {}, inspector at port {}",
                            endpoints.public_url, endpoints.inspect_port
                        );
                        self.session.public_url = Some(endpoints.public_url);
                        self.session.inspect_url =
                            Some(format!("http://127.0.0.1:{}", endpoints.inspect_port));
                        self.session.status = TunnelStatus::Connected;
                        self.publish(&cfg);
                    }
                    Err(e) => {
                        warn!("failed to configure ngrok at {}: {e}", cfg.ngrok_path);
                        self.session.status = TunnelStatus::Failed;
                        self.publish(&cfg);
                    }
                }
            }
        }

        self.applied = Some(cfg);
        Ok(())
    }

    /// Consume configuration changes until the channel closes. Events are
    /// serialized: a second change is not applied until the first change's
    /// lifecycle calls have completed.
    pub async fn run(mut self, mut settings_rx: mpsc::Receiver<Settings>) {
        while let Some(settings) = settings_rx.recv().await {
            if let Err(e) = settings.validate() {
                warn!("rejecting configuration change: {e}");
                continue;
            }
            if let Err(e) = self.apply(settings.framework).await {
                error!("reconfiguration failed, keeping previous configuration: {e}");
            }
        }
    }

    /// Publish a consistent snapshot derived from the current session.
    fn publish(&self, cfg: &FrameworkSettings) {
        let service_url = self
            .session
            .public_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", cfg.port));
        self.snapshot_tx.send_replace(ControllerSnapshot {
            service_url,
            inspect_url: self.session.inspect_url.clone(),
            port: cfg.port,
            ngrok_path: cfg.ngrok_path.clone(),
            tunnel_status: self.session.status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{TunnelEndpoints, TunnelError};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Restart(u16),
        Connect(u16, String),
        Disconnect(String),
        Kill,
    }

    /// Shared call recorder. Tunnel ops assert that no other tunnel op is in
    /// flight, yielding mid-op to catch overlap.
    #[derive(Clone, Default)]
    struct Recorder {
        ops: Arc<Mutex<Vec<Op>>>,
        tunnel_op_in_flight: Arc<Mutex<bool>>,
    }

    impl Recorder {
        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }

        async fn record_tunnel_op(&self, op: Op) {
            {
                let mut busy = self.tunnel_op_in_flight.lock().unwrap();
                assert!(!*busy, "overlapping tunnel lifecycle operations: {op:?}");
                *busy = true;
            }
            self.ops.lock().unwrap().push(op);
            tokio::task::yield_now().await;
            *self.tunnel_op_in_flight.lock().unwrap() = false;
        }
    }

    struct MockListener {
        rec: Recorder,
        fail_ports: Vec<u16>,
    }

    impl ListenerControl for MockListener {
        async fn restart(&mut self, port: u16) -> Result<(), BindError> {
            self.rec.ops.lock().unwrap().push(Op::Restart(port));
            if self.fail_ports.contains(&port) {
                return Err(BindError {
                    port,
                    source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "port in use"),
                });
            }
            Ok(())
        }
    }

    #[derive(Clone)]
    struct MockTunnel {
        rec: Recorder,
        connect_results: Arc<Mutex<VecDeque<Result<TunnelEndpoints, TunnelError>>>>,
    }

    impl MockTunnel {
        fn new(rec: Recorder) -> Self {
            Self {
                rec,
                connect_results: Arc::new(Mutex::new(VecDeque::new())),
            }
        }

        fn script_connect(&self, result: Result<TunnelEndpoints, TunnelError>) {
            self.connect_results.lock().unwrap().push_back(result);
        }
    }

    impl TunnelControl for MockTunnel {
        async fn connect(
            &self,
            port: u16,
            binary_path: &str,
        ) -> Result<TunnelEndpoints, TunnelError> {
            self.rec
                .record_tunnel_op(Op::Connect(port, binary_path.to_string()))
                .await;
            self.connect_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TunnelError::SpawnFailed("unscripted connect".to_string())))
        }

        async fn disconnect(&self, public_url: &str) -> Result<(), TunnelError> {
            self.rec
                .record_tunnel_op(Op::Disconnect(public_url.to_string()))
                .await;
            Ok(())
        }

        async fn kill(&self) -> bool {
            self.rec.record_tunnel_op(Op::Kill).await;
            true
        }
    }

    type TestController = ReconfigController<MockListener, MockTunnel>;

    fn controller_with_failing_ports(
        fail_ports: Vec<u16>,
    ) -> (
        TestController,
        MockTunnel,
        Recorder,
        watch::Receiver<ControllerSnapshot>,
    ) {
        let rec = Recorder::default();
        let listener = MockListener {
            rec: rec.clone(),
            fail_ports,
        };
        let tunnel = MockTunnel::new(rec.clone());
        let (tx, rx) = watch::channel(ControllerSnapshot::local(3000, String::new()));
        let controller = ReconfigController::new(listener, tunnel.clone(), tx);
        (controller, tunnel, rec, rx)
    }

    fn controller() -> (
        TestController,
        MockTunnel,
        Recorder,
        watch::Receiver<ControllerSnapshot>,
    ) {
        controller_with_failing_ports(Vec::new())
    }

    fn fw(port: u16, ngrok_path: &str) -> FrameworkSettings {
        FrameworkSettings {
            port,
            ngrok_path: ngrok_path.to_string(),
            base_path: String::new(),
        }
    }

    fn endpoints(url: &str, inspect_port: &str) -> TunnelEndpoints {
        TunnelEndpoints {
            public_url: url.to_string(),
            inspect_port: inspect_port.to_string(),
        }
    }

    #[tokio::test]
    async fn test_initial_config_without_tunnel_issues_no_tunnel_calls() {
        let (mut ctl, _tunnel, rec, rx) = controller();
        ctl.apply(fw(3000, "")).await.unwrap();

        assert_eq!(rec.ops(), vec![Op::Restart(3000)]);
        let snap = rx.borrow().clone();
        assert_eq!(snap.service_url, "http://localhost:3000");
        assert_eq!(snap.inspect_url, None);
        assert_eq!(snap.tunnel_status, TunnelStatus::Idle);
    }

    #[tokio::test]
    async fn test_enabling_tunnel_issues_single_connect_without_teardown() {
        let (mut ctl, tunnel, rec, rx) = controller();
        ctl.apply(fw(3000, "")).await.unwrap();

        tunnel.script_connect(Ok(endpoints("https://abc.ngrok.io", "4040")));
        ctl.apply(fw(3000, "/usr/bin/ngrok")).await.unwrap();

        // no prior tunnel path, so no kill or disconnect precedes the connect
        assert_eq!(
            rec.ops(),
            vec![
                Op::Restart(3000),
                Op::Connect(3000, "/usr/bin/ngrok".to_string())
            ]
        );
        let snap = rx.borrow().clone();
        assert_eq!(snap.service_url, "https://abc.ngrok.io");
        assert_eq!(snap.inspect_url.as_deref(), Some("http://127.0.0.1:4040"));
        assert_eq!(snap.tunnel_status, TunnelStatus::Connected);
    }

    #[tokio::test]
    async fn test_port_change_restarts_then_disconnects_then_reconnects() {
        let (mut ctl, tunnel, rec, rx) = controller();
        ctl.apply(fw(3000, "")).await.unwrap();
        tunnel.script_connect(Ok(endpoints("https://abc.ngrok.io", "4040")));
        ctl.apply(fw(3000, "/usr/bin/ngrok")).await.unwrap();

        tunnel.script_connect(Ok(endpoints("https://def.ngrok.io", "4040")));
        ctl.apply(fw(3001, "/usr/bin/ngrok")).await.unwrap();

        assert_eq!(
            rec.ops(),
            vec![
                Op::Restart(3000),
                Op::Connect(3000, "/usr/bin/ngrok".to_string()),
                Op::Restart(3001),
                Op::Disconnect("https://abc.ngrok.io".to_string()),
                Op::Connect(3001, "/usr/bin/ngrok".to_string()),
            ]
        );
        let snap = rx.borrow().clone();
        assert_eq!(snap.service_url, "https://def.ngrok.io");
        assert_eq!(snap.port, 3001);
    }

    #[tokio::test]
    async fn test_binary_change_kills_before_connect() {
        let (mut ctl, tunnel, rec, _rx) = controller();
        tunnel.script_connect(Ok(endpoints("https://abc.ngrok.io", "4040")));
        ctl.apply(fw(3000, "/usr/bin/ngrok")).await.unwrap();

        tunnel.script_connect(Ok(endpoints("https://xyz.ngrok.io", "4041")));
        ctl.apply(fw(3000, "/opt/ngrok/ngrok")).await.unwrap();

        let ops = rec.ops();
        assert_eq!(
            &ops[2..],
            &[Op::Kill, Op::Connect(3000, "/opt/ngrok/ngrok".to_string())],
            "switching binaries must hard-kill before reconnecting"
        );
    }

    #[tokio::test]
    async fn test_unchanged_config_is_noop() {
        let (mut ctl, tunnel, rec, _rx) = controller();
        tunnel.script_connect(Ok(endpoints("https://abc.ngrok.io", "4040")));
        ctl.apply(fw(3000, "/usr/bin/ngrok")).await.unwrap();
        let before = rec.ops();

        ctl.apply(fw(3000, "/usr/bin/ngrok")).await.unwrap();
        assert_eq!(rec.ops(), before);
    }

    #[tokio::test]
    async fn test_failed_connect_degrades_to_local_url() {
        let (mut ctl, tunnel, _rec, rx) = controller();
        tunnel.script_connect(Err(TunnelError::SpawnFailed("no such file".to_string())));
        ctl.apply(fw(3000, "/usr/bin/ngrok")).await.unwrap();

        let snap = rx.borrow().clone();
        assert_eq!(snap.service_url, "http://localhost:3000");
        assert_eq!(snap.inspect_url, None);
        assert_eq!(snap.tunnel_status, TunnelStatus::Failed);
    }

    #[tokio::test]
    async fn test_clearing_path_kills_without_reconnect() {
        let (mut ctl, tunnel, rec, rx) = controller();
        tunnel.script_connect(Ok(endpoints("https://abc.ngrok.io", "4040")));
        ctl.apply(fw(3000, "/usr/bin/ngrok")).await.unwrap();

        ctl.apply(fw(3000, "")).await.unwrap();

        let ops = rec.ops();
        assert_eq!(ops.last(), Some(&Op::Kill));
        assert!(!ops.iter().skip(2).any(|op| matches!(op, Op::Connect(..))));
        let snap = rx.borrow().clone();
        assert_eq!(snap.service_url, "http://localhost:3000");
        assert_eq!(snap.tunnel_status, TunnelStatus::Idle);
    }

    #[tokio::test]
    async fn test_bind_failure_preserves_applied_config() {
        let (mut ctl, _tunnel, rec, rx) = controller_with_failing_ports(vec![3001]);
        ctl.apply(fw(3000, "")).await.unwrap();

        assert!(ctl.apply(fw(3001, "")).await.is_err());
        assert_eq!(rx.borrow().port, 3000, "snapshot must not advertise a dead port");

        // the failed change was not recorded as applied: re-delivering the
        // old config is a no-op, not a restart
        let before = rec.ops();
        ctl.apply(fw(3000, "")).await.unwrap();
        assert_eq!(rec.ops(), before);
    }

    #[tokio::test]
    async fn test_port_change_after_failed_connect_kills_instead_of_disconnect() {
        let (mut ctl, tunnel, rec, _rx) = controller();
        tunnel.script_connect(Err(TunnelError::StartupTimeout));
        ctl.apply(fw(3000, "/usr/bin/ngrok")).await.unwrap();

        // no last known good URL exists, so teardown is a kill
        tunnel.script_connect(Ok(endpoints("https://abc.ngrok.io", "4040")));
        ctl.apply(fw(3001, "/usr/bin/ngrok")).await.unwrap();

        let ops = rec.ops();
        assert!(!ops.iter().any(|op| matches!(op, Op::Disconnect(_))));
        assert_eq!(
            &ops[2..],
            &[
                Op::Restart(3001),
                Op::Kill,
                Op::Connect(3001, "/usr/bin/ngrok".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_service_url_never_empty_across_transitions() {
        let (mut ctl, tunnel, _rec, rx) = controller();
        let assert_snapshot_sane = {
            let rx = rx.clone();
            move || {
                let snap = rx.borrow().clone();
                assert!(!snap.service_url.is_empty());
                assert!(
                    snap.service_url.starts_with("http://localhost:")
                        || snap.service_url.starts_with("https://")
                );
            }
        };

        ctl.apply(fw(3000, "")).await.unwrap();
        assert_snapshot_sane();

        tunnel.script_connect(Ok(endpoints("https://abc.ngrok.io", "4040")));
        ctl.apply(fw(3000, "/usr/bin/ngrok")).await.unwrap();
        assert_snapshot_sane();

        tunnel.script_connect(Err(TunnelError::StartupTimeout));
        ctl.apply(fw(3001, "/usr/bin/ngrok")).await.unwrap();
        assert_snapshot_sane();

        ctl.apply(fw(3001, "")).await.unwrap();
        assert_snapshot_sane();
    }

    #[tokio::test]
    async fn test_run_loop_rejects_invalid_settings() {
        let (ctl, _tunnel, rec, rx) = controller();
        let (tx, settings_rx) = mpsc::channel(4);
        let task = tokio::spawn(ctl.run(settings_rx));

        let mut bad = Settings::default();
        bad.framework.port = 0;
        tx.send(bad).await.unwrap();

        let mut good = Settings::default();
        good.framework.port = 3000;
        tx.send(good).await.unwrap();
        drop(tx);
        task.await.unwrap();

        // the invalid config never reached the listener
        assert_eq!(rec.ops(), vec![Op::Restart(3000)]);
        assert_eq!(rx.borrow().port, 3000);
    }
}
