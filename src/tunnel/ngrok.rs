//! ngrok subprocess supervision.
//!
//! [`NgrokSupervisor`] owns the lifecycle of at most one ngrok process. A
//! connect spawns `<binary> http <port> --log stdout --log-format json` and
//! reads the JSON log stream until both the tunnel URL (`started tunnel`)
//! and the inspect web address (`starting web service`) have appeared.
//! The child is spawned with `kill_on_drop(true)` so a crashed or cancelled
//! owner never leaks a process.
//!
//! All lifecycle operations lock the same internal mutex for their full
//! duration, so the supervisor processes one operation at a time no matter
//! how it is shared.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{TunnelControl, TunnelEndpoints, TunnelError};

/// How long a freshly spawned process gets to publish its tunnel URL before
/// the attempt is abandoned and the child reaped.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a graceful disconnect (SIGTERM) waits before escalating to SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Supervisor for the external ngrok process. Cheaply cloneable; clones share
/// the same underlying session.
#[derive(Clone, Default)]
pub struct NgrokSupervisor {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    child: Option<Child>,
    public_url: Option<String>,
    drain_task: Option<JoinHandle<()>>,
}

impl NgrokSupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TunnelControl for NgrokSupervisor {
    async fn connect(
        &self,
        port: u16,
        binary_path: &str,
    ) -> Result<TunnelEndpoints, TunnelError> {
        let mut inner = self.inner.lock().await;
        if inner.child.is_some() {
            return Err(TunnelError::SessionActive);
        }

        let mut child = Command::new(binary_path)
            .arg("http")
            .arg(port.to_string())
            .args(["--log", "stdout", "--log-format", "json"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TunnelError::SpawnFailed(format!("{binary_path}: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TunnelError::StartupFailed("Failed to take stdout pipe".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let endpoints =
            match tokio::time::timeout(STARTUP_TIMEOUT, discover_endpoints(&mut lines)).await {
                Ok(Ok(endpoints)) => endpoints,
                Ok(Err(e)) => {
                    reap(&mut child).await;
                    return Err(e);
                }
                Err(_) => {
                    reap(&mut child).await;
                    return Err(TunnelError::StartupTimeout);
                }
            };

        // ngrok keeps logging request traffic; drain the pipe so the child
        // never blocks on a full buffer.
        let drain = tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

        debug!(
            "ngrok up: {} (inspect port {})",
            endpoints.public_url, endpoints.inspect_port
        );
        inner.child = Some(child);
        inner.public_url = Some(endpoints.public_url.clone());
        inner.drain_task = Some(drain);
        Ok(endpoints)
    }

    async fn disconnect(&self, public_url: &str) -> Result<(), TunnelError> {
        let mut inner = self.inner.lock().await;
        let Some(mut child) = inner.child.take() else {
            debug!("disconnect with no running tunnel process, nothing to do");
            return Ok(());
        };
        if inner.public_url.as_deref() != Some(public_url) {
            warn!(
                "disconnect url {public_url} does not match current session {:?}",
                inner.public_url
            );
        }
        inner.public_url = None;
        if let Some(task) = inner.drain_task.take() {
            task.abort();
        }

        // SIGTERM lets ngrok tear its tunnels down cleanly; escalate if it
        // doesn't exit within the grace window.
        if let Some(pid) = child.id() {
            #[allow(clippy::cast_possible_wrap)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await.is_ok() {
                return Ok(());
            }
            warn!("tunnel process ignored SIGTERM, killing");
        }
        reap(&mut child).await;
        Ok(())
    }

    async fn kill(&self) -> bool {
        let mut inner = self.inner.lock().await;
        inner.public_url = None;
        if let Some(task) = inner.drain_task.take() {
            task.abort();
        }
        match inner.child.take() {
            Some(mut child) => {
                reap(&mut child).await;
                true
            }
            None => false,
        }
    }
}

/// SIGKILL the child and wait so it doesn't linger as a zombie.
async fn reap(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Read log lines until both the tunnel URL and the inspect address are known.
async fn discover_endpoints(
    lines: &mut Lines<BufReader<ChildStdout>>,
) -> Result<TunnelEndpoints, TunnelError> {
    let mut public_url: Option<String> = None;
    let mut inspect_port: Option<String> = None;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_log_line(&line) {
                LogEvent::TunnelStarted { url } => public_url = Some(url),
                LogEvent::WebServiceStarted { inspect_port: port } => inspect_port = Some(port),
                LogEvent::Fatal { reason } => return Err(TunnelError::StartupFailed(reason)),
                LogEvent::Other => {}
            },
            Ok(None) => {
                return Err(TunnelError::StartupFailed(
                    "process exited before publishing a tunnel url".to_string(),
                ))
            }
            Err(e) => return Err(TunnelError::StartupFailed(e.to_string())),
        }
        if let (Some(url), Some(port)) = (&public_url, &inspect_port) {
            return Ok(TunnelEndpoints {
                public_url: url.clone(),
                inspect_port: port.clone(),
            });
        }
    }
}

/// One line of ngrok's `--log-format json` output. Only the fields we care
/// about; everything else is ignored.
#[derive(Debug, serde::Deserialize)]
struct NgrokLogLine {
    #[serde(default)]
    lvl: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    addr: Option<String>,
    #[serde(default)]
    err: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum LogEvent {
    TunnelStarted { url: String },
    WebServiceStarted { inspect_port: String },
    Fatal { reason: String },
    Other,
}

fn parse_log_line(line: &str) -> LogEvent {
    let Ok(entry) = serde_json::from_str::<NgrokLogLine>(line) else {
        return LogEvent::Other;
    };
    if matches!(entry.lvl.as_deref(), Some("crit" | "eror" | "error")) {
        let reason = entry
            .err
            .or(entry.msg)
            .unwrap_or_else(|| line.to_string());
        return LogEvent::Fatal { reason };
    }
    match entry.msg.as_deref() {
        Some("started tunnel") => match entry.url {
            Some(url) => LogEvent::TunnelStarted { url },
            None => LogEvent::Other,
        },
        Some("starting web service") => {
            // addr is e.g. "127.0.0.1:4040"; the inspect UI port is what we need
            match entry
                .addr
                .as_deref()
                .and_then(|a| a.rsplit(':').next())
                .map(ToString::to_string)
            {
                Some(inspect_port) => LogEvent::WebServiceStarted { inspect_port },
                None => LogEvent::Other,
            }
        }
        _ => LogEvent::Other,
    }
}
