//! Tunnel supervision — public exposure of the local listener via ngrok.
//!
//! The service never implements the tunnel protocol itself; it supervises an
//! external tunnel-providing process through a narrow control surface:
//!
//! - `connect(port, binary)` — spawn the process, wait for it to publish a
//!   public URL and an inspect address
//! - `disconnect(public_url)` — graceful teardown of the current session
//! - `kill()` — hard stop, used when switching binaries (no graceful
//!   handshake applies across different binaries)
//!
//! The supervisor accepts one in-flight lifecycle operation at a time; the
//! reconfiguration controller awaits each operation's completion before
//! issuing the next. That serialization is what prevents a connect racing a
//! still-pending teardown.

pub mod ngrok;

pub use ngrok::NgrokSupervisor;

/// Where a running tunnel can be reached, as reported by the process itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEndpoints {
    /// Public internet-reachable URL forwarding to the local listener.
    pub public_url: String,
    /// Port of the local inspection web UI (e.g. `"4040"`).
    pub inspect_port: String,
}

/// Lifecycle state of the (at most one) tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    /// No tunnel configured or running.
    Idle,
    /// A connect has been issued and its completion is still pending.
    Connecting,
    /// The tunnel is up and the public URL is live.
    Connected,
    /// The last connect failed; the service is reachable locally only.
    Failed,
}

impl TunnelStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

/// The current (at most one) tunnel session, owned by the controller.
///
/// Replaced wholesale on every reconfiguration that touches the tunnel;
/// `public_url`/`inspect_url` are only ever `Some` after a successful connect.
#[derive(Debug, Clone)]
pub struct TunnelSession {
    /// Local port the tunnel forwards to.
    pub local_port: u16,
    /// Binary the session was (or would be) launched with.
    pub binary_path: String,
    /// Public URL from the last successful connect.
    pub public_url: Option<String>,
    /// Inspect UI URL from the last successful connect.
    pub inspect_url: Option<String>,
    pub status: TunnelStatus,
}

impl TunnelSession {
    /// A fresh, not-yet-connected session for the given configuration.
    pub fn idle(local_port: u16, binary_path: String) -> Self {
        Self {
            local_port,
            binary_path,
            public_url: None,
            inspect_url: None,
            status: TunnelStatus::Idle,
        }
    }
}

/// Errors from tunnel lifecycle operations. All are recoverable: a failed
/// connect degrades the service to its local URL, it never takes the HTTP
/// service down.
#[derive(Debug)]
pub enum TunnelError {
    /// The tunnel binary could not be started (not found, not executable).
    SpawnFailed(String),
    /// The process started but exited or reported a fatal error before
    /// publishing a tunnel URL.
    StartupFailed(String),
    /// The process produced no tunnel URL within the startup window.
    StartupTimeout,
    /// A connect was issued while a session is still live. The caller must
    /// tear down (disconnect or kill) and await completion first.
    SessionActive,
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelError::SpawnFailed(e) => write!(f, "Failed to spawn tunnel process: {e}"),
            TunnelError::StartupFailed(e) => write!(f, "Tunnel startup failed: {e}"),
            TunnelError::StartupTimeout => write!(f, "Tunnel startup timed out"),
            TunnelError::SessionActive => write!(f, "A tunnel session is already active"),
        }
    }
}

impl std::error::Error for TunnelError {}

/// Control surface the reconfiguration controller drives. [`NgrokSupervisor`]
/// is the production implementation; tests substitute a recording mock.
#[allow(async_fn_in_trait)]
pub trait TunnelControl {
    /// Launch a tunnel forwarding `port`. Completes once the public URL and
    /// inspect address are known (or the attempt has failed).
    async fn connect(&self, port: u16, binary_path: &str)
        -> Result<TunnelEndpoints, TunnelError>;

    /// Gracefully tear down the session identified by its public URL.
    async fn disconnect(&self, public_url: &str) -> Result<(), TunnelError>;

    /// Hard-stop any running tunnel process regardless of session identity.
    /// Returns whether a process was actually killed.
    async fn kill(&self) -> bool;
}
