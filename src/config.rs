//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `BOTGATE_PORT`, `BOTGATE_NGROK_PATH`
//! 2. **Config file** — path via `--config <path>`, or `botgate.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [framework]
//! port = 3000
//! ngrok_path = "/usr/local/bin/ngrok"  # empty or omitted = tunneling disabled
//! base_path = ""                       # e.g. "/emulator" to nest all routes
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Loading validates before returning, so a [`Settings`] value in hand is
//! always well-formed. A failed reload (SIGHUP) is rejected here and the
//! previously applied configuration stays in effect.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub framework: FrameworkSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Listener and tunnel settings — the fields the reconfiguration controller
/// compares by value against the last-applied configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FrameworkSettings {
    /// TCP port the HTTP listener binds on `127.0.0.1` (default 3000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to the ngrok binary. Empty (the default) disables tunneling and
    /// the service is reachable only via `http://localhost:<port>`.
    #[serde(default)]
    pub ngrok_path: String,
    /// Base path all routes are nested under (default: serve at the root).
    /// Lets several services share a process without route collisions.
    #[serde(default)]
    pub base_path: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_port() -> u16 {
    3000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for FrameworkSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            ngrok_path: String::new(),
            base_path: String::new(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Configuration errors — all rejected before any state mutation, so the
/// previously applied configuration remains in effect.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    Io(String),
    /// The config file could not be parsed as TOML.
    Parse(String),
    /// The port is outside 1–65535.
    InvalidPort(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {e}"),
            ConfigError::Parse(e) => write!(f, "Failed to parse config file: {e}"),
            ConfigError::InvalidPort(p) => write!(f, "Invalid port: {p}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Settings {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `botgate.toml` in the current directory, falling back to compiled
    /// defaults. The result is validated before it is returned.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut settings = if let Some(p) = path {
            Self::from_file(p)?
        } else if Path::new("botgate.toml").exists() {
            Self::from_file("botgate.toml")?
        } else {
            Settings::default()
        };

        // Env var overrides
        if let Ok(port) = std::env::var("BOTGATE_PORT") {
            settings.framework.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port.clone()))?;
        }
        if let Ok(ngrok_path) = std::env::var("BOTGATE_NGROK_PATH") {
            settings.framework.ngrok_path = ngrok_path;
        }

        settings.validate()?;
        Ok(settings)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{path}: {e}")))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(format!("{path}: {e}")))
    }

    /// Reject malformed configuration before it reaches the controller.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.framework.port == 0 {
            return Err(ConfigError::InvalidPort("0".to_string()));
        }
        Ok(())
    }
}
