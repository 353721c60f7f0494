#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # botgate
//!
//! Local HTTP front door for a bot-testing tool.
//!
//! botgate serves an emulated messaging REST surface on localhost and keeps
//! it reachable from the public internet by supervising an ngrok subprocess.
//! Configuration changes (port, ngrok binary path) are applied live: the
//! listener restarts and the tunnel is torn down and relaunched in the right
//! order, without leaking processes or publishing stale URLs.
//!
//! ## Subcommands
//!
//! - `botgate serve` (default) — run the front door
//!
//! ## Built-in endpoints
//!
//! | Method | Path      | Description                                   |
//! |--------|-----------|-----------------------------------------------|
//! | GET    | `/health` | Liveness, uptime, tunnel status               |
//! | GET    | `/info`   | Published service/inspect URLs, applied config |
//!
//! Route collaborators (conversations, attachments, bot state) mount their
//! own fragments on the [`RouteRegistry`] before the listener starts.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, SIGHUP reload, shutdown
//! config.rs        — TOML + env-var configuration
//! controller.rs    — reconfiguration state machine, published snapshot
//! listener.rs      — HTTP listener lifecycle (bind, atomic restart)
//! routes/
//!   mod.rs         — RouteRegistry (fragment registration, router build)
//!   health.rs      — GET /health
//!   info.rs        — GET /info
//! state.rs         — AppState (snapshot reader for handlers)
//! tunnel/
//!   mod.rs         — tunnel types, TunnelControl trait
//!   ngrok.rs       — ngrok subprocess supervision
//! ```
//!
//! On SIGHUP the config file is reloaded and pushed to the controller; an
//! invalid file is rejected and the previous configuration stays in effect.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use botgate::config::Settings;
use botgate::controller::{ControllerSnapshot, ReconfigController};
use botgate::listener::ListenerManager;
use botgate::routes::{self, RouteRegistry};
use botgate::state::AppState;
use botgate::tunnel::{NgrokSupervisor, TunnelControl};

/// Local HTTP front door for bot testing.
#[derive(Parser)]
#[command(name = "botgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the front door (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let settings = match Settings::load(config_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| settings.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("botgate v{} starting", env!("CARGO_PKG_VERSION"));

    let initial = settings.framework.clone();
    let (snapshot_tx, snapshot_rx) =
        watch::channel(ControllerSnapshot::local(initial.port, initial.ngrok_path.clone()));
    let state = AppState::new(snapshot_rx);

    let registry = Arc::new(RouteRegistry::new(initial.base_path.clone()));
    registry.mount(routes::builtin_router());

    let listener = ListenerManager::new(registry, state);
    let supervisor = NgrokSupervisor::new();
    let mut controller = ReconfigController::new(listener, supervisor.clone(), snapshot_tx);

    // First apply is loud: without a listener there is no service.
    if let Err(e) = controller.apply(initial).await {
        error!("failed to start listener: {e}");
        std::process::exit(1);
    }

    let (settings_tx, settings_rx) = mpsc::channel::<Settings>(16);
    let controller_task = tokio::spawn(controller.run(settings_rx));

    // SIGHUP reloads the config file and pushes the result to the controller.
    #[cfg(unix)]
    let reload_task = {
        let path = config_path.map(ToString::to_string);
        let tx = settings_tx.clone();
        tokio::spawn(async move {
            let mut sighup =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                    .expect("Failed to register SIGHUP");
            while sighup.recv().await.is_some() {
                match Settings::load(path.as_deref()) {
                    Ok(reloaded) => {
                        info!("configuration reloaded");
                        if tx.send(reloaded).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("ignoring configuration reload: {e}"),
                }
            }
        })
    };

    // Graceful shutdown
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }

    info!("Shutting down...");
    drop(settings_tx);
    controller_task.abort();
    #[cfg(unix)]
    reload_task.abort();
    if supervisor.kill().await {
        info!("killed tunnel process");
    }
    info!("Goodbye");
}
