#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! botgate library — the reconfiguration core behind the bot-testing front door.
//!
//! The crate exposes the building blocks so embedders can mount their own
//! route collaborators (conversations, attachments, bot state) on the
//! [`routes::RouteRegistry`]:
//!
//! - `controller` — the reconfiguration state machine and published snapshot
//! - `listener` — HTTP listener lifecycle (start / atomic restart)
//! - `tunnel` — ngrok subprocess supervision (connect / disconnect / kill)
//! - `routes` — route registration surface plus the built-in endpoints
//! - `config` — TOML + env-var configuration
//! - `state` — shared handler state (`AppState`)

pub mod config;
pub mod controller;
pub mod listener;
pub mod routes;
pub mod state;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::{FrameworkSettings, Settings};
pub use controller::{ControllerSnapshot, ReconfigController};
pub use listener::{ListenerControl, ListenerManager};
pub use routes::RouteRegistry;
pub use state::AppState;
pub use tunnel::{NgrokSupervisor, TunnelControl};
