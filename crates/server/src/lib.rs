//! OpenChamber host process.
//!
//! Supervises the OpenCode agent server, proxies and relays its HTTP/SSE API
//! to browser clients, derives session activity, delivers push
//! notifications, and serves PTY terminals over SSE.

pub mod agent_config;
pub mod cmd_status;
pub mod config;
pub mod config_api;
pub mod error;
pub mod exec;
pub mod gate;
pub mod logging;
pub mod models_metadata;
pub mod paths;
pub mod proxy;
pub mod push;
pub mod relay;
pub mod routes;
pub mod settings;
pub mod shell_env;
pub mod state;
pub mod supervisor;
pub mod terminal;
pub mod ui_session;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
