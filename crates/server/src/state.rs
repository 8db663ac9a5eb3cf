//! Application state shared by every handler.

use std::sync::Arc;
use std::time::Duration;

use crate::agent_config::ConfigRoots;
use crate::exec::ExecJobs;
use crate::models_metadata::ModelsMetadata;
use crate::push::{SubscriptionStore, VisibilityTracker};
use crate::relay::EventRelay;
use crate::settings::SettingsStore;
use crate::supervisor::Supervisor;
use crate::terminal::TerminalManager;

/// Delay the UI waits before reloading after a config action restarts the agent.
pub const RELOAD_DELAY_MS: u64 = 800;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub relay: Arc<EventRelay>,
    pub terminals: Arc<TerminalManager>,
    pub exec_jobs: Arc<ExecJobs>,
    pub settings: Arc<SettingsStore>,
    /// Where local agent, command and skill definitions are read and written.
    pub config_roots: ConfigRoots,
    pub models: Arc<ModelsMetadata>,
    pub push_store: Arc<SubscriptionStore>,
    pub visibility: Arc<VisibilityTracker>,
    pub vapid_public_key: Arc<str>,
    /// Client for agent traffic (proxy, per-connection event streams).
    pub http: reqwest::Client,
    /// How long a fresh not-ready spell answers 503 instead of proxying.
    pub gate_grace: Duration,
}
