//! Server → Client frames and response bodies

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Type tag of the synthesized activity frame
pub const SESSION_ACTIVITY_EVENT: &str = "openchamber:session-activity";
/// Type tag of the synthesized heartbeat frame
pub const HEARTBEAT_EVENT: &str = "openchamber:heartbeat";

/// Frames the host injects into relayed agent event streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SynthesizedEvent {
    #[serde(rename = "openchamber:session-activity")]
    SessionActivity { properties: SessionActivityProperties },
    #[serde(rename = "openchamber:heartbeat")]
    Heartbeat { timestamp: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionActivityProperties {
    pub session_id: String,
    pub phase: ActivityPhase,
}

/// Frames on `GET /api/terminal/:id/stream`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalFrame {
    Connected {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Data {
        data: String,
    },
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
}

/// `POST /api/terminal/create` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalResponse {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

/// `POST /api/terminal/force-kill` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceKillResponse {
    pub success: bool,
    pub killed_count: usize,
}

/// Synchronous `POST /api/fs/exec` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResponse {
    pub success: bool,
    pub results: Vec<CommandResult>,
}

/// `202` body for a background exec request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecAccepted {
    pub job_id: String,
    pub status: ExecJobStatus,
}

/// `GET /api/fs/exec/:jobId`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecJobResponse {
    pub job_id: String,
    pub status: ExecJobStatus,
    pub success: bool,
    pub results: Vec<CommandResult>,
}

/// `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub open_code_port: Option<u16>,
    pub open_code_running: bool,
    pub is_open_code_ready: bool,
    pub last_open_code_error: Option<String>,
}

/// Response of config actions that restart the agent process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigActionResponse {
    pub success: bool,
    pub requires_reload: bool,
    pub message: String,
    pub reload_delay_ms: u64,
}

/// `POST /api/opencode/directory`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeDirectoryResponse {
    pub success: bool,
    pub restarted: bool,
    pub path: String,
}

/// Where a locally defined agent, command or skill lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSource {
    pub exists: bool,
    pub path: Option<String>,
    /// Field names defined by this source.
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSources {
    pub md: ConfigSource,
    pub json: ConfigSource,
}

/// `GET /api/config/agents/:name` and `GET /api/config/commands/:name`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEntryInfo {
    pub name: String,
    pub is_built_in: bool,
    pub scope: Option<ConfigScope>,
    pub sources: ConfigSources,
}

/// One entry of `GET /api/config/skills`, also the body of
/// `GET /api/config/skills/:name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillInfo {
    pub name: String,
    pub exists: bool,
    pub path: Option<String>,
    pub scope: Option<ConfigScope>,
    pub description: Option<String>,
    /// Files next to `SKILL.md`, relative to the skill directory.
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillList {
    pub skills: Vec<SkillInfo>,
}

/// `GET /api/config/skills/:name/files/*path`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillFileContent {
    pub path: String,
    pub content: String,
}

/// `GET /api/push/vapid-public-key`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VapidKeyResponse {
    pub public_key: String,
}

/// `GET /api/session-activity`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionActivitySnapshot {
    pub sessions: HashMap<String, ActivityPhase>,
}

/// Generic `{ "ok": true }` acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}
