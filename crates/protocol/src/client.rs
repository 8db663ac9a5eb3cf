//! Client → Server request bodies

use serde::{Deserialize, Serialize};

use crate::types::SubscriptionKeys;

/// `POST /api/terminal/create` and `POST /api/terminal/:id/restart`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTerminalRequest {
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

/// `POST /api/terminal/:id/resize`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeTerminalRequest {
    pub cols: u16,
    pub rows: u16,
}

/// `POST /api/terminal/force-kill`
///
/// With neither field set every terminal session is killed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceKillRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// `POST /api/fs/exec`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub background: bool,
}

/// `POST /api/push/subscribe`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscribeRequest {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

/// `DELETE /api/push/subscribe`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushUnsubscribeRequest {
    pub endpoint: String,
}

/// `POST /api/push/visibility`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibilityRequest {
    pub visible: bool,
}

/// `POST /api/opencode/directory`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeDirectoryRequest {
    #[serde(default)]
    pub path: String,
}

/// `PUT /api/config/skills/:name/files/*path`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillFileWrite {
    pub content: String,
}
