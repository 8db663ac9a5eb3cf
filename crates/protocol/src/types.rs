//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

/// Derived activity phase of an agent session.
///
/// Transitions run `idle → busy → cooldown → idle`; `cooldown` may be
/// re-entered from `busy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityPhase {
    Idle,
    Busy,
    Cooldown,
}

impl ActivityPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityPhase::Idle => "idle",
            ActivityPhase::Busy => "busy",
            ActivityPhase::Cooldown => "cooldown",
        }
    }
}

/// Which config root a locally defined agent, command or skill lives under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigScope {
    #[default]
    User,
    Project,
}

/// Lifecycle of a background exec job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecJobStatus {
    Queued,
    Running,
    Done,
}

/// Outcome of a single shell command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn failed(command: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            success: false,
            exit_code: None,
            stdout: None,
            stderr: None,
            error: Some(error.into()),
        }
    }
}

/// What a push notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Ready,
    Question,
    Permission,
}

impl NotificationKind {
    /// Kinds that do not ask the user for anything and can be skipped while
    /// a UI is in the foreground.
    pub fn is_passive(&self) -> bool {
        matches!(self, NotificationKind::Ready)
    }
}

/// Deep-link data attached to a push notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushData {
    pub url: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
}

/// Payload delivered to the browser service worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub tag: String,
    pub data: PushData,
}

impl PushPayload {
    pub fn for_session(
        kind: NotificationKind,
        session_id: &str,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            tag: format!("openchamber-{}-{}", kind_tag(kind), session_id),
            data: PushData {
                url: format!("/?session={session_id}"),
                session_id: session_id.to_string(),
                kind,
            },
        }
    }
}

fn kind_tag(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::Ready => "ready",
        NotificationKind::Question => "question",
        NotificationKind::Permission => "permission",
    }
}

/// Browser push subscription keys, as produced by `PushSubscription.toJSON()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}
