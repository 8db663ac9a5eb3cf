//! Readiness gate in front of proxied `/api/*` traffic.
//!
//! While the agent restarts, or during the first seconds of a not-ready
//! spell, callers get a 503 they can retry instead of a connection error.
//! Paths served by the host itself stay reachable.

use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::time::Instant;
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;
use crate::supervisor::Readiness;

pub const NOT_READY_GRACE: Duration = Duration::from_secs(10);

/// Prefixes that never wait on the agent.
pub const ALLOWLIST: &[&str] = &[
    "/health",
    "/api/config/settings",
    "/api/config/agents",
    "/api/config/commands",
    "/api/config/skills",
    "/api/config/reload",
    "/api/opencode/directory",
    "/api/openchamber/models-metadata",
    "/api/terminal",
    "/api/fs",
    "/api/push",
    "/api/session-activity",
];

pub fn is_allowlisted(path: &str) -> bool {
    ALLOWLIST.iter().any(|prefix| {
        path == *prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

pub fn should_reject(readiness: Readiness, now: Instant, grace: Duration) -> bool {
    match readiness {
        Readiness::Ready => false,
        Readiness::Restarting => true,
        Readiness::NotReady { since } => {
            since.is_some_and(|since| now.saturating_duration_since(since) < grace)
        }
    }
}

pub async fn readiness_gate(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let path = req.uri().path();
    if !path.starts_with("/api") || is_allowlisted(path) {
        return next.run(req).await;
    }
    let readiness = state.supervisor.readiness();
    if should_reject(readiness, Instant::now(), state.gate_grace) {
        debug!(
            component = "gate",
            event = "gate.request.rejected",
            path = %path,
            readiness = ?readiness,
        );
        return ApiError::Restarting.into_response();
    }
    next.run(req).await
}
