//! HTTP-facing error taxonomy.
//!
//! Subsystems keep their own error enums; everything that crosses an HTTP
//! boundary is converted into [`ApiError`], which owns the status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::agent_config::ConfigError;
use crate::push::PushError;
use crate::settings::SettingsError;
use crate::supervisor::{StartupError, SupervisorError};
use crate::terminal::TerminalError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    CapacityExceeded(String),

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    /// The agent is mid-restart or not yet ready.
    #[error("OpenCode is restarting")]
    Restarting,

    /// Upstream refused the connection or is not running.
    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Startup(#[from] StartupError),

    /// A third-party service the host calls on the UI's behalf failed.
    #[error("{0}")]
    BadGateway(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::CapacityExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Restarting | ApiError::Unavailable(_) | ApiError::Startup(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Restarting => json!({ "error": self.to_string(), "restarting": true }),
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

impl From<TerminalError> for ApiError {
    fn from(err: TerminalError) -> Self {
        match err {
            TerminalError::SessionNotFound(_) => ApiError::NotFound(err.to_string()),
            TerminalError::CapacityExceeded { .. } => ApiError::CapacityExceeded(err.to_string()),
            TerminalError::InvalidCwd(_) => ApiError::Validation(err.to_string()),
            TerminalError::Pty(_) | TerminalError::Io(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::Startup(inner) => ApiError::Startup(inner),
            SupervisorError::ShuttingDown => ApiError::Unavailable(err.to_string()),
            SupervisorError::RestartFailed(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<SettingsError> for ApiError {
    fn from(err: SettingsError) -> Self {
        match err {
            SettingsError::NotAnObject => ApiError::Validation(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidName(_) | ConfigError::InvalidPath(_) => {
                ApiError::Validation(err.to_string())
            }
            ConfigError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ConfigError::AlreadyExists(_) => ApiError::Conflict(err.to_string()),
            ConfigError::Yaml { .. } | ConfigError::Json { .. } | ConfigError::Io(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<PushError> for ApiError {
    fn from(err: PushError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_taxonomy_to_status_codes() {
        assert_eq!(
            ApiError::Validation("cwd is required".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(TerminalError::SessionNotFound("t1".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(TerminalError::CapacityExceeded { max: 20 }).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(ApiError::Restarting.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ApiError::from(ConfigError::AlreadyExists("Agent docs".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(ConfigError::InvalidPath("../x".into())).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
