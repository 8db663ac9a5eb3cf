//! HTTP surface of the host process.

use std::path::PathBuf;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use openchamber_protocol::{
    Ack, ConfigActionResponse, CreateTerminalRequest, CreateTerminalResponse, ExecAccepted,
    ExecJobStatus, ExecRequest, ExecResponse, ForceKillRequest, ForceKillResponse,
    HealthResponse, PushSubscribeRequest, PushUnsubscribeRequest, ResizeTerminalRequest,
    SessionActivitySnapshot, VapidKeyResponse, VisibilityRequest,
};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config_api::config_router;
use crate::error::ApiError;
use crate::exec;
use crate::gate::readiness_gate;
use crate::proxy::proxy_handler;
use crate::relay::client::{global_event_response, per_connection_response};
use crate::state::{AppState, RELOAD_DELAY_MS};
use crate::supervisor::ProcessState;
use crate::terminal::stream::viewer_response;
use crate::terminal::{KillTarget, TerminalSession};
use crate::ui_session::{ui_session_middleware, UiSessionToken};

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/event", get(event_stream))
        .route("/api/global/event", get(global_event_stream))
        .route("/api/session-activity", get(session_activity))
        .route(
            "/api/config/settings",
            get(get_settings).put(update_settings),
        )
        .route("/api/config/reload", post(reload_config))
        .merge(config_router())
        .route("/api/terminal/create", post(create_terminal))
        .route("/api/terminal/force-kill", post(force_kill_terminals))
        .route("/api/terminal/{id}", delete(close_terminal))
        .route("/api/terminal/{id}/stream", get(stream_terminal))
        .route("/api/terminal/{id}/input", post(terminal_input))
        .route("/api/terminal/{id}/resize", post(resize_terminal))
        .route("/api/terminal/{id}/restart", post(restart_terminal))
        .route("/api/fs/exec", post(exec_commands))
        .route("/api/fs/exec/{job_id}", get(exec_job))
        .route("/api/push/vapid-public-key", get(vapid_public_key))
        .route(
            "/api/push/subscribe",
            post(push_subscribe).delete(push_unsubscribe),
        )
        .route("/api/push/visibility", post(push_visibility))
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(state.clone(), readiness_gate))
        .layer(middleware::from_fn(ui_session_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let handle = state.supervisor.snapshot();
    Json(HealthResponse {
        status: "ok".into(),
        open_code_port: handle.port,
        open_code_running: handle.port.is_some() && handle.state != ProcessState::Exited,
        is_open_code_ready: handle.is_ready(),
        last_open_code_error: handle.last_error.clone(),
    })
}

// Events

async fn event_stream(State(state): State<AppState>, uri: Uri) -> Result<Response, ApiError> {
    per_connection_response(
        &state.supervisor,
        state.relay.clone(),
        &state.http,
        uri.path(),
        uri.query(),
    )
    .await
}

async fn global_event_stream(State(state): State<AppState>) -> Response {
    global_event_response(state.relay.clone())
}

async fn session_activity(State(state): State<AppState>) -> Json<SessionActivitySnapshot> {
    Json(SessionActivitySnapshot {
        sessions: state.relay.activity_snapshot(),
    })
}

// Config

async fn get_settings(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.settings.load().await?))
}

async fn update_settings(
    State(state): State<AppState>,
    Json(changes): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.settings.update(&changes).await?))
}

async fn reload_config(State(state): State<AppState>) -> Result<Json<ConfigActionResponse>, ApiError> {
    info!(
        component = "config",
        event = "config.reload.requested",
        "Restarting OpenCode to pick up configuration changes"
    );
    state.supervisor.restart("config-reload").await?;
    Ok(Json(ConfigActionResponse {
        success: true,
        requires_reload: true,
        message: "OpenCode restarted with the new configuration".into(),
        reload_delay_ms: RELOAD_DELAY_MS,
    }))
}

// Terminals

fn created(session: &TerminalSession) -> Json<CreateTerminalResponse> {
    let (cols, rows) = session.size();
    Json(CreateTerminalResponse {
        session_id: session.id.clone(),
        cols,
        rows,
    })
}

fn required_cwd(cwd: Option<String>) -> Result<PathBuf, ApiError> {
    cwd.map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| ApiError::Validation("cwd is required".into()))
}

async fn create_terminal(
    State(state): State<AppState>,
    Json(req): Json<CreateTerminalRequest>,
) -> Result<Json<CreateTerminalResponse>, ApiError> {
    let cwd = required_cwd(req.cwd)?;
    let session = state.terminals.create(
        &cwd,
        req.cols.unwrap_or(DEFAULT_COLS),
        req.rows.unwrap_or(DEFAULT_ROWS),
    )
    .await?;
    Ok(created(&session))
}

async fn stream_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = state.terminals.get(&id)?;
    let viewer = session.attach();
    Ok(viewer_response(
        session,
        viewer,
        state.terminals.config().heartbeat,
    ))
}

async fn terminal_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Ack>, ApiError> {
    state.terminals.input(&id, body).await?;
    Ok(Json(Ack::ok()))
}

async fn resize_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeTerminalRequest>,
) -> Result<Json<Ack>, ApiError> {
    state.terminals.resize(&id, req.cols, req.rows)?;
    Ok(Json(Ack::ok()))
}

async fn close_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Ack>, ApiError> {
    state.terminals.close(&id)?;
    Ok(Json(Ack::ok()))
}

async fn restart_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CreateTerminalRequest>,
) -> Result<Json<CreateTerminalResponse>, ApiError> {
    let cwd = required_cwd(req.cwd)?;
    let session = state.terminals.restart(
        &id,
        &cwd,
        req.cols.unwrap_or(DEFAULT_COLS),
        req.rows.unwrap_or(DEFAULT_ROWS),
    )
    .await?;
    Ok(created(&session))
}

/// An empty body kills every session.
async fn force_kill_terminals(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ForceKillResponse>, ApiError> {
    let req: ForceKillRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ForceKillRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::Validation(e.to_string()))?
    };
    let target = match (req.session_id, req.cwd) {
        (Some(id), _) => KillTarget::Session(id),
        (None, Some(cwd)) => KillTarget::Cwd(PathBuf::from(cwd)),
        (None, None) => KillTarget::All,
    };
    let killed_count = state.terminals.force_kill(&target);
    Ok(Json(ForceKillResponse {
        success: true,
        killed_count,
    }))
}

// Exec

async fn exec_commands(
    State(state): State<AppState>,
    Json(req): Json<ExecRequest>,
) -> Result<Response, ApiError> {
    let commands: Vec<String> = req
        .commands
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if commands.is_empty() {
        return Err(ApiError::Validation("commands must not be empty".into()));
    }
    let cwd = match req.cwd.filter(|c| !c.trim().is_empty()) {
        Some(cwd) => PathBuf::from(cwd),
        None => dirs::home_dir()
            .ok_or_else(|| ApiError::Validation("cwd is required".into()))?,
    };
    if !cwd.is_dir() {
        return Err(ApiError::Validation(format!(
            "working directory does not exist: {}",
            cwd.display()
        )));
    }

    if req.background {
        let job_id = state.exec_jobs.submit(commands, cwd);
        let body = ExecAccepted {
            job_id,
            status: ExecJobStatus::Queued,
        };
        return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
    }

    let results = exec::run_batch(&commands, &cwd, state.exec_jobs.command_timeout()).await;
    Ok(Json(ExecResponse {
        success: exec::all_succeeded(&results),
        results,
    })
    .into_response())
}

async fn exec_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state
        .exec_jobs
        .get(&job_id)
        .ok_or_else(|| ApiError::NotFound(format!("exec job {job_id} not found")))?;
    Ok(Json(job.to_response()).into_response())
}

// Push

async fn vapid_public_key(State(state): State<AppState>) -> Json<VapidKeyResponse> {
    Json(VapidKeyResponse {
        public_key: state.vapid_public_key.to_string(),
    })
}

async fn push_subscribe(
    State(state): State<AppState>,
    Extension(token): Extension<UiSessionToken>,
    Json(req): Json<PushSubscribeRequest>,
) -> Result<Json<Ack>, ApiError> {
    if req.endpoint.trim().is_empty() {
        return Err(ApiError::Validation("endpoint is required".into()));
    }
    state
        .push_store
        .subscribe(token.as_str(), &req.endpoint, req.keys)
        .await?;
    Ok(Json(Ack::ok()))
}

async fn push_unsubscribe(
    State(state): State<AppState>,
    Extension(token): Extension<UiSessionToken>,
    Json(req): Json<PushUnsubscribeRequest>,
) -> Result<Json<Ack>, ApiError> {
    state
        .push_store
        .unsubscribe(token.as_str(), &req.endpoint)
        .await?;
    Ok(Json(Ack::ok()))
}

async fn push_visibility(
    State(state): State<AppState>,
    Extension(token): Extension<UiSessionToken>,
    Json(req): Json<VisibilityRequest>,
) -> Json<Ack> {
    state.visibility.report(token.as_str(), req.visible);
    Json(Ack::ok())
}
