//! Host-served config endpoints: local agent, command and skill
//! definitions, the active directory, and the model catalog.

use std::collections::HashMap;
use std::path::PathBuf;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::request::Parts,
    routing::{get, post, MethodRouter},
    Json, Router,
};
use openchamber_protocol::{
    ChangeDirectoryRequest, ChangeDirectoryResponse, ConfigActionResponse, ConfigEntryInfo,
    ConfigScope, SkillFileContent, SkillFileWrite, SkillInfo, SkillList,
};
use serde_json::{Map, Value};
use tracing::info;

use crate::agent_config::{ConfigError, EntryKind};
use crate::error::ApiError;
use crate::paths::expand_tilde;
use crate::settings::active_directory;
use crate::state::{AppState, RELOAD_DELAY_MS};

pub const DIRECTORY_HEADER: &str = "x-opencode-directory";

pub fn config_router() -> Router<AppState> {
    Router::new()
        .route("/api/config/agents/{name}", entry_routes(EntryKind::Agent))
        .route("/api/config/commands/{name}", entry_routes(EntryKind::Command))
        .route("/api/config/skills", get(list_skills))
        .route(
            "/api/config/skills/{name}",
            get(get_skill)
                .post(create_skill)
                .patch(update_skill)
                .delete(delete_skill),
        )
        .route(
            "/api/config/skills/{name}/files/{*path}",
            get(read_skill_file)
                .put(write_skill_file)
                .delete(delete_skill_file),
        )
        .route("/api/opencode/directory", post(change_directory))
        .route("/api/openchamber/models-metadata", get(models_metadata))
}

/// Project directory a config request applies to.
///
/// Taken from the `x-opencode-directory` header, then the `directory` query
/// parameter, then the active project in settings.
pub struct ProjectDir(pub PathBuf);

impl FromRequestParts<AppState> for ProjectDir {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let explicit = parts
            .headers
            .get(DIRECTORY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| {
                Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
                    .ok()
                    .and_then(|Query(mut query)| query.remove("directory"))
            })
            .filter(|dir| !dir.trim().is_empty());

        let dir = match explicit {
            Some(dir) => Some(expand_tilde(dir.trim())),
            None => active_directory(&state.settings.load().await?),
        };
        dir.map(ProjectDir).ok_or_else(|| {
            ApiError::Validation("Directory parameter or active project is required".into())
        })
    }
}

/// Config files are small; the blocking pool keeps their IO off the runtime.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ConfigError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::from)
}

fn requested_scope(body: &Map<String, Value>) -> Result<ConfigScope, ApiError> {
    match body.get("scope") {
        None | Some(Value::Null) => Ok(ConfigScope::default()),
        Some(scope) => serde_json::from_value(scope.clone())
            .map_err(|_| ApiError::Validation(format!("invalid scope: {scope}"))),
    }
}

/// Restart the agent so it picks up the change, then tell the UI to reload.
async fn restart_for(state: &AppState, message: String) -> Result<Json<ConfigActionResponse>, ApiError> {
    info!(
        component = "config",
        event = "config.change.restart",
        detail = %message,
    );
    state.supervisor.restart("config-change").await?;
    Ok(Json(ConfigActionResponse {
        success: true,
        requires_reload: true,
        message: format!("{message} Reloading interface..."),
        reload_delay_ms: RELOAD_DELAY_MS,
    }))
}

// Agents and commands

type Name = Path<String>;
type Body = Json<Map<String, Value>>;

fn entry_routes(kind: EntryKind) -> MethodRouter<AppState> {
    get(move |state: State<AppState>, dir: ProjectDir, name: Name| {
        describe_entry(kind, state, dir, name)
    })
    .post(move |state: State<AppState>, dir: ProjectDir, name: Name, body: Body| {
        create_entry(kind, state, dir, name, body)
    })
    .patch(move |state: State<AppState>, dir: ProjectDir, name: Name, body: Body| {
        update_entry(kind, state, dir, name, body)
    })
    .delete(move |state: State<AppState>, dir: ProjectDir, name: Name| {
        delete_entry(kind, state, dir, name)
    })
}

async fn describe_entry(
    kind: EntryKind,
    State(state): State<AppState>,
    ProjectDir(dir): ProjectDir,
    Path(name): Path<String>,
) -> Result<Json<ConfigEntryInfo>, ApiError> {
    let roots = state.config_roots.clone();
    Ok(Json(blocking(move || roots.describe(kind, &name, &dir)).await?))
}

async fn create_entry(
    kind: EntryKind,
    State(state): State<AppState>,
    ProjectDir(dir): ProjectDir,
    Path(name): Path<String>,
    Json(body): Json<Map<String, Value>>,
) -> Result<Json<ConfigActionResponse>, ApiError> {
    let scope = requested_scope(&body)?;
    let roots = state.config_roots.clone();
    let entry = name.clone();
    blocking(move || roots.create(kind, &entry, scope, &body, &dir)).await?;
    restart_for(&state, format!("{} {name} created successfully.", kind.label())).await
}

async fn update_entry(
    kind: EntryKind,
    State(state): State<AppState>,
    ProjectDir(dir): ProjectDir,
    Path(name): Path<String>,
    Json(body): Json<Map<String, Value>>,
) -> Result<Json<ConfigActionResponse>, ApiError> {
    let roots = state.config_roots.clone();
    let entry = name.clone();
    blocking(move || roots.update(kind, &entry, &body, &dir)).await?;
    restart_for(&state, format!("{} {name} updated successfully.", kind.label())).await
}

async fn delete_entry(
    kind: EntryKind,
    State(state): State<AppState>,
    ProjectDir(dir): ProjectDir,
    Path(name): Path<String>,
) -> Result<Json<ConfigActionResponse>, ApiError> {
    let roots = state.config_roots.clone();
    let entry = name.clone();
    blocking(move || roots.delete(kind, &entry, &dir)).await?;
    restart_for(&state, format!("{} {name} deleted successfully.", kind.label())).await
}

// Skills

async fn list_skills(
    State(state): State<AppState>,
    ProjectDir(dir): ProjectDir,
) -> Result<Json<SkillList>, ApiError> {
    let roots = state.config_roots.clone();
    let skills = blocking(move || roots.list_skills(&dir)).await?;
    Ok(Json(SkillList { skills }))
}

async fn get_skill(
    State(state): State<AppState>,
    ProjectDir(dir): ProjectDir,
    Path(name): Path<String>,
) -> Result<Json<SkillInfo>, ApiError> {
    let roots = state.config_roots.clone();
    Ok(Json(blocking(move || roots.skill(&name, &dir)).await?))
}

async fn create_skill(
    State(state): State<AppState>,
    ProjectDir(dir): ProjectDir,
    Path(name): Path<String>,
    Json(body): Json<Map<String, Value>>,
) -> Result<Json<ConfigActionResponse>, ApiError> {
    let scope = requested_scope(&body)?;
    let roots = state.config_roots.clone();
    let skill = name.clone();
    blocking(move || roots.create_skill(&skill, scope, &body, &dir)).await?;
    restart_for(&state, format!("Skill {name} created successfully.")).await
}

async fn update_skill(
    State(state): State<AppState>,
    ProjectDir(dir): ProjectDir,
    Path(name): Path<String>,
    Json(body): Json<Map<String, Value>>,
) -> Result<Json<ConfigActionResponse>, ApiError> {
    let roots = state.config_roots.clone();
    let skill = name.clone();
    blocking(move || roots.update_skill(&skill, &body, &dir)).await?;
    restart_for(&state, format!("Skill {name} updated successfully.")).await
}

async fn delete_skill(
    State(state): State<AppState>,
    ProjectDir(dir): ProjectDir,
    Path(name): Path<String>,
) -> Result<Json<ConfigActionResponse>, ApiError> {
    let roots = state.config_roots.clone();
    let skill = name.clone();
    blocking(move || roots.delete_skill(&skill, &dir)).await?;
    restart_for(&state, format!("Skill {name} deleted successfully.")).await
}

async fn read_skill_file(
    State(state): State<AppState>,
    ProjectDir(dir): ProjectDir,
    Path((name, path)): Path<(String, String)>,
) -> Result<Json<SkillFileContent>, ApiError> {
    let roots = state.config_roots.clone();
    let rel = path.clone();
    let content = blocking(move || roots.read_skill_file(&name, &rel, &dir)).await?;
    Ok(Json(SkillFileContent { path, content }))
}

/// Supporting files are read on demand, so edits need no restart.
async fn write_skill_file(
    State(state): State<AppState>,
    ProjectDir(dir): ProjectDir,
    Path((name, path)): Path<(String, String)>,
    Json(body): Json<SkillFileWrite>,
) -> Result<Json<ConfigActionResponse>, ApiError> {
    let roots = state.config_roots.clone();
    let rel = path.clone();
    blocking(move || roots.write_skill_file(&name, &rel, &body.content, &dir)).await?;
    Ok(Json(ConfigActionResponse {
        success: true,
        requires_reload: false,
        message: format!("File {path} saved."),
        reload_delay_ms: 0,
    }))
}

async fn delete_skill_file(
    State(state): State<AppState>,
    ProjectDir(dir): ProjectDir,
    Path((name, path)): Path<(String, String)>,
) -> Result<Json<ConfigActionResponse>, ApiError> {
    let roots = state.config_roots.clone();
    let rel = path.clone();
    blocking(move || roots.delete_skill_file(&name, &rel, &dir)).await?;
    Ok(Json(ConfigActionResponse {
        success: true,
        requires_reload: false,
        message: format!("File {path} deleted."),
        reload_delay_ms: 0,
    }))
}

// Directory

/// Relative paths resolve against the home directory.
async fn change_directory(
    State(state): State<AppState>,
    Json(req): Json<ChangeDirectoryRequest>,
) -> Result<Json<ChangeDirectoryResponse>, ApiError> {
    let raw = req.path.trim();
    if raw.is_empty() {
        return Err(ApiError::Validation("Path is required".into()));
    }
    let mut path = expand_tilde(raw);
    if path.is_relative() {
        let home = dirs::home_dir()
            .ok_or_else(|| ApiError::Internal("HOME directory not found".into()))?;
        path = home.join(path);
    }
    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|_| ApiError::NotFound(format!("Directory not found: {}", path.display())))?;
    if !metadata.is_dir() {
        return Err(ApiError::Validation(format!(
            "Not a directory: {}",
            path.display()
        )));
    }
    let path = tokio::fs::canonicalize(&path)
        .await
        .map_err(ApiError::internal)?;

    state.settings.open_directory(&path).await?;
    Ok(Json(ChangeDirectoryResponse {
        success: true,
        restarted: false,
        path: path.display().to_string(),
    }))
}

// Models

async fn models_metadata(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.models.get().await?))
}
