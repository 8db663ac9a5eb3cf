//! Persisted UI settings (`settings.json`).
//!
//! Updates are a read-modify-write of the whole file under one async lock.
//! Two concurrent `PUT`s touching different keys both land.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::paths::expand_tilde;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings update must be a JSON object")]
    NotAnObject,
    #[error("settings file is not a JSON object")]
    Corrupt,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

const APPROVED_DIRECTORIES: &str = "approvedDirectories";

pub struct SettingsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<Map<String, Value>, SettingsError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Map::new());
        }
        match serde_json::from_slice(&bytes)? {
            Value::Object(map) => Ok(map),
            _ => Err(SettingsError::Corrupt),
        }
    }

    async fn write(&self, settings: &Map<String, Value>) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(settings)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn load(&self) -> Result<Value, SettingsError> {
        let _guard = self.lock.lock().await;
        Ok(Value::Object(self.read().await?))
    }

    /// Merge `changes` into the stored settings and return the result.
    pub async fn update(&self, changes: &Value) -> Result<Value, SettingsError> {
        let changes = sanitize_update(changes.as_object().ok_or(SettingsError::NotAnObject)?);
        let _guard = self.lock.lock().await;
        let current = self.read().await?;
        let merged = merge_settings(&current, &changes);
        if merged == current {
            debug!(
                component = "settings",
                event = "settings.update.unchanged",
            );
        } else {
            self.write(&merged).await?;
            info!(
                component = "settings",
                event = "settings.update.written",
                keys = changes.len(),
                "Settings updated"
            );
        }
        Ok(Value::Object(merged))
    }

    /// Make `dir` the active project, registering it first if no project
    /// has that path yet.
    pub async fn open_directory(&self, dir: &Path) -> Result<Value, SettingsError> {
        let dir = dir.to_string_lossy().into_owned();
        let _guard = self.lock.lock().await;
        let current = self.read().await?;
        let now = now_ms();

        let mut projects = match current.get("projects") {
            Some(Value::Array(projects)) => projects.clone(),
            _ => Vec::new(),
        };
        let existing = projects
            .iter_mut()
            .find(|p| p.get("path").and_then(Value::as_str) == Some(dir.as_str()));
        let project_id = match existing {
            Some(Value::Object(project)) => {
                project.insert("lastOpenedAt".into(), json!(now));
                project
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            }
            _ => {
                let id = openchamber_protocol::new_id();
                projects.push(json!({
                    "id": id,
                    "path": dir,
                    "addedAt": now,
                    "lastOpenedAt": now,
                }));
                id
            }
        };

        let mut changes = Map::new();
        changes.insert("projects".into(), Value::Array(projects));
        changes.insert("activeProjectId".into(), json!(project_id));
        changes.insert("lastDirectory".into(), json!(dir));
        let merged = merge_settings(&current, &changes);
        self.write(&merged).await?;
        info!(
            component = "settings",
            event = "settings.directory.opened",
            directory = %dir,
            project_id = %project_id,
            "Active directory changed"
        );
        Ok(Value::Object(merged))
    }
}

/// The active project's path, else the first project's, else `lastDirectory`.
pub fn active_directory(settings: &Value) -> Option<PathBuf> {
    let projects = settings.get("projects").and_then(Value::as_array);
    let project_path = |project: &Value| project.get("path").and_then(Value::as_str).map(str::to_string);
    let active = settings
        .get("activeProjectId")
        .and_then(Value::as_str)
        .and_then(|id| {
            projects?
                .iter()
                .find(|p| p.get("id").and_then(Value::as_str) == Some(id))
        })
        .and_then(project_path);
    active
        .or_else(|| projects?.first().and_then(project_path))
        .or_else(|| {
            settings
                .get("lastDirectory")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .filter(|dir| !dir.trim().is_empty())
        .map(PathBuf::from)
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Trimmed, tilde-expanded directory, or `None` when blank.
fn clean_directory(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let expanded = expand_tilde(value).to_string_lossy().replace('\\', "/");
    if expanded == "/" {
        return Some(expanded);
    }
    Some(expanded.trim_end_matches('/').to_string())
}

/// Normalize directory-valued fields of an incoming update.
///
/// Blank directories are dropped rather than stored. Projects without an id
/// or path are discarded, as are repeats of an earlier id or path.
pub fn sanitize_update(changes: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in changes {
        match key.as_str() {
            "lastDirectory" | "homeDirectory" => {
                if let Some(dir) = value.as_str().and_then(clean_directory) {
                    out.insert(key.clone(), Value::String(dir));
                }
            }
            APPROVED_DIRECTORIES => {
                if let Value::Array(dirs) = value {
                    let dirs = dirs
                        .iter()
                        .filter_map(Value::as_str)
                        .filter_map(clean_directory)
                        .map(Value::String)
                        .collect();
                    out.insert(key.clone(), Value::Array(dirs));
                }
            }
            "projects" => {
                if let Value::Array(projects) = value {
                    out.insert(key.clone(), Value::Array(sanitize_projects(projects)));
                }
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

fn sanitize_projects(projects: &[Value]) -> Vec<Value> {
    let mut seen_ids = HashSet::new();
    let mut seen_paths = HashSet::new();
    let mut out = Vec::new();
    for project in projects {
        let Some(obj) = project.as_object() else {
            continue;
        };
        let id = obj.get("id").and_then(Value::as_str).unwrap_or("").trim();
        let Some(path) = obj.get("path").and_then(Value::as_str).and_then(clean_directory) else {
            continue;
        };
        if id.is_empty() || !seen_ids.insert(id.to_string()) || !seen_paths.insert(path.clone()) {
            continue;
        }
        let mut obj = obj.clone();
        obj.insert("id".into(), json!(id));
        obj.insert("path".into(), json!(path));
        out.push(Value::Object(obj));
    }
    out
}

/// Shallow merge of top-level keys, one level deeper for objects, then the
/// approved directory list is widened with every directory the settings
/// reference.
pub fn merge_settings(current: &Map<String, Value>, changes: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = current.clone();
    for (key, value) in changes {
        match (merged.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(update)) => {
                for (inner_key, inner_value) in update {
                    existing.insert(inner_key.clone(), inner_value.clone());
                }
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }

    let mut approved = Vec::new();
    let mut push = |dir: &str| {
        let dir = dir.trim();
        if !dir.is_empty() && !approved.iter().any(|d: &String| d == dir) {
            approved.push(dir.to_string());
        }
    };
    if let Some(Value::Array(dirs)) = merged.get(APPROVED_DIRECTORIES) {
        dirs.iter().filter_map(Value::as_str).for_each(&mut push);
    }
    for key in ["lastDirectory", "homeDirectory"] {
        if let Some(Value::String(dir)) = changes.get(key) {
            push(dir);
        }
    }
    if let Some(Value::Array(projects)) = merged.get("projects") {
        projects
            .iter()
            .filter_map(|p| p.get("path").and_then(Value::as_str))
            .for_each(&mut push);
    }

    if !approved.is_empty() || merged.contains_key(APPROVED_DIRECTORIES) {
        merged.insert(
            APPROVED_DIRECTORIES.to_string(),
            Value::Array(approved.into_iter().map(Value::String).collect()),
        );
    }
    merged
}
