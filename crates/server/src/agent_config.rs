//! Locally defined agents, commands and skills.
//!
//! Agents and commands live either as markdown files with YAML frontmatter
//! (`<root>/agent/<name>.md`, `<root>/command/<name>.md`) or as entries under
//! the `agent` / `command` keys of `opencode.json`. A skill is a directory
//! `<root>/skill/<name>/` holding `SKILL.md` and any supporting files.
//!
//! The user root is `$XDG_CONFIG_HOME/opencode` (default `~/.config/opencode`).
//! A project's root is `<project>/.opencode`, and its `opencode.json` sits at
//! the project top level. Project definitions shadow user ones.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use openchamber_protocol::{ConfigEntryInfo, ConfigScope, ConfigSource, ConfigSources, SkillInfo};
use serde_json::{Map, Value};
use tracing::info;

const SKILL_FILE: &str = "SKILL.md";
const SKILL_BODY_FIELD: &str = "instructions";
const CONFIG_JSON: &str = "opencode.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid name: {0:?}")]
    InvalidName(String),
    #[error("invalid file path: {0:?}")]
    InvalidPath(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("malformed frontmatter in {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("malformed {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Agent,
    Command,
}

impl EntryKind {
    fn key(self) -> &'static str {
        match self {
            EntryKind::Agent => "agent",
            EntryKind::Command => "command",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EntryKind::Agent => "Agent",
            EntryKind::Command => "Command",
        }
    }

    /// Field stored as the markdown body instead of frontmatter.
    fn body_field(self) -> &'static str {
        match self {
            EntryKind::Agent => "prompt",
            EntryKind::Command => "template",
        }
    }

    fn built_ins(self) -> &'static [&'static str] {
        match self {
            EntryKind::Agent => &["build", "plan", "general"],
            EntryKind::Command => &[],
        }
    }
}

/// Markdown split into frontmatter fields and body.
#[derive(Debug, Default, Clone, PartialEq)]
struct MarkdownDoc {
    fields: Map<String, Value>,
    body: String,
}

impl MarkdownDoc {
    fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        let Some(rest) = text
            .strip_prefix("---\n")
            .or_else(|| text.strip_prefix("---\r\n"))
        else {
            return Ok(Self {
                fields: Map::new(),
                body: text.to_string(),
            });
        };
        let (yaml, body) = match rest.find("\n---") {
            Some(end) => {
                let after = &rest[end + 4..];
                let body = after
                    .strip_prefix("\r\n")
                    .or_else(|| after.strip_prefix('\n'))
                    .unwrap_or(after);
                (&rest[..end], body)
            }
            None => (rest, ""),
        };
        let fields = if yaml.trim().is_empty() {
            Map::new()
        } else {
            match serde_yaml::from_str::<Value>(yaml) {
                Ok(Value::Object(fields)) => fields,
                Ok(_) => Map::new(),
                Err(source) => {
                    return Err(ConfigError::Yaml {
                        path: path.display().to_string(),
                        source,
                    })
                }
            }
        };
        Ok(Self {
            fields,
            body: body.trim_start_matches(['\r', '\n']).to_string(),
        })
    }

    fn render(&self) -> Result<String, ConfigError> {
        if self.fields.is_empty() {
            return Ok(self.body.clone());
        }
        let yaml = serde_yaml::to_string(&self.fields).map_err(|source| ConfigError::Yaml {
            path: String::new(),
            source,
        })?;
        Ok(format!("---\n{yaml}---\n\n{}", self.body))
    }

    /// `null` removes a field; `body_field` replaces the body.
    fn apply(&mut self, changes: &Map<String, Value>, body_field: &str) {
        for (key, value) in changes {
            if key == "scope" || key == "name" {
                continue;
            }
            if key == body_field {
                self.body = value.as_str().unwrap_or_default().to_string();
            } else if value.is_null() {
                self.fields.remove(key);
            } else {
                self.fields.insert(key.clone(), value.clone());
            }
        }
    }

    fn field_names(&self, body_field: &str) -> Vec<String> {
        let mut names: Vec<String> = self.fields.keys().cloned().collect();
        if !self.body.trim().is_empty() {
            names.push(body_field.to_string());
        }
        names
    }
}

fn validate_name(name: &str) -> Result<&str, ConfigError> {
    let name = name.trim();
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(name)
    } else {
        Err(ConfigError::InvalidName(name.to_string()))
    }
}

/// A path below a skill directory: relative, without `..` or root parts.
fn skill_relative(rel: &str) -> Result<PathBuf, ConfigError> {
    let path = Path::new(rel.trim_start_matches('/'));
    let normal = path.components().count() > 0
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    if normal {
        Ok(path.to_path_buf())
    } else {
        Err(ConfigError::InvalidPath(rel.to_string()))
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    let Some(text) = read_optional(path)? else {
        return Ok(Map::new());
    };
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str(&text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Ok(Map::new()),
        Err(source) => Err(ConfigError::Json {
            path: path.display().to_string(),
            source,
        }),
    }
}

fn write_json(path: &Path, map: &Map<String, Value>) -> Result<(), ConfigError> {
    let text = serde_json::to_string_pretty(map).map_err(|source| ConfigError::Json {
        path: path.display().to_string(),
        source,
    })?;
    write_atomic(path, &text)
}

fn json_entry<'a>(map: &'a Map<String, Value>, kind: EntryKind, name: &str) -> Option<&'a Map<String, Value>> {
    map.get(kind.key())?.get(name)?.as_object()
}

fn collect_files(dir: &Path, base: &Path, out: &mut Vec<String>) -> Result<(), ConfigError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, base, out)?;
        } else if let Ok(rel) = path.strip_prefix(base) {
            if rel != Path::new(SKILL_FILE) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    Ok(())
}

const SCOPES: [ConfigScope; 2] = [ConfigScope::Project, ConfigScope::User];

#[derive(Debug, Clone)]
pub struct ConfigRoots {
    user: PathBuf,
}

impl ConfigRoots {
    /// `$XDG_CONFIG_HOME/opencode`, else `~/.config/opencode`.
    pub fn resolve() -> Option<Self> {
        let base = match std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()?.join(".config"),
        };
        Some(Self::at(base.join("opencode")))
    }

    pub fn at(user: impl Into<PathBuf>) -> Self {
        Self { user: user.into() }
    }

    fn root(&self, scope: ConfigScope, project: &Path) -> PathBuf {
        match scope {
            ConfigScope::User => self.user.clone(),
            ConfigScope::Project => project.join(".opencode"),
        }
    }

    fn md_path(&self, kind: EntryKind, scope: ConfigScope, project: &Path, name: &str) -> PathBuf {
        self.root(scope, project)
            .join(kind.key())
            .join(format!("{name}.md"))
    }

    fn json_path(&self, scope: ConfigScope, project: &Path) -> PathBuf {
        match scope {
            ConfigScope::User => self.user.join(CONFIG_JSON),
            ConfigScope::Project => project.join(CONFIG_JSON),
        }
    }

    fn skill_dir(&self, scope: ConfigScope, project: &Path, name: &str) -> PathBuf {
        self.root(scope, project).join("skill").join(name)
    }

    fn find_md(&self, kind: EntryKind, project: &Path, name: &str) -> Option<(ConfigScope, PathBuf)> {
        SCOPES
            .into_iter()
            .map(|scope| (scope, self.md_path(kind, scope, project, name)))
            .find(|(_, path)| path.is_file())
    }

    fn find_json(
        &self,
        kind: EntryKind,
        project: &Path,
        name: &str,
    ) -> Result<Option<(ConfigScope, PathBuf, Map<String, Value>)>, ConfigError> {
        for scope in SCOPES {
            let path = self.json_path(scope, project);
            let map = read_json(&path)?;
            if json_entry(&map, kind, name).is_some() {
                return Ok(Some((scope, path, map)));
            }
        }
        Ok(None)
    }

    pub fn describe(&self, kind: EntryKind, name: &str, project: &Path) -> Result<ConfigEntryInfo, ConfigError> {
        let name = validate_name(name)?;
        let mut sources = ConfigSources::default();
        let mut scope = None;

        if let Some((md_scope, path)) = self.find_md(kind, project, name) {
            let text = std::fs::read_to_string(&path)?;
            let doc = MarkdownDoc::parse(&path, &text)?;
            sources.md = ConfigSource {
                exists: true,
                path: Some(path.display().to_string()),
                fields: doc.field_names(kind.body_field()),
            };
            scope = Some(md_scope);
        }
        if let Some((json_scope, path, map)) = self.find_json(kind, project, name)? {
            sources.json = ConfigSource {
                exists: true,
                path: Some(path.display().to_string()),
                fields: json_entry(&map, kind, name)
                    .map(|entry| entry.keys().cloned().collect())
                    .unwrap_or_default(),
            };
            scope.get_or_insert(json_scope);
        }

        Ok(ConfigEntryInfo {
            name: name.to_string(),
            is_built_in: kind.built_ins().contains(&name),
            scope,
            sources,
        })
    }

    pub fn create(
        &self,
        kind: EntryKind,
        name: &str,
        scope: ConfigScope,
        fields: &Map<String, Value>,
        project: &Path,
    ) -> Result<PathBuf, ConfigError> {
        let name = validate_name(name)?;
        if self.find_md(kind, project, name).is_some() || self.find_json(kind, project, name)?.is_some() {
            return Err(ConfigError::AlreadyExists(format!("{} {name}", kind.label())));
        }
        let mut doc = MarkdownDoc::default();
        doc.apply(fields, kind.body_field());
        let path = self.md_path(kind, scope, project, name);
        write_atomic(&path, &doc.render()?)?;
        info!(
            component = "agent_config",
            event = "agent_config.entry.created",
            kind = kind.key(),
            name,
            path = %path.display(),
        );
        Ok(path)
    }

    /// Updates the markdown definition when there is one, else the JSON
    /// entry. A built-in with neither gets a user-level JSON override.
    pub fn update(
        &self,
        kind: EntryKind,
        name: &str,
        changes: &Map<String, Value>,
        project: &Path,
    ) -> Result<PathBuf, ConfigError> {
        let name = validate_name(name)?;
        if let Some((_, path)) = self.find_md(kind, project, name) {
            let text = std::fs::read_to_string(&path)?;
            let mut doc = MarkdownDoc::parse(&path, &text)?;
            doc.apply(changes, kind.body_field());
            write_atomic(&path, &doc.render()?)?;
            return Ok(path);
        }

        let (path, mut map) = match self.find_json(kind, project, name)? {
            Some((_, path, map)) => (path, map),
            None if kind.built_ins().contains(&name) => {
                let path = self.json_path(ConfigScope::User, project);
                let map = read_json(&path)?;
                (path, map)
            }
            None => return Err(ConfigError::NotFound(format!("{} {name}", kind.label()))),
        };
        let section = map
            .entry(kind.key())
            .or_insert_with(|| Value::Object(Map::new()));
        if !section.is_object() {
            *section = Value::Object(Map::new());
        }
        if let Value::Object(section) = section {
            let entry = section
                .entry(name.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(entry) = entry {
                for (key, value) in changes {
                    if key == "scope" || key == "name" {
                        continue;
                    }
                    if value.is_null() {
                        entry.remove(key);
                    } else {
                        entry.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        write_json(&path, &map)?;
        Ok(path)
    }

    /// Removes every local definition of `name`, markdown and JSON alike.
    pub fn delete(&self, kind: EntryKind, name: &str, project: &Path) -> Result<(), ConfigError> {
        let name = validate_name(name)?;
        let mut removed = false;
        for scope in SCOPES {
            let md = self.md_path(kind, scope, project, name);
            if md.is_file() {
                std::fs::remove_file(&md)?;
                removed = true;
            }
            let json = self.json_path(scope, project);
            let mut map = read_json(&json)?;
            let dropped = map
                .get_mut(kind.key())
                .and_then(Value::as_object_mut)
                .and_then(|section| section.remove(name))
                .is_some();
            if dropped {
                write_json(&json, &map)?;
                removed = true;
            }
        }
        if !removed {
            return Err(ConfigError::NotFound(format!("{} {name}", kind.label())));
        }
        info!(
            component = "agent_config",
            event = "agent_config.entry.deleted",
            kind = kind.key(),
            name,
        );
        Ok(())
    }

    // Skills

    fn find_skill(&self, project: &Path, name: &str) -> Option<(ConfigScope, PathBuf)> {
        SCOPES
            .into_iter()
            .map(|scope| (scope, self.skill_dir(scope, project, name)))
            .find(|(_, dir)| dir.join(SKILL_FILE).is_file())
    }

    fn skill_info(&self, name: &str, scope: ConfigScope, dir: &Path) -> Result<SkillInfo, ConfigError> {
        let skill_md = dir.join(SKILL_FILE);
        let text = std::fs::read_to_string(&skill_md)?;
        let doc = MarkdownDoc::parse(&skill_md, &text)?;
        let mut files = Vec::new();
        collect_files(dir, dir, &mut files)?;
        files.sort();
        Ok(SkillInfo {
            name: name.to_string(),
            exists: true,
            path: Some(skill_md.display().to_string()),
            scope: Some(scope),
            description: doc
                .fields
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            files,
        })
    }

    /// Project skills shadow user skills of the same name.
    pub fn list_skills(&self, project: &Path) -> Result<Vec<SkillInfo>, ConfigError> {
        let mut found = BTreeMap::new();
        for scope in [ConfigScope::User, ConfigScope::Project] {
            let root = self.root(scope, project).join("skill");
            let entries = match std::fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let dir = entry?.path();
                if !dir.join(SKILL_FILE).is_file() {
                    continue;
                }
                let Some(name) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                    continue;
                };
                found.insert(name.clone(), self.skill_info(&name, scope, &dir)?);
            }
        }
        Ok(found.into_values().collect())
    }

    pub fn skill(&self, name: &str, project: &Path) -> Result<SkillInfo, ConfigError> {
        let name = validate_name(name)?;
        match self.find_skill(project, name) {
            Some((scope, dir)) => self.skill_info(name, scope, &dir),
            None => Ok(SkillInfo {
                name: name.to_string(),
                exists: false,
                path: None,
                scope: None,
                description: None,
                files: Vec::new(),
            }),
        }
    }

    pub fn create_skill(
        &self,
        name: &str,
        scope: ConfigScope,
        fields: &Map<String, Value>,
        project: &Path,
    ) -> Result<PathBuf, ConfigError> {
        let name = validate_name(name)?;
        if self.find_skill(project, name).is_some() {
            return Err(ConfigError::AlreadyExists(format!("Skill {name}")));
        }
        let mut doc = MarkdownDoc::default();
        doc.fields.insert("name".into(), Value::String(name.to_string()));
        doc.apply(fields, SKILL_BODY_FIELD);
        let path = self.skill_dir(scope, project, name).join(SKILL_FILE);
        write_atomic(&path, &doc.render()?)?;
        info!(
            component = "agent_config",
            event = "agent_config.skill.created",
            name,
            path = %path.display(),
        );
        Ok(path)
    }

    pub fn update_skill(
        &self,
        name: &str,
        changes: &Map<String, Value>,
        project: &Path,
    ) -> Result<PathBuf, ConfigError> {
        let name = validate_name(name)?;
        let (_, dir) = self
            .find_skill(project, name)
            .ok_or_else(|| ConfigError::NotFound(format!("Skill {name}")))?;
        let path = dir.join(SKILL_FILE);
        let text = std::fs::read_to_string(&path)?;
        let mut doc = MarkdownDoc::parse(&path, &text)?;
        doc.apply(changes, SKILL_BODY_FIELD);
        write_atomic(&path, &doc.render()?)?;
        Ok(path)
    }

    pub fn delete_skill(&self, name: &str, project: &Path) -> Result<(), ConfigError> {
        let name = validate_name(name)?;
        let (_, dir) = self
            .find_skill(project, name)
            .ok_or_else(|| ConfigError::NotFound(format!("Skill {name}")))?;
        std::fs::remove_dir_all(&dir)?;
        info!(
            component = "agent_config",
            event = "agent_config.skill.deleted",
            name,
        );
        Ok(())
    }

    fn skill_file_path(&self, name: &str, rel: &str, project: &Path) -> Result<PathBuf, ConfigError> {
        let name = validate_name(name)?;
        let rel = skill_relative(rel)?;
        let (_, dir) = self
            .find_skill(project, name)
            .ok_or_else(|| ConfigError::NotFound(format!("Skill {name}")))?;
        Ok(dir.join(rel))
    }

    pub fn read_skill_file(&self, name: &str, rel: &str, project: &Path) -> Result<String, ConfigError> {
        let path = self.skill_file_path(name, rel, project)?;
        read_optional(&path)?.ok_or_else(|| ConfigError::NotFound(format!("File {rel}")))
    }

    pub fn write_skill_file(
        &self,
        name: &str,
        rel: &str,
        content: &str,
        project: &Path,
    ) -> Result<(), ConfigError> {
        let path = self.skill_file_path(name, rel, project)?;
        write_atomic(&path, content)
    }

    pub fn delete_skill_file(&self, name: &str, rel: &str, project: &Path) -> Result<(), ConfigError> {
        let path = self.skill_file_path(name, rel, project)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ConfigError::NotFound(format!("File {rel}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}
