//! Central path resolution for all OpenChamber data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `OPENCHAMBER_DATA_DIR` env >
//! `~/.config/openchamber`. Callsites take paths from a [`DataPaths`] value
//! instead of constructing them from `HOME`.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    /// Resolve the data directory.
    ///
    /// Priority: `explicit` arg > `OPENCHAMBER_DATA_DIR` env > `~/.config/openchamber`.
    pub fn resolve(explicit: Option<&Path>) -> io::Result<Self> {
        let root = if let Some(p) = explicit {
            p.to_path_buf()
        } else if let Ok(env_val) = std::env::var("OPENCHAMBER_DATA_DIR") {
            PathBuf::from(env_val)
        } else {
            dirs::home_dir()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "HOME directory not found"))?
                .join(".config")
                .join("openchamber")
        };
        Ok(Self { root })
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    pub fn push_subscriptions_path(&self) -> PathBuf {
        self.root.join("push-subscriptions.json")
    }

    pub fn vapid_keys_path(&self) -> PathBuf {
        self.root.join("vapid-keys.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Create all required subdirectories under the data dir.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}

/// Expand a leading `~` to the home directory. Other paths pass through.
pub fn expand_tilde(path: &str) -> PathBuf {
    let rest = if path == "~" {
        Some("")
    } else {
        path.strip_prefix("~/")
    };
    match (rest, dirs::home_dir()) {
        (Some(rest), Some(home)) if rest.is_empty() => home,
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilde_expands_only_as_prefix() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("~/work/app"), home.join("work/app"));
        assert_eq!(expand_tilde("/srv/~app"), PathBuf::from("/srv/~app"));
        assert_eq!(expand_tilde("~other/x"), PathBuf::from("~other/x"));
    }

    #[test]
    fn explicit_dir_wins() {
        let paths = DataPaths::resolve(Some(Path::new("/tmp/oc-explicit"))).unwrap();
        assert_eq!(paths.root(), Path::new("/tmp/oc-explicit"));
        assert_eq!(
            paths.settings_path(),
            PathBuf::from("/tmp/oc-explicit/settings.json")
        );
        assert_eq!(paths.log_dir(), PathBuf::from("/tmp/oc-explicit/logs"));
    }

    #[test]
    fn ensure_dirs_creates_log_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(tmp.path().join("data"));
        paths.ensure_dirs().unwrap();
        assert!(paths.log_dir().is_dir());
    }
}
