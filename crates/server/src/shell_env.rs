//! Login-shell environment resolution.
//!
//! Tools installed through shell-managed setups (nvm, asdf, homebrew shellenv,
//! ...) only appear on `PATH` after the user's login profile runs. The host
//! asks the login shell once for its `PATH` and merges it ahead of the
//! inherited one for every child it spawns.

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, warn};

const PATH_MARKER: &str = "__PATH__=";
const LOGIN_SHELL_TIMEOUT: Duration = Duration::from_secs(5);

static LOGIN_SHELL_PATH: OnceCell<Option<String>> = OnceCell::const_new();

/// The user's login shell: `$SHELL`, else the first of zsh/bash/sh that exists.
pub fn user_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.trim().is_empty() {
            return shell;
        }
    }
    ["/bin/zsh", "/bin/bash", "/bin/sh"]
        .into_iter()
        .find(|candidate| Path::new(candidate).exists())
        .unwrap_or("/bin/sh")
        .to_string()
}

fn shell_path_args(shell: &str) -> Vec<String> {
    let shell_name = Path::new(shell)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("sh");

    match shell_name {
        "nu" | "nushell" => vec![
            "-l".into(),
            "-i".into(),
            "-c".into(),
            "echo $\"__PATH__=($env.PATH | str join (char esep))\"".into(),
        ],
        "bash" => vec![
            "-lic".into(),
            "source ~/.bashrc 2>/dev/null; echo \"__PATH__=$PATH\"".into(),
        ],
        _ => vec!["-lic".into(), "echo \"__PATH__=$PATH\"".into()],
    }
}

fn extract_marked_path(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix(PATH_MARKER))
        .find(|path| !path.is_empty())
        .map(str::to_string)
}

async fn detect_login_shell_path() -> Option<String> {
    let shell = user_shell();
    let child = Command::new(&shell)
        .args(shell_path_args(&shell))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .ok()?;

    // Interactive profiles can hang on prompts.
    let output = match timeout(LOGIN_SHELL_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) => return None,
        Err(_) => {
            warn!(
                component = "shell_env",
                event = "shell_env.login_path_timeout",
                shell = %shell,
                "Login shell did not report PATH in time"
            );
            return None;
        }
    };
    if !output.status.success() {
        return None;
    }
    let path = extract_marked_path(&String::from_utf8_lossy(&output.stdout));
    debug!(
        component = "shell_env",
        event = "shell_env.login_path_resolved",
        shell = %shell,
        found = path.is_some(),
    );
    path
}

/// Cached login-shell `PATH` (resolved on first use).
pub async fn login_shell_path() -> Option<&'static str> {
    LOGIN_SHELL_PATH
        .get_or_init(detect_login_shell_path)
        .await
        .as_deref()
}

/// Merge two `PATH` strings, keeping first-seen order and dropping duplicates.
pub fn merge_paths(preferred: &str, current: &str) -> String {
    let mut seen = HashSet::new();
    preferred
        .split(':')
        .chain(current.split(':'))
        .filter(|part| !part.is_empty() && seen.insert(*part))
        .collect::<Vec<_>>()
        .join(":")
}

/// `PATH` with the login-shell entries merged in front of the inherited value.
pub async fn augmented_path() -> String {
    let current = std::env::var("PATH").unwrap_or_default();
    match login_shell_path().await {
        Some(login) => merge_paths(login, &current),
        None => current,
    }
}
