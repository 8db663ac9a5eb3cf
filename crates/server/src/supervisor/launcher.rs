//! Spawning and terminating the agent binary.
//!
//! The launcher owns everything OS-specific about the supervised process:
//! building the command, waiting out the startup grace window, discovering
//! the listening port from stdout, and killing whatever holds that port when
//! the instance is replaced.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::shell_env;

/// Window in which the process must produce output (or exit) after spawn.
pub const SPAWN_GRACE: Duration = Duration::from_secs(2);
/// How long stdout is scanned for the listening URL.
pub const PORT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);
const TERMINATE_WAIT: Duration = Duration::from_secs(3);
const EARLY_OUTPUT_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub binary: PathBuf,
    pub host: String,
    /// 0 means "let the agent choose and report it".
    pub port: u16,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEndpoint {
    pub host: String,
    pub port: u16,
}

impl AgentEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentExit {
    pub code: Option<i32>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StartupError {
    #[error(
        "OpenCode binary `{binary}` was not found. Install it or point --opencode-binary \
         (OPENCODE_BINARY) at its location"
    )]
    BinaryNotFound { binary: String },

    #[error("failed to spawn OpenCode: {0}")]
    SpawnFailed(String),

    #[error("OpenCode exited during startup (code {code:?}): {output}")]
    ExitedEarly { code: Option<i32>, output: String },

    #[error("OpenCode did not report a listening port within {0:?}")]
    PortNotDiscovered(Duration),
}

impl StartupError {
    /// Errors that will not go away until configuration changes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StartupError::BinaryNotFound { .. })
    }
}

/// A running agent instance.
pub struct LaunchedAgent {
    pub pid: Option<u32>,
    pub endpoint: AgentEndpoint,
    exit: watch::Receiver<Option<AgentExit>>,
    kill: Option<oneshot::Sender<()>>,
}

impl LaunchedAgent {
    pub fn new(
        pid: Option<u32>,
        endpoint: AgentEndpoint,
        exit: watch::Receiver<Option<AgentExit>>,
        kill: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            pid,
            endpoint,
            exit,
            kill,
        }
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<AgentExit>> {
        self.exit.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Ask the owning waiter task to kill the child handle.
    fn request_kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Resolves once `exit` carries a value (or its sender is gone).
pub async fn wait_for_exit(mut exit: watch::Receiver<Option<AgentExit>>) -> Option<AgentExit> {
    loop {
        if let Some(status) = exit.borrow_and_update().clone() {
            return Some(status);
        }
        if exit.changed().await.is_err() {
            return exit.borrow().clone();
        }
    }
}

#[async_trait]
pub trait AgentLauncher: Send + Sync + 'static {
    async fn launch(&self) -> Result<LaunchedAgent, StartupError>;

    /// Forcibly stop an instance, including whatever still holds its port.
    async fn terminate(&self, agent: LaunchedAgent);
}

pub struct OpenCodeLauncher {
    config: LaunchConfig,
}

impl OpenCodeLauncher {
    pub fn new(config: LaunchConfig) -> Self {
        Self { config }
    }

    fn command(&self, path: String) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("serve")
            .arg("--hostname")
            .arg(&self.config.host)
            .arg("--port")
            .arg(self.config.port.to_string())
            .env("PATH", path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(line) | OutputLine::Stderr(line) => line,
        }
    }
}

#[async_trait]
impl AgentLauncher for OpenCodeLauncher {
    async fn launch(&self) -> Result<LaunchedAgent, StartupError> {
        let binary = self.config.binary.display().to_string();
        let path = shell_env::augmented_path().await;
        let mut child = self.command(path).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StartupError::BinaryNotFound {
                    binary: binary.clone(),
                }
            } else {
                StartupError::SpawnFailed(e.to_string())
            }
        })?;
        let pid = child.id();
        info!(
            component = "supervisor",
            event = "supervisor.process.spawned",
            binary = %binary,
            pid = ?pid,
            "Spawned OpenCode"
        );

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(OutputLine::Stdout(line)).is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(OutputLine::Stderr(line)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(line_tx);

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(own_child(child, kill_rx, exit_tx));

        let mut agent = LaunchedAgent::new(
            pid,
            AgentEndpoint::new(self.config.host.clone(), self.config.port),
            exit_rx,
            Some(kill_tx),
        );

        let mut early_output = Vec::new();
        let discovered =
            discover_port(&mut line_rx, agent.exit_watch(), self.config.port, &mut early_output)
                .await;

        match discovered {
            Ok(port) => {
                agent.endpoint.port = port;
                tokio::spawn(forward_output(line_rx));
                Ok(agent)
            }
            Err(err) => {
                agent.request_kill();
                warn!(
                    component = "supervisor",
                    event = "supervisor.process.startup_failed",
                    error = %err,
                    "OpenCode failed to start"
                );
                Err(err)
            }
        }
    }

    async fn terminate(&self, mut agent: LaunchedAgent) {
        let port = agent.endpoint.port;
        // The child handle may be a wrapper script; the real server is whoever
        // holds the port.
        let holders = pids_listening_on(port).await;
        for pid in &holders {
            kill_pid(*pid);
        }
        agent.request_kill();

        let exit = agent.exit_watch();
        if timeout(TERMINATE_WAIT, wait_for_exit(exit)).await.is_err() {
            warn!(
                component = "supervisor",
                event = "supervisor.process.terminate_timeout",
                port,
                "OpenCode did not exit after kill"
            );
        }
        info!(
            component = "supervisor",
            event = "supervisor.process.terminated",
            port,
            killed_pids = ?holders,
            "Terminated OpenCode instance"
        );
    }
}

async fn own_child(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<AgentExit>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let code = status.ok().and_then(|s| s.code());
    debug!(
        component = "supervisor",
        event = "supervisor.process.exited",
        code = ?code,
    );
    let _ = exit_tx.send(Some(AgentExit { code }));
}

/// Wait for the first sign of life, then for the listening URL.
async fn discover_port(
    lines: &mut mpsc::UnboundedReceiver<OutputLine>,
    exit: watch::Receiver<Option<AgentExit>>,
    configured_port: u16,
    early_output: &mut Vec<String>,
) -> Result<u16, StartupError> {
    let started = Instant::now();
    let exited = wait_for_exit(exit);
    tokio::pin!(exited);

    let mut saw_output = false;
    loop {
        let window = if saw_output {
            PORT_DISCOVERY_TIMEOUT
        } else {
            SPAWN_GRACE
        };
        let remaining = window.saturating_sub(started.elapsed());

        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => {
                    saw_output = true;
                    log_output(&line);
                    if early_output.len() < EARLY_OUTPUT_LINES {
                        early_output.push(line.text().to_string());
                    }
                    if configured_port != 0 {
                        return Ok(configured_port);
                    }
                    if let Some(port) = parse_listen_port(line.text()) {
                        return Ok(port);
                    }
                }
                // Both pipes closed; usually the process is on its way out.
                None => {
                    return match timeout(remaining, exited.as_mut()).await {
                        Ok(status) => Err(StartupError::ExitedEarly {
                            code: status.and_then(|s| s.code),
                            output: early_output.join("\n"),
                        }),
                        Err(_) if configured_port != 0 => Ok(configured_port),
                        Err(_) => Err(StartupError::PortNotDiscovered(PORT_DISCOVERY_TIMEOUT)),
                    };
                }
            },
            status = &mut exited => {
                return Err(StartupError::ExitedEarly {
                    code: status.and_then(|s| s.code),
                    output: early_output.join("\n"),
                });
            }
            _ = tokio::time::sleep(remaining) => {
                if !saw_output {
                    // Silent but alive: trust an explicit port, keep waiting otherwise.
                    if configured_port != 0 {
                        return Ok(configured_port);
                    }
                    saw_output = true;
                    continue;
                }
                return Err(StartupError::PortNotDiscovered(PORT_DISCOVERY_TIMEOUT));
            }
        }
    }
}

fn log_output(line: &OutputLine) {
    match line {
        OutputLine::Stdout(text) => debug!(
            component = "opencode",
            event = "opencode.stdout",
            line = %text,
        ),
        OutputLine::Stderr(text) => debug!(
            component = "opencode",
            event = "opencode.stderr",
            line = %text,
        ),
    }
}

async fn forward_output(mut lines: mpsc::UnboundedReceiver<OutputLine>) {
    while let Some(line) = lines.recv().await {
        log_output(&line);
    }
}

/// Extract the port from a line such as
/// `opencode server listening on http://127.0.0.1:4096`.
pub fn parse_listen_port(line: &str) -> Option<u16> {
    let start = line.find("http://").map(|i| i + "http://".len())?;
    let authority = line[start..]
        .split(|c: char| c.is_whitespace() || c == '/')
        .next()?;
    let (_, port) = authority.rsplit_once(':')?;
    let digits: String = port.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok().filter(|port| *port != 0)
}

async fn pids_listening_on(port: u16) -> Vec<u32> {
    let output = Command::new("lsof")
        .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await;
    let Ok(output) = output else {
        return Vec::new();
    };
    let own_pid = std::process::id();
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| *pid != own_pid)
        .collect()
}

fn kill_pid(pid: u32) {
    let rc = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
    if rc != 0 {
        debug!(
            component = "supervisor",
            event = "supervisor.process.kill_failed",
            pid,
            error = %std::io::Error::last_os_error(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listening_banner() {
        assert_eq!(
            parse_listen_port("opencode server listening on http://127.0.0.1:4096"),
            Some(4096)
        );
        assert_eq!(
            parse_listen_port("listening on http://localhost:51234/ (press ctrl-c)"),
            Some(51234)
        );
        assert_eq!(parse_listen_port("starting up..."), None);
        assert_eq!(parse_listen_port("http://127.0.0.1:0"), None);
    }

    #[tokio::test]
    async fn missing_binary_is_fatal() {
        let launcher = OpenCodeLauncher::new(LaunchConfig {
            binary: PathBuf::from("/nonexistent/opencode-binary-for-tests"),
            host: "127.0.0.1".into(),
            port: 0,
            cwd: None,
        });
        let err = match launcher.launch().await {
            Err(err) => err,
            Ok(_) => panic!("launch should fail"),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("OPENCODE_BINARY"));
    }

    #[tokio::test]
    async fn early_exit_is_reported() {
        let launcher = OpenCodeLauncher::new(LaunchConfig {
            binary: PathBuf::from("/bin/false"),
            host: "127.0.0.1".into(),
            port: 0,
            cwd: None,
        });
        match launcher.launch().await {
            Err(StartupError::ExitedEarly { code, .. }) => assert_eq!(code, Some(1)),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("launch should fail"),
        }
    }

    #[tokio::test]
    async fn exit_watch_resolves_after_send() {
        let (tx, rx) = watch::channel(None);
        let waiter = tokio::spawn(wait_for_exit(rx));
        tx.send(Some(AgentExit { code: Some(3) })).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(AgentExit { code: Some(3) }));
    }
}
