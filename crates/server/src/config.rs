//! Command-line and environment configuration.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::push::vapid::DEFAULT_VAPID_SUBJECT;
use crate::supervisor::launcher::LaunchConfig;
use crate::terminal::{TerminalConfig, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_SESSIONS};

#[derive(Debug, Parser)]
#[command(
    name = "openchamber-server",
    version,
    about = "OpenChamber host process",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    /// Data directory (settings, push subscriptions, VAPID keys, logs)
    #[arg(long, global = true, env = "OPENCHAMBER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,

    /// Serve flags when no subcommand is given.
    #[command(flatten)]
    pub serve: ServeArgs,
}

impl Cli {
    /// The serve arguments in effect, if serving.
    pub fn serve_args(&self) -> Option<&ServeArgs> {
        match &self.command {
            None => Some(&self.serve),
            Some(Command::Serve(args)) => Some(args),
            Some(Command::Status { .. }) => None,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the host process (default)
    Serve(ServeArgs),
    /// Report the health of a running host process
    Status {
        #[arg(long, default_value = "127.0.0.1", env = "OPENCHAMBER_HOST")]
        host: IpAddr,
        #[arg(long, default_value_t = 3000, env = "OPENCHAMBER_PORT")]
        port: u16,
    },
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address the HTTP server binds to
    #[arg(long, default_value = "127.0.0.1", env = "OPENCHAMBER_HOST")]
    pub host: IpAddr,

    /// Port the HTTP server binds to
    #[arg(long, default_value_t = 3000, env = "OPENCHAMBER_PORT")]
    pub port: u16,

    /// Agent binary to supervise
    #[arg(long, default_value = "opencode", env = "OPENCODE_BINARY")]
    pub opencode_binary: PathBuf,

    /// Port for the agent server; 0 lets it choose and reports it on stdout
    #[arg(long, default_value_t = 0, env = "OPENCODE_PORT")]
    pub opencode_port: u16,

    /// Host the agent server listens on
    #[arg(long, default_value = "127.0.0.1", env = "OPENCODE_HOST")]
    pub opencode_host: String,

    /// Working directory for the agent process
    #[arg(long, env = "OPENCODE_CWD")]
    pub opencode_cwd: Option<PathBuf>,

    /// Contact URI embedded in VAPID signatures
    #[arg(long, default_value = DEFAULT_VAPID_SUBJECT, env = "OPENCHAMBER_VAPID_SUBJECT")]
    pub vapid_subject: String,

    /// Maximum number of concurrent terminal sessions
    #[arg(long, default_value_t = DEFAULT_MAX_SESSIONS)]
    pub max_terminals: usize,

    /// Idle terminals are reaped after this many seconds
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT.as_secs())]
    pub terminal_idle_timeout_secs: u64,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            host: IpAddr::from([127, 0, 0, 1]),
            port: 3000,
            opencode_binary: PathBuf::from("opencode"),
            opencode_port: 0,
            opencode_host: "127.0.0.1".into(),
            opencode_cwd: None,
            vapid_subject: DEFAULT_VAPID_SUBJECT.into(),
            max_terminals: DEFAULT_MAX_SESSIONS,
            terminal_idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
        }
    }
}

impl ServeArgs {
    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            binary: self.opencode_binary.clone(),
            host: self.opencode_host.clone(),
            port: self.opencode_port,
            cwd: self.opencode_cwd.clone(),
        }
    }

    pub fn terminal_config(&self) -> TerminalConfig {
        TerminalConfig {
            max_sessions: self.max_terminals,
            idle_timeout: Duration::from_secs(self.terminal_idle_timeout_secs),
            ..TerminalConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_optional() {
        let cli = Cli::try_parse_from(["openchamber-server", "--port", "3100"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.serve_args().unwrap().port, 3100);
    }

    #[test]
    fn parses_serve_flags() {
        let cli = Cli::try_parse_from([
            "openchamber-server",
            "serve",
            "--port",
            "4100",
            "--opencode-binary",
            "/opt/opencode/bin/opencode",
            "--max-terminals",
            "4",
        ])
        .unwrap();
        let Some(Command::Serve(args)) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.port, 4100);
        assert_eq!(
            args.launch_config().binary,
            PathBuf::from("/opt/opencode/bin/opencode")
        );
        assert_eq!(args.terminal_config().max_sessions, 4);
    }
}
