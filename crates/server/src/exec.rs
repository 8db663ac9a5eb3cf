//! Shell command execution for `/api/fs/exec`.
//!
//! Commands run through the user's shell with the login-shell `PATH`.
//! Background batches become jobs that run to completion on their own task
//! and stay queryable until their TTL expires.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use openchamber_protocol::{CommandResult, ExecJobResponse, ExecJobStatus};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::shell_env;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(10 * 60);
const GC_INTERVAL: Duration = Duration::from_secs(60);

fn non_empty(text: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(text);
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Run one command, never failing: errors and timeouts land in the result.
pub async fn run_command(command: &str, cwd: &Path, timeout: Duration) -> CommandResult {
    let path = shell_env::augmented_path().await;
    let output = Command::new(shell_env::user_shell())
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .env("PATH", path)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, output).await {
        Ok(Ok(output)) => CommandResult {
            command: command.to_string(),
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: non_empty(&output.stdout),
            stderr: non_empty(&output.stderr),
            error: None,
        },
        Ok(Err(e)) => CommandResult::failed(command, format!("Failed to execute command: {e}")),
        Err(_) => CommandResult::failed(
            command,
            format!("Command timed out after {}s", timeout.as_secs()),
        ),
    }
}

/// Run commands in order; later commands still run after a failure.
pub async fn run_batch(commands: &[String], cwd: &Path, timeout: Duration) -> Vec<CommandResult> {
    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        results.push(run_command(command, cwd, timeout).await);
    }
    results
}

pub fn all_succeeded(results: &[CommandResult]) -> bool {
    results.iter().all(|r| r.success)
}

#[derive(Debug, Clone)]
pub struct ExecJob {
    pub id: String,
    pub commands: Vec<String>,
    pub status: ExecJobStatus,
    pub results: Vec<CommandResult>,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    updated_at: Instant,
}

impl ExecJob {
    pub fn to_response(&self) -> ExecJobResponse {
        ExecJobResponse {
            job_id: self.id.clone(),
            status: self.status,
            success: self.status == ExecJobStatus::Done && all_succeeded(&self.results),
            results: self.results.clone(),
        }
    }
}

pub struct ExecJobs {
    jobs: Mutex<HashMap<String, ExecJob>>,
    ttl: Duration,
    command_timeout: Duration,
}

impl ExecJobs {
    pub fn new(ttl: Duration, command_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            ttl,
            command_timeout,
        })
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    fn with_job(&self, id: &str, f: impl FnOnce(&mut ExecJob)) {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(job) = jobs.get_mut(id) {
            f(job);
            job.updated_at = Instant::now();
        }
    }

    /// Queue a batch and return its job id immediately.
    pub fn submit(self: &Arc<Self>, commands: Vec<String>, cwd: PathBuf) -> String {
        let id = openchamber_protocol::new_id();
        let now = Instant::now();
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id.clone(),
                ExecJob {
                    id: id.clone(),
                    commands: commands.clone(),
                    status: ExecJobStatus::Queued,
                    results: Vec::new(),
                    started_at: None,
                    finished_at: None,
                    updated_at: now,
                },
            );
        info!(
            component = "exec",
            event = "exec.job.queued",
            job_id = %id,
            commands = commands.len(),
        );

        let this = Arc::clone(self);
        let job_id = id.clone();
        tokio::spawn(async move {
            this.with_job(&job_id, |job| {
                job.status = ExecJobStatus::Running;
                job.started_at = Some(Instant::now());
            });
            for command in &commands {
                let result = run_command(command, &cwd, this.command_timeout).await;
                this.with_job(&job_id, |job| job.results.push(result));
            }
            this.with_job(&job_id, |job| {
                job.status = ExecJobStatus::Done;
                job.finished_at = Some(Instant::now());
            });
            debug!(
                component = "exec",
                event = "exec.job.done",
                job_id = %job_id,
            );
        });
        id
    }

    pub fn get(&self, id: &str) -> Option<ExecJob> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Drop jobs whose last update is older than the TTL.
    pub fn gc_at(&self, now: Instant) -> usize {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let before = jobs.len();
        let ttl = self.ttl;
        jobs.retain(|_, job| now.saturating_duration_since(job.updated_at) <= ttl);
        before - jobs.len()
    }

    pub fn spawn_gc(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GC_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = this.gc_at(Instant::now());
                        if removed > 0 {
                            debug!(component = "exec", event = "exec.job.gc", removed);
                        }
                    }
                }
            }
        })
    }
}
