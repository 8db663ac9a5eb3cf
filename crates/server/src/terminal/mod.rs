//! Terminal session manager.
//!
//! Each session owns one PTY. Output flows PTY reader thread → bounded
//! channel → fan-out task → one bounded channel per viewer. Every hop awaits
//! capacity, so a viewer that stops draining eventually pauses the PTY read.

pub mod pty;
pub mod stream;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::shell_env;
use pty::{PtyExit, PtyHandle, PumpStats, ShellCommand};

pub const DEFAULT_MAX_SESSIONS: usize = 20;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_SCROLLBACK_BYTES: usize = 64 * 1024;
const OUTPUT_QUEUE: usize = 16;
const VIEWER_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("terminal session {0} not found")]
    SessionNotFound(String),
    #[error("terminal session limit reached ({max})")]
    CapacityExceeded { max: usize },
    #[error("working directory does not exist: {0}")]
    InvalidCwd(String),
    #[error("pty error: {0}")]
    Pty(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub scrollback_bytes: usize,
    pub heartbeat: Duration,
    /// `None` runs the user's login shell.
    pub shell: Option<ShellCommand>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            heartbeat: Duration::from_secs(15),
            shell: None,
        }
    }
}

/// What a viewer receives after the initial replay.
#[derive(Debug, Clone)]
pub enum ViewerFrame {
    Data(Bytes),
    Exit(PtyExit),
}

/// Bounded ring of recent output replayed to late viewers.
#[derive(Debug)]
struct Scrollback {
    chunks: VecDeque<Bytes>,
    len: usize,
    cap: usize,
}

impl Scrollback {
    fn new(cap: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
            cap,
        }
    }

    fn push(&mut self, chunk: &Bytes) {
        self.chunks.push_back(chunk.clone());
        self.len += chunk.len();
        while self.len > self.cap {
            let Some(front) = self.chunks.pop_front() else {
                break;
            };
            let excess = self.len - self.cap;
            if front.len() > excess {
                let kept = front.slice(excess..);
                self.len -= excess;
                self.chunks.push_front(kept);
            } else {
                self.len -= front.len();
            }
        }
    }

    fn snapshot(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        Bytes::from(out)
    }
}

pub struct TerminalSession {
    pub id: String,
    pub cwd: PathBuf,
    cols: AtomicU16,
    rows: AtomicU16,
    pty: PtyHandle,
    last_activity: Mutex<Instant>,
    scrollback: Mutex<Scrollback>,
    viewers: Mutex<HashMap<u64, mpsc::Sender<ViewerFrame>>>,
    next_viewer: AtomicU64,
    exit: watch::Receiver<Option<PtyExit>>,
    pub stats: Arc<PumpStats>,
}

impl TerminalSession {
    pub fn size(&self) -> (u16, u16) {
        (
            self.cols.load(Ordering::Relaxed),
            self.rows.load(Ordering::Relaxed),
        )
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn exit_status(&self) -> Option<PtyExit> {
        self.exit.borrow().clone()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Register a viewer, returning the scrollback it must replay first.
    ///
    /// Scrollback and the viewer set are updated under the same lock order
    /// as the fan-out, so no chunk is both replayed and delivered live.
    pub fn attach(&self) -> Viewer {
        let (tx, rx) = mpsc::channel(VIEWER_QUEUE);
        let id = self.next_viewer.fetch_add(1, Ordering::Relaxed);
        let replay = {
            let scrollback = self.scrollback.lock().unwrap_or_else(PoisonError::into_inner);
            self.viewers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, tx);
            scrollback.snapshot()
        };
        Viewer {
            id,
            session_id: self.id.clone(),
            replay,
            frames: rx,
            exit: self.exit.clone(),
        }
    }

    pub fn detach(&self, viewer_id: u64) {
        self.viewers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&viewer_id);
    }

    fn record_output(&self, chunk: &Bytes) -> Vec<(u64, mpsc::Sender<ViewerFrame>)> {
        let mut scrollback = self.scrollback.lock().unwrap_or_else(PoisonError::into_inner);
        scrollback.push(chunk);
        self.viewers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect()
    }

    fn kill(&self) {
        self.pty.kill();
    }
}

/// One attached viewer of a session.
pub struct Viewer {
    pub id: u64,
    pub session_id: String,
    pub replay: Bytes,
    pub frames: mpsc::Receiver<ViewerFrame>,
    exit: watch::Receiver<Option<PtyExit>>,
}

impl Viewer {
    /// Exit status if the PTY already ended before this viewer attached.
    pub fn exited(&self) -> Option<PtyExit> {
        self.exit.borrow().clone()
    }
}

/// Target of a force-kill request.
#[derive(Debug, Clone)]
pub enum KillTarget {
    Session(String),
    Cwd(PathBuf),
    All,
}

type Registry = Arc<Mutex<HashMap<String, Arc<TerminalSession>>>>;

pub struct TerminalManager {
    config: TerminalConfig,
    sessions: Registry,
}

impl TerminalManager {
    pub fn new(config: TerminalConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<TerminalSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Result<Arc<TerminalSession>, TerminalError> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| TerminalError::SessionNotFound(id.to_string()))
    }

    pub async fn create(
        &self,
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<TerminalSession>, TerminalError> {
        let path_env = shell_env::augmented_path().await;
        let mut sessions = self.lock();
        if sessions.len() >= self.config.max_sessions {
            return Err(TerminalError::CapacityExceeded {
                max: self.config.max_sessions,
            });
        }
        let session = self.spawn_session(&path_env, cwd, cols, rows)?;
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    fn spawn_session(
        &self,
        path_env: &str,
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<TerminalSession>, TerminalError> {
        if !cwd.is_dir() {
            return Err(TerminalError::InvalidCwd(cwd.display().to_string()));
        }
        let cols = cols.max(1);
        let rows = rows.max(1);
        let shell = self
            .config
            .shell
            .clone()
            .unwrap_or_else(ShellCommand::login_shell);
        let spawned = pty::spawn_pty(&shell, path_env, cwd, cols, rows)?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE);
        let stats = Arc::new(PumpStats::default());

        let session = Arc::new(TerminalSession {
            id: openchamber_protocol::new_id(),
            cwd: cwd.to_path_buf(),
            cols: AtomicU16::new(cols),
            rows: AtomicU16::new(rows),
            pty: spawned.handle,
            last_activity: Mutex::new(Instant::now()),
            scrollback: Mutex::new(Scrollback::new(self.config.scrollback_bytes)),
            viewers: Mutex::new(HashMap::new()),
            next_viewer: AtomicU64::new(0),
            exit: exit_rx,
            stats: stats.clone(),
        });

        let reader = spawned.reader;
        tokio::task::spawn_blocking(move || pty::pump_output(reader, output_tx, &stats));
        let child = spawned.child;
        let waiter = tokio::task::spawn_blocking(move || pty::wait_child(child));
        tokio::spawn(fan_out(
            Arc::clone(&session),
            output_rx,
            waiter,
            exit_tx,
            Arc::downgrade(&self.sessions),
        ));

        info!(
            component = "terminal",
            event = "terminal.session.created",
            session_id = %session.id,
            cwd = %cwd.display(),
            pid = ?session.pty.pid,
            cols,
            rows,
            "Created terminal session"
        );
        Ok(session)
    }

    pub async fn input(&self, id: &str, data: Bytes) -> Result<(), TerminalError> {
        let session = self.get(id)?;
        session.touch();
        let writer = Arc::clone(&session);
        tokio::task::spawn_blocking(move || writer.pty.write_all(&data))
            .await
            .map_err(|e| TerminalError::Pty(e.to_string()))?
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), TerminalError> {
        let session = self.get(id)?;
        let cols = cols.max(1);
        let rows = rows.max(1);
        session.pty.resize(cols, rows)?;
        session.cols.store(cols, Ordering::Relaxed);
        session.rows.store(rows, Ordering::Relaxed);
        Ok(())
    }

    pub fn attach(&self, id: &str) -> Result<Viewer, TerminalError> {
        Ok(self.get(id)?.attach())
    }

    pub fn close(&self, id: &str) -> Result<(), TerminalError> {
        let session = self
            .lock()
            .remove(id)
            .ok_or_else(|| TerminalError::SessionNotFound(id.to_string()))?;
        session.kill();
        info!(
            component = "terminal",
            event = "terminal.session.closed",
            session_id = %id,
        );
        Ok(())
    }

    /// Replace a session with a fresh one under a new id. The old id need
    /// not exist.
    pub async fn restart(
        &self,
        id: &str,
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<TerminalSession>, TerminalError> {
        let path_env = shell_env::augmented_path().await;
        let mut sessions = self.lock();
        if let Some(old) = sessions.remove(id) {
            old.kill();
        }
        if sessions.len() >= self.config.max_sessions {
            return Err(TerminalError::CapacityExceeded {
                max: self.config.max_sessions,
            });
        }
        let session = self.spawn_session(&path_env, cwd, cols, rows)?;
        sessions.insert(session.id.clone(), session.clone());
        info!(
            component = "terminal",
            event = "terminal.session.restarted",
            old_session_id = %id,
            session_id = %session.id,
        );
        Ok(session)
    }

    /// Returns how many sessions were killed.
    pub fn force_kill(&self, target: &KillTarget) -> usize {
        let victims: Vec<Arc<TerminalSession>> = {
            let mut sessions = self.lock();
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| match target {
                    KillTarget::Session(id) => &s.id == id,
                    KillTarget::Cwd(cwd) => &s.cwd == cwd,
                    KillTarget::All => true,
                })
                .map(|s| s.id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &victims {
            session.kill();
        }
        if !victims.is_empty() {
            info!(
                component = "terminal",
                event = "terminal.force_kill",
                target = ?target,
                killed = victims.len(),
            );
        }
        victims.len()
    }

    /// Evict sessions idle at `now`. Returns the evicted ids.
    pub fn reap_idle_at(&self, now: Instant) -> Vec<String> {
        let idle_timeout = self.config.idle_timeout;
        let victims: Vec<Arc<TerminalSession>> = {
            let mut sessions = self.lock();
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| now.saturating_duration_since(s.last_activity()) > idle_timeout)
                .map(|s| s.id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &victims {
            session.kill();
            info!(
                component = "terminal",
                event = "terminal.session.idle_evicted",
                session_id = %session.id,
                "Evicted idle terminal"
            );
        }
        victims.iter().map(|s| s.id.clone()).collect()
    }

    pub fn reap_idle(&self) -> Vec<String> {
        self.reap_idle_at(Instant::now())
    }

    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.sweep_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        this.reap_idle();
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) -> usize {
        self.force_kill(&KillTarget::All)
    }
}

/// Move PTY output to viewers, then announce the exit and deregister.
async fn fan_out(
    session: Arc<TerminalSession>,
    mut output: mpsc::Receiver<Bytes>,
    waiter: JoinHandle<PtyExit>,
    exit_tx: watch::Sender<Option<PtyExit>>,
    registry: std::sync::Weak<Mutex<HashMap<String, Arc<TerminalSession>>>>,
) {
    while let Some(chunk) = output.recv().await {
        session.touch();
        for (viewer_id, tx) in session.record_output(&chunk) {
            // Awaiting capacity here is what propagates backpressure.
            if tx.send(ViewerFrame::Data(chunk.clone())).await.is_err() {
                session.detach(viewer_id);
            }
        }
    }

    let status = waiter.await.unwrap_or_else(|e| {
        warn!(
            component = "terminal",
            event = "terminal.wait_failed",
            session_id = %session.id,
            error = %e,
        );
        PtyExit {
            exit_code: None,
            signal: None,
        }
    });
    debug!(
        component = "terminal",
        event = "terminal.session.exited",
        session_id = %session.id,
        exit_code = ?status.exit_code,
        pauses = session.stats.pauses.load(Ordering::Relaxed),
    );

    let _ = exit_tx.send(Some(status.clone()));
    let viewers: Vec<_> = session
        .viewers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .map(|(_, tx)| tx)
        .collect();
    for tx in viewers {
        let _ = tx.send(ViewerFrame::Exit(status.clone())).await;
    }

    if let Some(registry) = registry.upgrade() {
        let mut sessions = registry.lock().unwrap_or_else(PoisonError::into_inner);
        if sessions
            .get(&session.id)
            .is_some_and(|current| Arc::ptr_eq(current, &session))
        {
            sessions.remove(&session.id);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::pty::ShellCommand;
    use super::TerminalConfig;

    /// A quiet, long-running "shell" for tests.
    pub fn sleeping_config() -> TerminalConfig {
        TerminalConfig {
            shell: Some(ShellCommand {
                program: "/bin/sh".into(),
                args: vec!["-c".into(), "sleep 30".into()],
            }),
            ..TerminalConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::sleeping_config;
    use super::*;

    #[test]
    fn scrollback_keeps_most_recent_bytes() {
        let mut sb = Scrollback::new(8);
        sb.push(&Bytes::from_static(b"hello "));
        sb.push(&Bytes::from_static(b"world"));
        assert_eq!(&sb.snapshot()[..], b"lo world");
        assert_eq!(sb.len, 8);
        sb.push(&Bytes::from_static(b"0123456789"));
        assert_eq!(&sb.snapshot()[..], b"23456789");
    }

    #[tokio::test]
    async fn rejects_missing_cwd_and_enforces_capacity() {
        let manager = TerminalManager::new(TerminalConfig {
            max_sessions: 1,
            ..sleeping_config()
        });
        let err = manager
            .create(Path::new("/definitely/not/here"), 80, 24)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TerminalError::InvalidCwd(_)));

        let dir = tempfile::tempdir().unwrap();
        manager.create(dir.path(), 80, 24).await.unwrap();
        let err = manager.create(dir.path(), 80, 24).await.err().unwrap();
        assert!(matches!(err, TerminalError::CapacityExceeded { max: 1 }));
        assert_eq!(manager.shutdown(), 1);
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_and_recent_ones_kept() {
        let manager = TerminalManager::new(TerminalConfig {
            idle_timeout: Duration::from_secs(60),
            ..sleeping_config()
        });
        let dir = tempfile::tempdir().unwrap();
        let stale = manager.create(dir.path(), 80, 24).await.unwrap();
        let fresh = manager.create(dir.path(), 80, 24).await.unwrap();

        *stale.last_activity.lock().unwrap() = Instant::now() - Duration::from_secs(61);
        *fresh.last_activity.lock().unwrap() = Instant::now() - Duration::from_secs(59);

        let evicted = manager.reap_idle();
        assert_eq!(evicted, vec![stale.id.clone()]);
        assert!(manager.get(&stale.id).is_err());
        assert!(manager.get(&fresh.id).is_ok());
        manager.shutdown();
    }

    #[tokio::test]
    async fn exit_is_delivered_and_session_deregistered() {
        let manager = TerminalManager::new(TerminalConfig {
            shell: Some(ShellCommand {
                program: "/bin/sh".into(),
                args: vec!["-c".into(), "printf ready; sleep 0.2; exit 3".into()],
            }),
            ..TerminalConfig::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let session = manager.create(dir.path(), 80, 24).await.unwrap();
        let mut viewer = session.attach();

        let mut output = Vec::from(&viewer.replay[..]);
        let exit = loop {
            match tokio::time::timeout(Duration::from_secs(10), viewer.frames.recv())
                .await
                .unwrap()
            {
                Some(ViewerFrame::Data(chunk)) => output.extend_from_slice(&chunk),
                Some(ViewerFrame::Exit(exit)) => break exit,
                None => panic!("viewer closed without exit frame"),
            }
        };
        assert!(String::from_utf8_lossy(&output).contains("ready"));
        assert_eq!(exit.exit_code, Some(3));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.get(&session.id).is_err());
    }

    async fn collect_until_exit(mut viewer: Viewer, stall_chunks: usize) -> Vec<u8> {
        let mut output = Vec::from(&viewer.replay[..]);
        let mut chunks = 0;
        loop {
            match tokio::time::timeout(Duration::from_secs(30), viewer.frames.recv())
                .await
                .unwrap()
            {
                Some(ViewerFrame::Data(chunk)) => {
                    output.extend_from_slice(&chunk);
                    chunks += 1;
                    if chunks <= stall_chunks {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
                Some(ViewerFrame::Exit(_)) | None => return output,
            }
        }
    }

    fn numbered_lines(output: &[u8]) -> Vec<u32> {
        String::from_utf8_lossy(output)
            .split(['\r', '\n'])
            .filter_map(|line| line.strip_prefix("line"))
            .map(|n| n.parse().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn slow_viewer_throttles_shell_without_loss_or_reordering() {
        const LINES: u32 = 50_000;
        let manager = TerminalManager::new(TerminalConfig {
            shell: Some(ShellCommand {
                program: "/bin/sh".into(),
                args: vec![
                    "-c".into(),
                    format!("read _; i=1; while [ $i -le {LINES} ]; do echo line$i; i=$((i+1)); done"),
                ],
            }),
            ..TerminalConfig::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let session = manager.create(dir.path(), 80, 24).await.unwrap();

        let slow = tokio::spawn(collect_until_exit(session.attach(), 200));
        let fast = tokio::spawn(collect_until_exit(session.attach(), 0));
        manager
            .input(&session.id, Bytes::from_static(b"\n"))
            .await
            .unwrap();

        let expected: Vec<u32> = (1..=LINES).collect();
        let slow = slow.await.unwrap();
        let fast = fast.await.unwrap();
        assert_eq!(numbered_lines(&slow), expected);
        assert_eq!(numbered_lines(&fast), expected);

        let pauses = session.stats.pauses.load(Ordering::Relaxed);
        assert!(pauses >= 1, "reader never paused");
        assert_eq!(pauses, session.stats.resumes.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn restart_issues_new_id_and_force_kill_by_cwd() {
        let manager = TerminalManager::new(sleeping_config());
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let first = manager.create(a.path(), 80, 24).await.unwrap();
        manager.create(b.path(), 80, 24).await.unwrap();

        let replacement = manager.restart(&first.id, a.path(), 100, 30).await.unwrap();
        assert_ne!(replacement.id, first.id);
        assert_eq!(replacement.size(), (100, 30));
        assert!(manager.get(&first.id).is_err());
        assert_eq!(manager.len(), 2);

        assert_eq!(manager.force_kill(&KillTarget::Cwd(a.path().to_path_buf())), 1);
        assert_eq!(manager.force_kill(&KillTarget::Session("nope".into())), 0);
        assert_eq!(manager.force_kill(&KillTarget::All), 1);
        assert!(manager.is_empty());
    }
}
