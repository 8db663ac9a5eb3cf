//! Process supervisor for the external agent server.
//!
//! A single long-lived [`Supervisor`] owns the agent's lifecycle: start,
//! endpoint discovery, readiness and health probing, and serialized restart.
//! Readers get lock-free [`ProcessHandle`] snapshots through `ArcSwap`;
//! every transition stores a fresh handle and bumps a `watch` revision so
//! waiters (the event relay) can react to endpoint changes.

pub mod launcher;
pub mod probe;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use launcher::{AgentEndpoint, AgentLauncher, LaunchedAgent, StartupError};
pub use probe::{AgentProbe, ProbeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Ready,
    Restarting,
    Exited,
}

/// Snapshot of the supervised instance. Replaced wholesale on every change.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub state: ProcessState,
    pub host: String,
    pub port: Option<u16>,
    pub api_prefix: String,
    pub last_error: Option<String>,
    /// The last failure will not clear without a configuration change.
    pub fatal: bool,
    pub ready_since: Option<Instant>,
    pub not_ready_since: Option<Instant>,
    /// Incremented per spawned instance; stale watchers compare against it.
    pub generation: u64,
}

impl ProcessHandle {
    fn initial(host: String) -> Self {
        Self {
            state: ProcessState::Starting,
            host,
            port: None,
            api_prefix: String::new(),
            last_error: None,
            fatal: false,
            ready_since: None,
            not_ready_since: Some(Instant::now()),
            generation: 0,
        }
    }

    pub fn endpoint(&self) -> Option<AgentEndpoint> {
        self.port.map(|port| AgentEndpoint::new(self.host.clone(), port))
    }

    pub fn is_ready(&self) -> bool {
        self.state == ProcessState::Ready && self.port.is_some()
    }

    pub fn readiness(&self) -> Readiness {
        match self.state {
            ProcessState::Ready if self.port.is_some() => Readiness::Ready,
            ProcessState::Restarting => Readiness::Restarting,
            _ => Readiness::NotReady {
                since: self.not_ready_since,
            },
        }
    }

    /// Map an inbound `/api/...` path onto the agent's own prefix.
    pub fn rewrite_path(&self, origin_path: &str) -> String {
        let rest = origin_path.strip_prefix("/api").unwrap_or(origin_path);
        let rest = if rest.is_empty() { "/" } else { rest };
        format!("{}{}", self.api_prefix, rest)
    }
}

/// The three states request gating distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    NotReady { since: Option<Instant> },
    Ready,
    Restarting,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error("restart failed: {0}")]
    RestartFailed(String),
    #[error("supervisor is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct SupervisorTimings {
    pub port_release_grace: Duration,
    pub crash_restart_delay: Duration,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub ready_budget: Duration,
    pub ready_retry: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            port_release_grace: Duration::from_millis(500),
            crash_restart_delay: Duration::from_secs(2),
            health_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(3),
            ready_budget: Duration::from_secs(20),
            ready_retry: Duration::from_millis(250),
        }
    }
}

type SharedRestart = Shared<BoxFuture<'static, Result<(), SupervisorError>>>;

pub struct Supervisor {
    launcher: Arc<dyn AgentLauncher>,
    probe: Arc<dyn AgentProbe>,
    timings: SupervisorTimings,
    handle: ArcSwap<ProcessHandle>,
    revision: watch::Sender<u64>,
    /// The installed instance, tagged with the generation that launched it.
    agent: Mutex<Option<(u64, LaunchedAgent)>>,
    inflight_restart: StdMutex<Option<SharedRestart>>,
    generation: AtomicU64,
    redetecting: AtomicBool,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        launcher: Arc<dyn AgentLauncher>,
        probe: Arc<dyn AgentProbe>,
        host: impl Into<String>,
        timings: SupervisorTimings,
    ) -> Arc<Self> {
        let (revision, _) = watch::channel(0);
        Arc::new(Self {
            launcher,
            probe,
            timings,
            handle: ArcSwap::from_pointee(ProcessHandle::initial(host.into())),
            revision,
            agent: Mutex::new(None),
            inflight_restart: StdMutex::new(None),
            generation: AtomicU64::new(0),
            redetecting: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<ProcessHandle> {
        self.handle.load_full()
    }

    pub fn readiness(&self) -> Readiness {
        self.handle.load().readiness()
    }

    /// Receiver that changes whenever a new handle is stored.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn restart_in_flight(&self) -> bool {
        self.inflight_restart
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Wait until the agent is ready, returning its handle.
    ///
    /// Returns `None` once shutdown starts.
    pub async fn wait_ready(&self) -> Option<Arc<ProcessHandle>> {
        let mut revisions = self.subscribe();
        loop {
            let handle = self.snapshot();
            if handle.is_ready() {
                return Some(handle);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                changed = revisions.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    fn update(&self, f: impl Fn(&mut ProcessHandle)) {
        self.handle.rcu(|current| {
            let mut next = ProcessHandle::clone(current);
            f(&mut next);
            next
        });
        self.revision.send_modify(|rev| *rev += 1);
    }

    fn record_failure(&self, generation: u64, err: &SupervisorError) {
        let message = err.to_string();
        let fatal = matches!(err, SupervisorError::Startup(inner) if inner.is_fatal());
        self.update(|h| {
            if h.generation == generation {
                h.state = ProcessState::Exited;
                h.port = None;
                h.ready_since = None;
                h.last_error = Some(message.clone());
                h.fatal = fatal;
            }
        });
    }

    /// Spawn the agent and wait for it to become ready.
    pub async fn start(self: &Arc<Self>) -> Result<Arc<ProcessHandle>, SupervisorError> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.update(|h| {
            h.state = ProcessState::Starting;
            h.generation = generation;
        });

        match self.launch_and_probe(generation).await {
            Ok(()) => Ok(self.snapshot()),
            Err(err) => {
                warn!(
                    component = "supervisor",
                    event = "supervisor.start.failed",
                    error = %err,
                    "OpenCode failed to start"
                );
                self.record_failure(generation, &err);
                Err(err)
            }
        }
    }

    /// Replace the running instance.
    ///
    /// Concurrent callers share the in-flight restart instead of starting
    /// another one. The restart runs on its own task, so it completes even
    /// if every caller goes away.
    pub async fn restart(self: &Arc<Self>, reason: &str) -> Result<(), SupervisorError> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }

        let shared = {
            let mut slot = self
                .inflight_restart
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = slot.as_ref() {
                info!(
                    component = "supervisor",
                    event = "supervisor.restart.joined",
                    reason = %reason,
                    "Joining in-flight restart"
                );
                existing.clone()
            } else {
                let this = Arc::clone(self);
                let reason = reason.to_string();
                let task: JoinHandle<Result<(), SupervisorError>> = tokio::spawn(async move {
                    let result = this.perform_restart(&reason).await;
                    this.inflight_restart
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    result
                });
                let shared = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(SupervisorError::RestartFailed(format!("restart task failed: {e}")))
                    })
                }
                .boxed()
                .shared();
                *slot = Some(shared.clone());
                shared
            }
        };

        shared.await
    }

    async fn perform_restart(self: &Arc<Self>, reason: &str) -> Result<(), SupervisorError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            component = "supervisor",
            event = "supervisor.restart.started",
            reason = %reason,
            generation,
            "Restarting OpenCode"
        );
        self.update(|h| {
            h.state = ProcessState::Restarting;
            h.generation = generation;
        });

        let previous = self.agent.lock().await.take();
        if let Some((_, previous)) = previous {
            self.launcher.terminate(previous).await;
        }
        tokio::time::sleep(self.timings.port_release_grace).await;

        let now = Instant::now();
        self.update(|h| {
            h.port = None;
            h.ready_since = None;
            h.not_ready_since = Some(now);
        });

        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }

        match self.launch_and_probe(generation).await {
            Ok(()) => {
                info!(
                    component = "supervisor",
                    event = "supervisor.restart.completed",
                    reason = %reason,
                    port = ?self.snapshot().port,
                    "OpenCode restarted"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    component = "supervisor",
                    event = "supervisor.restart.failed",
                    reason = %reason,
                    error = %err,
                    "OpenCode restart failed"
                );
                self.record_failure(generation, &err);
                Err(err)
            }
        }
    }

    async fn launch_and_probe(self: &Arc<Self>, generation: u64) -> Result<(), SupervisorError> {
        let agent = self.launcher.launch().await?;
        let endpoint = agent.endpoint.clone();
        let exit = agent.exit_watch();
        {
            let mut slot = self.agent.lock().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                drop(slot);
                self.launcher.terminate(agent).await;
                return Err(SupervisorError::RestartFailed(
                    "superseded by a newer launch".into(),
                ));
            }
            let replaced = slot.replace((generation, agent));
            drop(slot);
            if let Some((_, replaced)) = replaced {
                self.launcher.terminate(replaced).await;
            }
        }
        self.spawn_exit_watcher(exit.clone(), generation);

        self.update(|h| {
            if h.generation == generation {
                h.host = endpoint.host.clone();
                h.port = Some(endpoint.port);
            }
        });

        let probed = tokio::select! {
            probed = probe::wait_until_ready(
                self.probe.as_ref(),
                &endpoint,
                self.timings.ready_budget,
                self.timings.ready_retry,
                self.timings.probe_timeout,
            ) => probed,
            // The exit watcher owns recovery from here.
            status = launcher::wait_for_exit(exit) => {
                let code = status.and_then(|s| s.code);
                return Err(SupervisorError::RestartFailed(format!(
                    "OpenCode exited before becoming ready (code {code:?})"
                )));
            }
        };

        let prefix = match probed {
            Ok(prefix) => prefix,
            Err(err) => {
                // Only this launch's instance; a newer one may already be up.
                if let Some(stale) = self.take_agent_if(generation).await {
                    self.launcher.terminate(stale).await;
                }
                return Err(SupervisorError::RestartFailed(err.to_string()));
            }
        };

        let now = Instant::now();
        self.update(|h| {
            if h.generation == generation {
                h.state = ProcessState::Ready;
                h.api_prefix = prefix.clone();
                h.ready_since = Some(now);
                h.not_ready_since = None;
                h.last_error = None;
                h.fatal = false;
            }
        });
        info!(
            component = "supervisor",
            event = "supervisor.ready",
            port = endpoint.port,
            api_prefix = %prefix,
            generation,
            "OpenCode is ready"
        );
        Ok(())
    }

    /// Auto-restart after an unexpected exit, unless a controlled restart or
    /// shutdown already owns the lifecycle.
    fn spawn_exit_watcher(
        self: &Arc<Self>,
        exit: watch::Receiver<Option<launcher::AgentExit>>,
        generation: u64,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let status = launcher::wait_for_exit(exit).await;
            // Instances taken out of the slot were terminated on purpose.
            if !this.is_installed(generation).await || !this.owns_lifecycle(generation) {
                return;
            }

            let code = status.and_then(|s| s.code);
            warn!(
                component = "supervisor",
                event = "supervisor.process.crashed",
                code = ?code,
                generation,
                "OpenCode exited unexpectedly"
            );
            let now = Instant::now();
            this.update(|h| {
                if h.generation == generation {
                    h.state = ProcessState::Exited;
                    h.port = None;
                    h.ready_since = None;
                    h.not_ready_since = Some(now);
                    h.last_error = Some(format!("OpenCode exited unexpectedly (code {code:?})"));
                }
            });

            tokio::time::sleep(this.timings.crash_restart_delay).await;
            if !this.owns_lifecycle(generation) {
                return;
            }
            let _ = this.restart("process-exited").await;
        });
    }

    async fn is_installed(&self, generation: u64) -> bool {
        matches!(self.agent.lock().await.as_ref(), Some((g, _)) if *g == generation)
    }

    async fn take_agent_if(&self, generation: u64) -> Option<LaunchedAgent> {
        let mut slot = self.agent.lock().await;
        match slot.as_ref() {
            Some((g, _)) if *g == generation => slot.take().map(|(_, agent)| agent),
            _ => None,
        }
    }

    /// True while `generation` is current and nobody else is driving a
    /// transition.
    fn owns_lifecycle(&self, generation: u64) -> bool {
        let handle = self.snapshot();
        handle.generation == generation
            && handle.state != ProcessState::Restarting
            && !self.is_shutting_down()
            && !self.restart_in_flight()
    }

    /// One health-monitor pass.
    pub async fn check_health(self: &Arc<Self>) {
        if self.is_shutting_down() || self.restart_in_flight() {
            return;
        }
        let handle = self.snapshot();
        match handle.state {
            ProcessState::Ready => {
                let Some(endpoint) = handle.endpoint() else {
                    return;
                };
                let path = format!("{}{}", handle.api_prefix, probe::HEALTH_PATH);
                if let Err(err) = self
                    .probe
                    .get(&endpoint, &path, self.timings.probe_timeout)
                    .await
                {
                    if self.is_shutting_down() || self.restart_in_flight() {
                        return;
                    }
                    warn!(
                        component = "supervisor",
                        event = "supervisor.health.failed",
                        port = endpoint.port,
                        error = %err,
                        "Health check failed"
                    );
                    let _ = self.restart("health-check-failed").await;
                }
            }
            // A failed restart leaves us not-ready; the monitor is the next
            // triggering event. Missing binaries wait for reconfiguration.
            ProcessState::Exited if !handle.fatal => {
                let _ = self.restart("health-check-recovery").await;
            }
            _ => {}
        }
    }

    pub fn spawn_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.timings.health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => this.check_health().await,
                }
            }
        })
    }

    /// Called when a proxied request could not reach the agent although it
    /// is supposedly ready: the discovered endpoint may be stale.
    pub fn report_endpoint_drift(self: &Arc<Self>) {
        if self.redetecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.redetect_endpoint().await;
            this.redetecting.store(false, Ordering::SeqCst);
        });
    }

    async fn redetect_endpoint(self: &Arc<Self>) {
        let handle = self.snapshot();
        if !handle.is_ready() || self.restart_in_flight() {
            return;
        }
        let Some(endpoint) = handle.endpoint() else {
            return;
        };
        match probe::detect_api_prefix(self.probe.as_ref(), &endpoint, self.timings.probe_timeout)
            .await
        {
            Some(prefix) if prefix != handle.api_prefix => {
                info!(
                    component = "supervisor",
                    event = "supervisor.endpoint.prefix_changed",
                    old = %handle.api_prefix,
                    new = %prefix,
                );
                let generation = handle.generation;
                self.update(|h| {
                    if h.generation == generation {
                        h.api_prefix = prefix.clone();
                    }
                });
            }
            Some(_) => {}
            None => {
                warn!(
                    component = "supervisor",
                    event = "supervisor.endpoint.drifted",
                    port = endpoint.port,
                    "Discovered endpoint no longer answers"
                );
                let _ = self.restart("endpoint-drift").await;
            }
        }
    }

    /// Stop background loops and terminate the agent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let agent = self.agent.lock().await.take();
        if let Some((_, agent)) = agent {
            self.launcher.terminate(agent).await;
        }
        self.update(|h| {
            h.state = ProcessState::Exited;
            h.port = None;
            h.ready_since = None;
        });
        info!(
            component = "supervisor",
            event = "supervisor.shutdown",
            "Supervisor stopped"
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable launcher and probe shared by supervisor, gate and route tests.

    use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::watch;

    use super::launcher::{AgentEndpoint, AgentExit, AgentLauncher, LaunchedAgent, StartupError};
    use super::probe::{AgentProbe, ProbeError};

    #[derive(Default)]
    pub struct FakeLauncher {
        pub launches: AtomicUsize,
        pub terminations: AtomicUsize,
        pub missing_binary: AtomicBool,
        pub exits: Mutex<Vec<watch::Sender<Option<AgentExit>>>>,
    }

    impl FakeLauncher {
        /// Simulate the n-th (1-based) instance crashing.
        pub fn crash(&self, instance: usize, code: i32) {
            let exits = self.exits.lock().unwrap();
            let _ = exits[instance - 1].send(Some(AgentExit { code: Some(code) }));
        }
    }

    #[async_trait]
    impl AgentLauncher for FakeLauncher {
        async fn launch(&self) -> Result<LaunchedAgent, StartupError> {
            if self.missing_binary.load(Ordering::SeqCst) {
                return Err(StartupError::BinaryNotFound {
                    binary: "opencode".into(),
                });
            }
            let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            let (exit_tx, exit_rx) = watch::channel(None);
            self.exits.lock().unwrap().push(exit_tx);
            Ok(LaunchedAgent::new(
                Some(10_000 + n as u32),
                AgentEndpoint::new("127.0.0.1", 4000 + n as u16),
                exit_rx,
                None,
            ))
        }

        async fn terminate(&self, agent: LaunchedAgent) {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            let index = (agent.endpoint.port - 4000) as usize;
            // Killing the instance fires its exit watcher like a real process.
            let exits = self.exits.lock().unwrap();
            if let Some(tx) = exits.get(index - 1) {
                let _ = tx.send(Some(AgentExit { code: None }));
            }
        }
    }

    #[derive(Default)]
    pub struct FakeProbe {
        /// Number of upcoming calls that fail.
        pub failures: AtomicUsize,
        pub down: AtomicBool,
        /// A port that never answers (0 = none).
        pub silent_port: AtomicU16,
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentProbe for FakeProbe {
        async fn get(
            &self,
            endpoint: &AgentEndpoint,
            _: &str,
            _: Duration,
        ) -> Result<(), ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst)
                || self.silent_port.load(Ordering::SeqCst) == endpoint.port
            {
                return Err(ProbeError::Connect("connection refused".into()));
            }
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProbeError::Status(500));
            }
            Ok(())
        }
    }
}
