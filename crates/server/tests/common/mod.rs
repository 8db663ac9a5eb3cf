//! Shared fixtures: a stub agent server, scriptable launchers, and an
//! `AppState` wired the way `main` wires it.

#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body, Bytes};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::routing::{get as route_get, post};
use axum::{Json, Router};
use openchamber_server::agent_config::ConfigRoots;
use openchamber_server::exec::{ExecJobs, DEFAULT_COMMAND_TIMEOUT, DEFAULT_JOB_TTL};
use openchamber_server::models_metadata::{ModelsMetadata, MODELS_METADATA_TTL};
use openchamber_server::push::{SubscriptionStore, VisibilityTracker};
use openchamber_server::relay::{EventRelay, RelayConfig};
use openchamber_server::settings::SettingsStore;
use openchamber_server::state::AppState;
use openchamber_server::supervisor::launcher::AgentExit;
use openchamber_server::supervisor::probe::HttpProbe;
use openchamber_server::supervisor::{
    AgentEndpoint, AgentLauncher, LaunchedAgent, StartupError, Supervisor, SupervisorTimings,
};
use openchamber_server::terminal::pty::ShellCommand;
use openchamber_server::terminal::{TerminalConfig, TerminalManager};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// A minimal stand-in for the agent's HTTP API.
pub struct StubAgent {
    pub port: u16,
    pub events: broadcast::Sender<String>,
}

pub async fn spawn_stub_agent() -> StubAgent {
    let (events, _) = broadcast::channel::<String>(64);
    let feed = events.clone();
    let app = Router::new()
        .route("/config", route_get(|| async { Json(json!({})) }))
        .route("/agent", route_get(|| async { Json(json!([])) }))
        .route(
            "/session",
            route_get(|uri: axum::http::Uri| async move {
                Json(json!([{ "id": "ses_1", "query": uri.query() }]))
            }),
        )
        .route("/echo", post(|body: Bytes| async move { body }))
        .route(
            "/global/event",
            route_get(move || {
                let mut rx = feed.subscribe();
                async move {
                    let stream = async_stream::stream! {
                        while let Ok(data) = rx.recv().await {
                            yield Ok::<_, Infallible>(Bytes::from(format!("data: {data}\n\n")));
                        }
                    };
                    Response::builder()
                        .header(header::CONTENT_TYPE, "text/event-stream")
                        .body(Body::from_stream(stream))
                        .unwrap()
                }
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    StubAgent { port, events }
}

/// Launches "instances" that all point at one stub agent. Launches past
/// `block_after` hang, leaving the supervisor mid-start or mid-restart.
pub struct StubLauncher {
    pub port: u16,
    pub block_after: usize,
    pub launches: AtomicUsize,
    exits: Mutex<Vec<watch::Sender<Option<AgentExit>>>>,
}

impl StubLauncher {
    pub fn new(port: u16, block_after: usize) -> Self {
        Self {
            port,
            block_after,
            launches: AtomicUsize::new(0),
            exits: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AgentLauncher for StubLauncher {
    async fn launch(&self) -> Result<LaunchedAgent, StartupError> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        if n > self.block_after {
            std::future::pending::<()>().await;
        }
        let (exit_tx, exit_rx) = watch::channel(None);
        self.exits.lock().unwrap().push(exit_tx);
        Ok(LaunchedAgent::new(
            None,
            AgentEndpoint::new("127.0.0.1", self.port),
            exit_rx,
            None,
        ))
    }

    async fn terminate(&self, _agent: LaunchedAgent) {
        // Killing the instance fires its exit watcher like a real process.
        for exit in self.exits.lock().unwrap().iter() {
            let _ = exit.send(Some(AgentExit { code: None }));
        }
    }
}

pub fn fast_timings() -> SupervisorTimings {
    SupervisorTimings {
        port_release_grace: Duration::from_millis(20),
        crash_restart_delay: Duration::from_millis(50),
        ready_budget: Duration::from_secs(5),
        ready_retry: Duration::from_millis(20),
        ..SupervisorTimings::default()
    }
}

pub struct Harness {
    pub state: AppState,
    pub dir: tempfile::TempDir,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new(launcher: Arc<dyn AgentLauncher>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let http = reqwest::Client::new();
        let supervisor = Supervisor::new(
            launcher,
            Arc::new(HttpProbe::new(http.clone())),
            "127.0.0.1",
            fast_timings(),
        );
        let push_store = Arc::new(SubscriptionStore::new(dir.path().join("push.json")));
        let visibility = Arc::new(VisibilityTracker::new());
        let state = AppState {
            supervisor,
            relay: EventRelay::new(RelayConfig::default(), cancel.clone()),
            terminals: TerminalManager::new(TerminalConfig {
                max_sessions: 2,
                shell: Some(ShellCommand {
                    program: "/bin/sh".into(),
                    args: Vec::new(),
                }),
                ..TerminalConfig::default()
            }),
            exec_jobs: ExecJobs::new(DEFAULT_JOB_TTL, DEFAULT_COMMAND_TIMEOUT),
            settings: Arc::new(SettingsStore::new(dir.path().join("settings.json"))),
            config_roots: ConfigRoots::at(dir.path().join("opencode")),
            // Nothing listens here; tests that need the catalog build their own.
            models: Arc::new(ModelsMetadata::with_source(
                http.clone(),
                "http://127.0.0.1:9/api.json",
                MODELS_METADATA_TTL,
            )),
            push_store,
            visibility,
            vapid_public_key: Arc::from("BPUBLICKEY"),
            http,
            gate_grace: openchamber_server::gate::NOT_READY_GRACE,
        };
        Self { state, dir, cancel }
    }

    pub fn router(&self) -> Router {
        openchamber_server::routes::build_router(self.state.clone())
    }

    pub async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let response = self.router().oneshot(req).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&body).into_owned())
            })
        };
        (status, json)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.state.terminals.shutdown();
    }
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}
