//! OpenChamber Server
//!
//! Host process for the OpenChamber web UI.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use openchamber_server::agent_config::ConfigRoots;
use openchamber_server::config::{Cli, Command, ServeArgs};
use openchamber_server::exec::{ExecJobs, DEFAULT_COMMAND_TIMEOUT, DEFAULT_JOB_TTL};
use openchamber_server::gate::NOT_READY_GRACE;
use openchamber_server::models_metadata::ModelsMetadata;
use openchamber_server::paths::DataPaths;
use openchamber_server::push::vapid::VapidKeys;
use openchamber_server::push::{
    spawn_delivery, spawn_triggers, PushDispatcher, SubscriptionStore, TriggerConfig,
    VisibilityTracker, WebPushSender,
};
use openchamber_server::relay::{EventRelay, RelayConfig};
use openchamber_server::routes::build_router;
use openchamber_server::settings::SettingsStore;
use openchamber_server::state::AppState;
use openchamber_server::supervisor::launcher::OpenCodeLauncher;
use openchamber_server::supervisor::probe::HttpProbe;
use openchamber_server::supervisor::{Supervisor, SupervisorTimings};
use openchamber_server::terminal::TerminalManager;
use openchamber_server::{cmd_status, logging, shell_env, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Some(Command::Status { host, port }) = &cli.command {
        return cmd_status::run(*host, *port).await;
    }
    let args = cli.serve_args().cloned().unwrap_or_default();
    let paths = DataPaths::resolve(cli.data_dir.as_deref())?;
    serve(args, paths).await
}

async fn serve(args: ServeArgs, paths: DataPaths) -> anyhow::Result<()> {
    paths.ensure_dirs()?;
    let logging = logging::init_logging(&paths.log_dir())?;
    info!(
        component = "server",
        event = "server.starting",
        version = VERSION,
        run_id = %logging.run_id,
        data_dir = %paths.root().display(),
        "Starting OpenChamber server"
    );

    // Resolve the login-shell PATH off the request path.
    tokio::spawn(shell_env::login_shell_path());

    let cancel = CancellationToken::new();
    let http = reqwest::Client::new();

    let supervisor = Supervisor::new(
        Arc::new(OpenCodeLauncher::new(args.launch_config())),
        Arc::new(HttpProbe::new(http.clone())),
        args.opencode_host.clone(),
        SupervisorTimings::default(),
    );

    let relay = EventRelay::new(RelayConfig::default(), cancel.clone());
    relay.spawn_upstream(supervisor.clone(), http.clone());

    let terminals = TerminalManager::new(args.terminal_config());
    terminals.spawn_reaper(cancel.clone());

    let exec_jobs = ExecJobs::new(DEFAULT_JOB_TTL, DEFAULT_COMMAND_TIMEOUT);
    exec_jobs.spawn_gc(cancel.clone());

    let vapid = VapidKeys::load_or_create(&paths.vapid_keys_path())?;
    let push_store = Arc::new(SubscriptionStore::new(paths.push_subscriptions_path()));
    let visibility = Arc::new(VisibilityTracker::new());
    let push = Arc::new(PushDispatcher::new(
        push_store.clone(),
        Arc::new(WebPushSender::new(
            http.clone(),
            vapid.clone(),
            args.vapid_subject.clone(),
        )),
        visibility.clone(),
    ));
    let notifications = spawn_triggers(relay.subscribe(), TriggerConfig::default(), cancel.clone());
    spawn_delivery(push, notifications);

    let config_roots = ConfigRoots::resolve()
        .ok_or_else(|| anyhow::anyhow!("HOME directory not found"))?;

    let state = AppState {
        supervisor: supervisor.clone(),
        relay,
        terminals: terminals.clone(),
        exec_jobs,
        settings: Arc::new(SettingsStore::new(paths.settings_path())),
        config_roots,
        models: Arc::new(ModelsMetadata::new(http.clone())),
        push_store,
        visibility,
        vapid_public_key: Arc::from(vapid.public_key.as_str()),
        http,
        gate_grace: NOT_READY_GRACE,
    };

    // The HTTP server comes up while the agent is still starting; the gate
    // answers 503 until it is ready.
    let starting = supervisor.clone();
    tokio::spawn(async move {
        match starting.start().await {
            Ok(handle) => info!(
                component = "server",
                event = "server.agent.ready",
                port = ?handle.port,
                api_prefix = %handle.api_prefix,
            ),
            Err(err) => error!(
                component = "server",
                event = "server.agent.start_failed",
                error = %err,
                "OpenCode failed to start"
            ),
        }
        starting.spawn_health_monitor();
    });

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        component = "server",
        event = "server.listening",
        bind = %addr,
        "Listening on {addr}"
    );

    // Open SSE streams end once the relay is cancelled and terminals are
    // killed, which lets graceful shutdown finish.
    let stopping = {
        let cancel = cancel.clone();
        let terminals = terminals.clone();
        async move {
            shutdown_signal().await;
            info!(component = "server", event = "server.stopping", "Shutting down");
            cancel.cancel();
            let killed = terminals.shutdown();
            if killed > 0 {
                warn!(
                    component = "server",
                    event = "server.terminals.killed",
                    killed,
                );
            }
        }
    };

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(stopping)
        .await?;

    supervisor.shutdown().await;
    info!(component = "server", event = "server.stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
