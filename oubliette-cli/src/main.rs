//! `oubliette`: the daemon binary. Loads a JSONC config, wires storage,
//! the container runtime, the scheduler, and the cleanup watchdog behind
//! a `Dispatcher`, then serves it over HTTP and per-project relay
//! sockets until told to stop.

mod agent_tools;
mod app;
mod error;
mod image_resolver;
mod relay_listener;
mod schedule_runner;

mod http;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use oubliette_core::Config;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::error::CliResult;

#[derive(Parser)]
#[command(name = "oubliette", about = "Containerized AI-agent orchestrator")]
struct Cli {
    /// Path to the JSONC config file.
    #[arg(long, default_value = "oubliette.jsonc")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon: HTTP server, relay listeners, scheduler, and cleanup watchdog.
    Serve,
    /// Load and validate the config file, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load_from_path(&cli.config)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::CheckConfig => {
            info!(path = %cli.config.display(), "config is valid");
            Ok(())
        }
        Command::Serve => serve(config).await.map_err(Into::into),
    }
}

async fn serve(config: Config) -> CliResult<()> {
    let server_address = config.server_address.clone();
    let relay_socket_dir = config.relay_socket_dir.clone();
    let cleanup_interval = Duration::from_secs(config.cleanup.interval_secs);

    let app = App::bootstrap(config).await?;
    let dispatcher = app.dispatcher.clone();
    let manager = app.manager.clone();
    let cleanup = app.cleanup.clone();
    let relay_registry = app.relay_registry.clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let router = http::build_router(http::AppState::new(dispatcher.clone()));
    let listener = tokio::net::TcpListener::bind(&server_address)
        .await
        .map_err(|source| crate::error::CliError::Bind { addr: server_address.clone(), source })?;
    info!(address = %server_address, "http server listening");

    let mut http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = http_shutdown.changed().await;
        });
        if let Err(e) = serve.await {
            error!(error = %e, "http server exited with error");
        }
    });

    let mut cleanup_shutdown = shutdown_rx.clone();
    let cleanup_manager = manager.clone();
    let cleanup_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = cleanup.run_once(&cleanup_manager).await;
                    info!(?report, "cleanup pass complete");
                }
                _ = cleanup_shutdown.changed() => {
                    if *cleanup_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let mut scheduler_shutdown = shutdown_rx.clone();
    let scheduler = dispatcher.scheduler.clone();
    let scheduler_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = scheduler.tick(chrono::Utc::now()).await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                _ = scheduler_shutdown.changed() => {
                    if *scheduler_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let relay_tasks = spawn_relay_listeners(
        dispatcher.clone(),
        relay_registry,
        relay_socket_dir,
        shutdown_rx.clone(),
    )
    .await?;

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining background tasks");
    let _ = shutdown_tx.send(true);

    let _ = http_task.await;
    let _ = cleanup_task.await;
    let _ = scheduler_task.await;
    for task in relay_tasks {
        let _ = task.await;
    }

    Ok(())
}

/// One relay listener per existing project, each accepting reconnects for
/// as long as the daemon runs. Projects created after startup start
/// carrying relay traffic the next time the daemon restarts; there is no
/// live listener-registration path yet (see `DESIGN.md`).
async fn spawn_relay_listeners(
    dispatcher: Arc<oubliette_mcp::Dispatcher<oubliette_core::BollardRuntime>>,
    registry: Arc<oubliette_core::RelayRegistry>,
    socket_dir: String,
    shutdown_rx: watch::Receiver<bool>,
) -> CliResult<Vec<tokio::task::JoinHandle<()>>> {
    let projects = dispatcher.projects.list().await?;
    let mut tasks = Vec::with_capacity(projects.len());
    for project in projects {
        let handler = Arc::new(agent_tools::AgentToolHandler::new(dispatcher.clone(), project.id));
        let listener = relay_listener::RelayListener::new(socket_dir.clone(), registry.clone(), handler);
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            listener.serve(project.id, &mut shutdown).await;
        }));
    }
    Ok(tasks)
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
