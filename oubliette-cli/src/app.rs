//! Wires every long-lived component into a single `App`: storage, the
//! container runtime, the relay registry, the session manager, the
//! scheduler, the cleanup watchdog, and the `Dispatcher` that sits in
//! front of all of it.

use std::sync::Arc;

use oubliette_core::container::ContainerLifecycle;
use oubliette_core::{
    BollardRuntime, CallerToolRelay, Config, RecursionGuard, RelayExecutorFactory, RelayRegistry,
    SessionManager,
};
use oubliette_mcp::{DefaultLimits, Dispatcher, NotificationHub};
use oubliette_scheduler::Scheduler;
use oubliette_store::{
    CleanupWatchdog, SqlitePool, SqliteProjectStore, SqliteScheduleStore, SqliteSessionStore,
    SqliteTokenStore, SqliteWorkspaceStore,
};

use crate::error::CliResult;
use crate::image_resolver::ConfigImageResolver;
use crate::schedule_runner::CliScheduleRunner;

/// Everything the daemon binary needs at runtime, built once from
/// `Config` in [`App::bootstrap`] and then shared behind `Arc`s across
/// the HTTP server, the relay listener, and the background tasks.
pub struct App {
    pub config: Config,
    pub dispatcher: Arc<Dispatcher<BollardRuntime>>,
    pub relay_registry: Arc<RelayRegistry>,
    pub cleanup: Arc<CleanupWatchdog>,
    pub manager: Arc<SessionManager>,
}

impl App {
    /// Opens storage, connects to the container runtime, and assembles
    /// the dispatcher. Does not start any background task or listener -
    /// that's `main`'s job, so tests can build an `App` without binding
    /// sockets or spawning loops.
    pub async fn bootstrap(config: Config) -> CliResult<Self> {
        let pool = match &config.database_path {
            Some(path) => SqlitePool::open(path)?,
            None => SqlitePool::default_location()?,
        };

        let projects = Arc::new(SqliteProjectStore::new(pool.clone()));
        let workspaces = Arc::new(SqliteWorkspaceStore::new(pool.clone()));
        let tokens = Arc::new(SqliteTokenStore::new(pool.clone()));
        let schedules = Arc::new(SqliteScheduleStore::new(pool.clone()));
        let sessions = Arc::new(SqliteSessionStore::new(pool));

        let resolver = Arc::new(ConfigImageResolver::new(config.container_types.clone()));
        let runtime = Arc::new(BollardRuntime::connect().map_err(oubliette_core::Error::from)?);
        let containers = Arc::new(ContainerLifecycle::new(runtime, resolver));

        let relay_registry = Arc::new(RelayRegistry::new());
        let executors = Arc::new(RelayExecutorFactory::new(relay_registry.clone()));
        let recursion = Arc::new(RecursionGuard::new(
            config.default_limits.max_depth,
            config.default_limits.max_agents,
            config.default_limits.max_cost_usd,
        ));

        let manager = Arc::new(SessionManager::new(
            sessions.clone(),
            workspaces.clone() as Arc<dyn oubliette_core::WorkspaceStore>,
            executors,
            recursion,
        ));

        let models: Vec<String> = config.models.iter().map(|m| m.id.clone()).collect();
        let runner = Arc::new(CliScheduleRunner::new(
            manager.clone(),
            projects.clone() as Arc<dyn oubliette_core::ProjectStore>,
            models.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            schedules.clone() as Arc<dyn oubliette_scheduler::ScheduleStore>,
            runner,
        ));

        let cleanup = Arc::new(CleanupWatchdog::new(config.cleanup.clone()));

        let hub = Arc::new(NotificationHub::default());
        let container_types: Vec<String> = config.container_types.keys().cloned().collect();
        let credential_refs: Vec<String> = config.credentials.keys().cloned().collect();

        let dispatcher = Arc::new(Dispatcher {
            projects: projects as Arc<dyn oubliette_core::ProjectStore>,
            tokens: tokens as Arc<dyn oubliette_core::TokenStore>,
            sessions: sessions as Arc<dyn oubliette_core::SessionStore>,
            schedules: schedules as Arc<dyn oubliette_scheduler::ScheduleStore>,
            manager: manager.clone(),
            containers,
            scheduler,
            hub,
            caller_tool_relay: CallerToolRelay::default(),
            default_limits: DefaultLimits {
                max_depth: config.default_limits.max_depth,
                max_agents: config.default_limits.max_agents,
                max_cost_usd: config.default_limits.max_cost_usd,
            },
            container_types,
            models,
            credential_refs,
        });

        Ok(Self {
            config,
            dispatcher,
            relay_registry,
            cleanup,
            manager,
        })
    }
}
