//! HTTP transport for the MCP dispatcher surface. One route per
//! `Dispatcher` operation; every handler resolves its caller's
//! `AuthContext` from the `Authorization` header before delegating.

pub mod auth;
pub mod container;
pub mod error;
pub mod project;
pub mod schedule;
pub mod session;
pub mod sse;
pub mod state;
pub mod token;

use axum::routing::{delete, get, patch, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub use state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/projects", post(project::create).get(project::list))
        .route("/projects/:project_id", delete(project::delete))
        .route("/projects/options", get(project::options))
        .route("/projects/:project_id/limits", get(project::config_limits))
        .route("/projects/:project_id/workspaces", get(project::workspaces))
        .route("/projects/:project_id/container/start", post(container::start))
        .route("/projects/:project_id/container/refresh", post(container::refresh))
        .route("/projects/:project_id/container/stop", post(container::stop))
        .route("/containers/exec", post(container::exec))
        .route("/sessions/spawn", post(session::spawn))
        .route("/sessions/message", post(session::message))
        .route("/sessions", get(session::list))
        .route("/sessions/:session_id/events", get(session::events))
        .route("/sessions/:session_id/stream", get(sse::stream))
        .route("/sessions/:session_id", delete(session::end))
        .route("/sessions/cleanup", post(session::cleanup))
        .route("/sessions/caller_tool_response", post(session::caller_tool_response))
        .route("/tokens", post(token::create).get(token::list))
        .route("/tokens/:token_id", delete(token::revoke))
        .route("/schedules", post(schedule::create).get(schedule::list))
        .route("/schedules/:id", patch(schedule::update).delete(schedule::delete))
        .route("/schedules/:id/history", get(schedule::history))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oubliette_core::{
        BollardRuntime, CallerToolRelay, ContainerLifecycle, RecursionGuard, SessionManager,
    };
    use oubliette_mcp::{DefaultLimits, Dispatcher, NotificationHub};
    use oubliette_scheduler::Scheduler;
    use oubliette_store::{
        SqlitePool, SqliteProjectStore, SqliteScheduleStore, SqliteSessionStore, SqliteTokenStore,
        SqliteWorkspaceStore,
    };
    use std::collections::HashMap;
    use std::sync::Arc;

    struct UnreachableRunner;

    #[async_trait::async_trait]
    impl oubliette_scheduler::ScheduleRunner for UnreachableRunner {
        async fn run_new(
            &self,
            _project_id: uuid::Uuid,
            _workspace_id: Option<uuid::Uuid>,
            _prompt: &str,
        ) -> oubliette_core::Result<(String, String)> {
            unreachable!("no schedule fires in this test")
        }

        async fn run_resume(
            &self,
            _project_id: uuid::Uuid,
            _workspace_id: Option<uuid::Uuid>,
            _session_id: &str,
            _prompt: &str,
        ) -> oubliette_core::Result<(String, String)> {
            unreachable!("no schedule fires in this test")
        }
    }

    struct NoExecutorFactory;

    impl oubliette_core::manager::ExecutorFactory for NoExecutorFactory {
        fn create(&self) -> Arc<dyn oubliette_core::StreamingExecutor> {
            unreachable!("this test never starts a session")
        }
    }

    async fn test_state() -> AppState {
        let pool = SqlitePool::open_in_memory().unwrap();
        let projects = Arc::new(SqliteProjectStore::new(pool.clone()));
        let workspaces = Arc::new(SqliteWorkspaceStore::new(pool.clone()));
        let tokens = Arc::new(SqliteTokenStore::new(pool.clone()));
        let schedules = Arc::new(SqliteScheduleStore::new(pool.clone()));
        let sessions = Arc::new(SqliteSessionStore::new(pool));

        let resolver = Arc::new(crate::image_resolver::ConfigImageResolver::new(HashMap::new()));
        let runtime = Arc::new(BollardRuntime::connect().expect("docker socket available in CI sandbox"));
        let containers = Arc::new(ContainerLifecycle::new(runtime, resolver));

        let executors: Arc<dyn oubliette_core::manager::ExecutorFactory> = Arc::new(NoExecutorFactory);
        let recursion = Arc::new(RecursionGuard::new(3, 50, 10.0));
        let manager = Arc::new(SessionManager::new(
            sessions.clone(),
            workspaces.clone() as Arc<dyn oubliette_core::WorkspaceStore>,
            executors,
            recursion,
        ));
        let scheduler = Arc::new(Scheduler::new(
            schedules.clone() as Arc<dyn oubliette_scheduler::ScheduleStore>,
            Arc::new(UnreachableRunner),
        ));

        let dispatcher = Arc::new(Dispatcher {
            projects: projects as Arc<dyn oubliette_core::ProjectStore>,
            tokens: tokens as Arc<dyn oubliette_core::TokenStore>,
            sessions: sessions as Arc<dyn oubliette_core::SessionStore>,
            schedules: schedules as Arc<dyn oubliette_scheduler::ScheduleStore>,
            manager,
            containers,
            scheduler,
            hub: Arc::new(NotificationHub::default()),
            caller_tool_relay: CallerToolRelay::default(),
            default_limits: DefaultLimits { max_depth: 3, max_agents: 50, max_cost_usd: 10.0 },
            container_types: vec!["default".to_string()],
            models: vec!["claude".to_string()],
            credential_refs: Vec::new(),
        });

        AppState::new(dispatcher)
    }

    #[tokio::test]
    #[ignore = "requires a reachable docker daemon to construct BollardRuntime"]
    async fn router_builds_without_panicking() {
        let _router = build_router(test_state().await);
    }
}
