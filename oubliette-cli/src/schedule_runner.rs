//! Wires `oubliette-scheduler::ScheduleRunner` into `SessionManager`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oubliette_core::{
    ActiveSession, Error, ProjectDefaults, ProjectStore, Result, SessionManager, SessionStatus,
    SpawnOverrides, SpawnParams,
};
use oubliette_scheduler::ScheduleRunner;
use tracing::warn;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const MAX_WAIT: Duration = Duration::from_secs(600);

/// Runs a schedule's prompt by spawning or resuming a session through the
/// same `SessionManager` the MCP dispatcher uses, then waits for the
/// turn's pump to reach a non-running status so it can report back the
/// captured completion text `Scheduler::evaluate_target` records.
pub struct CliScheduleRunner {
    manager: Arc<SessionManager>,
    projects: Arc<dyn ProjectStore>,
    models: Vec<String>,
}

impl CliScheduleRunner {
    pub fn new(manager: Arc<SessionManager>, projects: Arc<dyn ProjectStore>, models: Vec<String>) -> Self {
        Self {
            manager,
            projects,
            models,
        }
    }

    async fn defaults(&self, project_id: Uuid) -> Result<ProjectDefaults> {
        let project = self
            .projects
            .get(project_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("project {project_id}")))?;
        Ok(ProjectDefaults {
            project_id: project.id,
            default_workspace_id: project.default_workspace_id,
            default_model_id: self
                .models
                .first()
                .cloned()
                .unwrap_or_else(|| "default".to_string()),
        })
    }

    /// `SessionManager::spawn`/`resume_or_spawn` return as soon as the turn
    /// is submitted, before the detached pump task drains a completion;
    /// there's no completion notifier on `ActiveSession` to await instead,
    /// so this polls status until it leaves `running`.
    async fn wait_for_completion(active: &ActiveSession) -> Option<String> {
        let deadline = tokio::time::Instant::now() + MAX_WAIT;
        loop {
            let status = active.status();
            if status.is_terminal() || status == SessionStatus::Idle {
                return active.last_completion_text();
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(session_id = %active.session_id, "schedule run timed out waiting for completion");
                return None;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ScheduleRunner for CliScheduleRunner {
    async fn run_new(
        &self,
        project_id: Uuid,
        workspace_id: Option<Uuid>,
        prompt: &str,
    ) -> Result<(String, String)> {
        let defaults = self.defaults(project_id).await?;
        let params = SpawnParams {
            project_id,
            workspace_id,
            create_workspace: false,
            parent_id: None,
            creator_identity: "scheduler".to_string(),
            prompt: prompt.to_string(),
            overrides: SpawnOverrides::default(),
            caller_tools: Vec::new(),
        };
        let (session, active, _) = self.manager.spawn(&defaults, params).await?;
        let text = Self::wait_for_completion(&active).await.unwrap_or_default();
        Ok((session.id, text))
    }

    async fn run_resume(
        &self,
        project_id: Uuid,
        workspace_id: Option<Uuid>,
        session_id: &str,
        prompt: &str,
    ) -> Result<(String, String)> {
        let defaults = self.defaults(project_id).await?;
        let params = SpawnParams {
            project_id,
            workspace_id,
            create_workspace: false,
            parent_id: None,
            creator_identity: "scheduler".to_string(),
            prompt: prompt.to_string(),
            overrides: SpawnOverrides::default(),
            caller_tools: Vec::new(),
        };
        let (session, active, _) = self
            .manager
            .resume_or_spawn(&defaults, params, Some(session_id))
            .await?;
        let text = Self::wait_for_completion(&active).await.unwrap_or_default();
        Ok((session.id, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oubliette_core::executor::{SessionContext, StreamingExecutor, TurnRequest};
    use oubliette_core::manager::ExecutorFactory;
    use oubliette_core::{RecursionGuard, StreamEventPayload};
    use oubliette_store::{SqlitePool, SqliteProjectStore, SqliteSessionStore, SqliteWorkspaceStore};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ImmediateCompletionExecutor {
        delivered: AtomicBool,
    }

    #[async_trait]
    impl StreamingExecutor for ImmediateCompletionExecutor {
        async fn start(&self, _ctx: SessionContext) -> Result<()> {
            Ok(())
        }
        async fn send_message_async(&self, _turn: TurnRequest) -> Result<()> {
            Ok(())
        }
        async fn next_event(&self) -> Option<StreamEventPayload> {
            if self.delivered.swap(true, Ordering::SeqCst) {
                None
            } else {
                Some(StreamEventPayload::Completion {
                    text: "done".to_string(),
                    turn_count: 1,
                    duration_ms: 1,
                    input_tokens: 0,
                    output_tokens: 0,
                    cost_usd: 0.0,
                })
            }
        }
        async fn abort(&self) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct ImmediateExecutorFactory;

    impl ExecutorFactory for ImmediateExecutorFactory {
        fn create(&self) -> Arc<dyn StreamingExecutor> {
            Arc::new(ImmediateCompletionExecutor {
                delivered: AtomicBool::new(false),
            })
        }
    }

    async fn setup() -> (CliScheduleRunner, Uuid) {
        let pool = SqlitePool::open_in_memory().unwrap();
        let projects: Arc<dyn ProjectStore> = Arc::new(SqliteProjectStore::new(pool.clone()));
        let workspaces = Arc::new(SqliteWorkspaceStore::new(pool.clone()));
        let sessions = Arc::new(SqliteSessionStore::new(pool));
        let recursion = Arc::new(RecursionGuard::new(3, 50, 10.0));
        let manager = Arc::new(SessionManager::new(
            sessions,
            workspaces.clone(),
            Arc::new(ImmediateExecutorFactory),
            recursion,
        ));

        let project_id = Uuid::new_v4();
        let workspace = oubliette_core::Workspace::new_default(project_id, "default");
        workspaces.create(&workspace).await.unwrap();
        let now = chrono::Utc::now();
        let project = oubliette_core::Project {
            id: project_id,
            name: "test".to_string(),
            source_origin: None,
            container_type: "default".to_string(),
            credential_refs: Vec::new(),
            default_workspace_id: workspace.id,
            resource_limits: Default::default(),
            isolation: Default::default(),
            status: oubliette_core::ProjectStatus::Active,
            created_at: now,
            updated_at: now,
        };
        projects.save(&project).await.unwrap();

        let runner = CliScheduleRunner::new(manager, projects, vec!["claude".to_string()]);
        (runner, project_id)
    }

    #[tokio::test]
    async fn run_new_reports_captured_completion_text() {
        let (runner, project_id) = setup().await;
        let (session_id, output) = runner.run_new(project_id, None, "ping").await.unwrap();
        assert!(!session_id.is_empty());
        assert_eq!(output, "done");
    }

    #[tokio::test]
    async fn run_resume_spawns_fresh_when_session_id_is_unknown() {
        let (runner, project_id) = setup().await;
        let (session_id, output) = runner
            .run_resume(project_id, None, "unknown-session", "ping")
            .await
            .unwrap();
        assert!(!session_id.is_empty());
        assert_eq!(output, "done");
    }

    #[tokio::test]
    async fn defaults_reject_unknown_project() {
        let (runner, _project_id) = setup().await;
        let err = runner.run_new(Uuid::new_v4(), None, "ping").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
