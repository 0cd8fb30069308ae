//! Persists session metadata, resolves workspace/model defaults, spawns
//! and resumes sessions via the executor, enforces recursion/fanout limits,
//! and registers the resulting `ActiveSession`.
//!
//! `SessionManager` is the one component that touches every other piece of
//! the orchestration core: `SessionStore` for durability, `RecursionGuard`
//! for admission, and an `ExecutorFactory` to obtain a fresh
//! `StreamingExecutor` bound to a project/workspace.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::executor::{CallerToolDecl, SessionContext, StreamingExecutor, TurnRequest};
use crate::recursion::RecursionGuard;
use crate::session::{validate_session_id, ActiveSession, Session, SessionError, SessionStatus, SessionStore};
use crate::types::Workspace;

/// Durable storage for workspaces, implemented by `oubliette-store`.
#[async_trait::async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Workspace>>;
    async fn default_for_project(&self, project_id: Uuid) -> Result<Option<Workspace>>;
    async fn create(&self, workspace: &Workspace) -> Result<()>;
}

/// Minimal view of a project `SessionManager` needs: its default workspace
/// and the model id to use when a spawn doesn't override one. The full
/// `Project` record lives in `oubliette-core::types` and is loaded by the
/// caller (the MCP dispatcher) before invoking `spawn`.
#[derive(Debug, Clone)]
pub struct ProjectDefaults {
    pub project_id: Uuid,
    pub default_workspace_id: Uuid,
    pub default_model_id: String,
}

/// Obtains a fresh `StreamingExecutor` bound to a session. One
/// implementation is sufficient today (socket-relay-backed, see
/// `oubliette-core::socket`); the factory indirection keeps
/// `SessionManager` decoupled from how an executor is actually wired to a
/// container.
pub trait ExecutorFactory: Send + Sync {
    fn create(&self) -> Arc<dyn StreamingExecutor>;
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOverrides {
    pub model_id: Option<String>,
    pub autonomy_level: Option<String>,
    pub reasoning_level: Option<String>,
    pub tool_allow_list: Vec<String>,
    pub tool_deny_list: Vec<String>,
    pub external_id: Option<String>,
    pub source: Option<String>,
}

/// Parameters for `SessionManager::spawn`.
#[derive(Debug, Clone)]
pub struct SpawnParams {
    pub project_id: Uuid,
    pub workspace_id: Option<Uuid>,
    pub create_workspace: bool,
    /// `None` for a prime session; `Some(parent)` for a recursive spawn.
    pub parent_id: Option<String>,
    pub creator_identity: String,
    pub prompt: String,
    pub overrides: SpawnOverrides,
    pub caller_tools: Vec<CallerToolDecl>,
}

/// `SessionManager` exclusively owns the persisted `Session` records (via
/// `store`) and the mapping from session id to `ActiveSession`.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    workspaces: Arc<dyn WorkspaceStore>,
    executors: Arc<dyn ExecutorFactory>,
    recursion: Arc<RecursionGuard>,
    active: RwLock<HashMap<String, Arc<ActiveSession>>>,
    event_buffer_capacity: usize,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        workspaces: Arc<dyn WorkspaceStore>,
        executors: Arc<dyn ExecutorFactory>,
        recursion: Arc<RecursionGuard>,
    ) -> Self {
        Self {
            store,
            workspaces,
            executors,
            recursion,
            active: RwLock::new(HashMap::new()),
            event_buffer_capacity: crate::buffer::DEFAULT_CAPACITY,
        }
    }

    /// Resolves the effective workspace id per a four-way matrix:
    /// absent+no-create uses the default; absent+create mints a new
    /// id; present+no-create requires it to exist; present+create creates
    /// it if missing.
    async fn resolve_workspace(
        &self,
        project: &ProjectDefaults,
        workspace_id: Option<Uuid>,
        create_workspace: bool,
    ) -> Result<Uuid> {
        match (workspace_id, create_workspace) {
            (None, false) => Ok(project.default_workspace_id),
            (None, true) => {
                let workspace = Workspace::new(project.project_id, "workspace");
                self.workspaces.create(&workspace).await?;
                Ok(workspace.id)
            }
            (Some(id), false) => {
                let existing = self.workspaces.get(id).await?;
                existing
                    .map(|w| w.id)
                    .ok_or_else(|| Error::NotFound(format!("workspace {id}")))
            }
            (Some(id), true) => {
                if let Some(existing) = self.workspaces.get(id).await? {
                    Ok(existing.id)
                } else {
                    let workspace = Workspace {
                        id,
                        project_id: project.project_id,
                        name: "workspace".to_string(),
                        is_default: false,
                        created_at: Utc::now(),
                    };
                    self.workspaces.create(&workspace).await?;
                    Ok(workspace.id)
                }
            }
        }
    }

    fn new_session_id(parent_id: &Option<String>) -> String {
        if parent_id.is_some() {
            let now = Utc::now();
            format!(
                "gogol_{}_{}",
                now.format("%Y%m%d_%H%M%S"),
                Uuid::new_v4().simple().to_string()[..8].to_string()
            )
        } else {
            Uuid::new_v4().to_string()
        }
    }

    /// Resolves `workspace`, loads the parent's depth/root if this is a
    /// recursive spawn, consults `RecursionGuard`, persists the `Session`,
    /// starts the executor, and registers the resulting `ActiveSession`.
    pub async fn spawn(
        &self,
        project: &ProjectDefaults,
        params: SpawnParams,
    ) -> Result<(Session, Arc<ActiveSession>, u64)> {
        let workspace_id = self
            .resolve_workspace(project, params.workspace_id, params.create_workspace)
            .await?;

        let (depth, root_id) = match &params.parent_id {
            None => (0, None),
            Some(parent_id) => {
                let parent = self
                    .store
                    .get(parent_id)
                    .await?
                    .ok_or_else(|| SessionError::NotFound(parent_id.clone()))?;
                let child_depth = parent.depth + 1;
                self.recursion.admit_child(&parent.root_id, child_depth)?;
                (child_depth, Some(parent.root_id.clone()))
            }
        };

        let id = Self::new_session_id(&params.parent_id);
        if !validate_session_id(&id) {
            return Err(Error::Internal(format!("generated invalid session id: {id}")));
        }

        let model_id = params
            .overrides
            .model_id
            .clone()
            .unwrap_or_else(|| project.default_model_id.clone());

        let mut session = Session::new_prime(id.clone(), project.project_id, workspace_id, model_id, params.creator_identity);
        session.parent_id = params.parent_id.clone();
        session.depth = depth;
        session.root_id = root_id.unwrap_or_else(|| id.clone());
        if let Some(autonomy) = params.overrides.autonomy_level {
            session.autonomy_level = autonomy;
        }
        if let Some(reasoning) = params.overrides.reasoning_level {
            session.reasoning_level = reasoning;
        }
        session.tool_allow_list = params.overrides.tool_allow_list;
        session.tool_deny_list = params.overrides.tool_deny_list;
        session.external_id = params.overrides.external_id;
        session.source = params.overrides.source;

        self.store.save(&session).await?;

        let executor = self.executors.create();
        executor
            .start(SessionContext {
                session_id: Uuid::parse_str(&session.root_id).unwrap_or(project.project_id),
                project_id: project.project_id,
                workspace_id,
                runtime_session_id: None,
            })
            .await?;

        let active = Arc::new(ActiveSession::with_capacity(
            session.id.clone(),
            executor,
            self.event_buffer_capacity,
        ));
        self.active.write().await.insert(session.id.clone(), active.clone());

        info!(session_id = %session.id, project_id = %project.project_id, depth, "session spawned");

        let index_at_start = active.buffer().next_index();
        let turn = TurnRequest {
            prompt: params.prompt,
            variant: None,
            attachments: Vec::new(),
            caller_tools: params.caller_tools,
        };
        active.send(turn).await?;
        self.spawn_pump(active.clone());

        Ok((session, active, index_at_start))
    }

    /// Drains one turn's event stream on a detached task, the way
    /// `ActiveSession::pump_until_terminal`'s own doc comment describes -
    /// every call site that successfully calls `send` owns spawning this.
    /// Once the pump settles, persists whatever it observed: a
    /// `runtime_session_id` (enabling `resume_or_spawn`'s resume branch)
    /// and/or a completion's token/cost usage (feeding `RecursionGuard`'s
    /// cumulative cost so `max_cost_usd` admission actually has data).
    fn spawn_pump(&self, active: Arc<ActiveSession>) {
        let store = self.store.clone();
        let recursion = self.recursion.clone();
        tokio::spawn(async move {
            if let Err(e) = active.pump_until_terminal().await {
                warn!(session_id = %active.session_id, error = %e, "session pump ended with error");
            }

            let runtime_session_id = active.runtime_session_id();
            let usage = active.take_last_usage();
            if runtime_session_id.is_none() && usage.is_none() {
                return;
            }

            match store.get(&active.session_id).await {
                Ok(Some(mut session)) => {
                    if let Some(rsid) = runtime_session_id {
                        session.runtime_session_id = Some(rsid);
                    }
                    if let Some((input_tokens, output_tokens, cost_usd)) = usage {
                        session.record_usage(input_tokens, output_tokens, cost_usd);
                        recursion.record_cost(&session.root_id, cost_usd);
                    }
                    if let Err(e) = store.save(&session).await {
                        warn!(session_id = %active.session_id, error = %e, "failed to persist pump outcome");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(session_id = %active.session_id, error = %e, "failed to load session after pump");
                }
            }
        });
    }

    /// If a non-terminal `ActiveSession` already exists for this session
    /// id, returns it. Otherwise, if the persisted session is resumable
    /// (terminal status but a known `runtime_session_id`), reinstates an
    /// executor against that id. Otherwise spawns fresh.
    pub async fn resume_or_spawn(
        &self,
        project: &ProjectDefaults,
        params: SpawnParams,
        existing_session_id: Option<&str>,
    ) -> Result<(Session, Arc<ActiveSession>, u64)> {
        if let Some(id) = existing_session_id {
            if let Some(active) = self.active.read().await.get(id) {
                if !active.status().is_terminal() {
                    let session = self
                        .store
                        .get(id)
                        .await?
                        .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
                    let index_at_start = active.buffer().next_index();
                    return Ok((session, active.clone(), index_at_start));
                }
            }

            if let Some(mut session) = self.store.get(id).await? {
                if session.status.is_terminal() && session.runtime_session_id.is_some() {
                    let executor = self.executors.create();
                    executor
                        .start(SessionContext {
                            session_id: Uuid::parse_str(&session.root_id).unwrap_or(project.project_id),
                            project_id: project.project_id,
                            workspace_id: session.workspace_id,
                            runtime_session_id: session.runtime_session_id.clone(),
                        })
                        .await?;
                    let active = Arc::new(ActiveSession::with_capacity(
                        session.id.clone(),
                        executor,
                        self.event_buffer_capacity,
                    ));
                    self.active.write().await.insert(session.id.clone(), active.clone());
                    session.transition(SessionStatus::Active);
                    self.store.save(&session).await?;

                    let index_at_start = active.buffer().next_index();
                    let turn = TurnRequest {
                        prompt: params.prompt,
                        variant: None,
                        attachments: Vec::new(),
                        caller_tools: params.caller_tools,
                    };
                    active.send(turn).await?;
                    self.spawn_pump(active.clone());
                    return Ok((session, active, index_at_start));
                }
            }
        }

        self.spawn(project, params).await
    }

    /// Resolves the `ActiveSession` for `session_id` - spawning one first
    /// if absent - and delegates to `ActiveSession::send`.
    pub async fn send(
        &self,
        project: &ProjectDefaults,
        session_id: &str,
        prompt: String,
        overrides: SpawnOverrides,
    ) -> Result<u64> {
        if let Some(active) = self.active.read().await.get(session_id).cloned() {
            let turn = TurnRequest::new(prompt);
            let index_at_start = active.send(turn).await?;
            self.spawn_pump(active);
            return Ok(index_at_start);
        }

        let params = SpawnParams {
            project_id: project.project_id,
            workspace_id: None,
            create_workspace: false,
            parent_id: None,
            creator_identity: "system".to_string(),
            prompt,
            overrides,
            caller_tools: Vec::new(),
        };
        let (_session, _active, index_at_start) = self
            .resume_or_spawn(project, params, Some(session_id))
            .await?;
        Ok(index_at_start)
    }

    /// Aborts in-flight work, transitions the session to `completed`,
    /// closes the executor, and detaches the `ActiveSession`. Idempotent:
    /// a second call returns `NotFound` rather than corrupting state.
    pub async fn end(&self, session_id: &str) -> Result<()> {
        let active = self
            .active
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if let Err(e) = active.abort().await {
            warn!(session_id, error = %e, "error aborting session during end");
        }

        if let Some(mut session) = self.store.get(session_id).await? {
            session.transition(SessionStatus::Completed);
            self.store.save(&session).await?;
            if session.is_prime() {
                self.recursion.forget(&session.root_id);
            }
        }
        Ok(())
    }

    /// Removes terminal session metadata older than `max_age`. Never
    /// touches `active`/`running` sessions regardless of age.
    pub async fn cleanup(
        &self,
        project_id: Option<Uuid>,
        max_age: chrono::Duration,
    ) -> Result<u32> {
        let cutoff = Utc::now() - max_age;
        let sessions = self.store.list(project_id).await?;
        let mut removed = 0;
        for session in sessions {
            if session.status.is_terminal() && session.updated_at < cutoff {
                self.store.delete(&session.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn get_active(&self, session_id: &str) -> Option<Arc<ActiveSession>> {
        self.active.read().await.get(session_id).cloned()
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        self.store.get(session_id).await.map_err(Error::from)
    }

    pub async fn list(&self, project_id: Option<Uuid>) -> Result<Vec<Session>> {
        self.store.list(project_id).await.map_err(Error::from)
    }
}

/// Lets `ContainerLifecycle::refresh`/`stop` ask "does this project have a
/// non-terminal session" without depending on `SessionManager` directly.
impl crate::container::ActiveSessionCheck for SessionManagerSessionCheck {
    fn has_non_terminal_session(&self, project_id: Uuid) -> bool {
        self.sessions
            .iter()
            .any(|(pid, status)| *pid == project_id && !status.is_terminal())
    }
}

/// Snapshot adapter: `ContainerLifecycle` needs a synchronous check, but
/// `SessionManager`'s registry is behind an async `RwLock`. Callers build
/// this snapshot right before calling `refresh`/`stop`.
pub struct SessionManagerSessionCheck {
    sessions: Vec<(Uuid, SessionStatus)>,
}

impl SessionManagerSessionCheck {
    pub async fn snapshot(manager: &SessionManager, store: &dyn SessionStore) -> Result<Self> {
        let active_ids: Vec<String> = manager.active.read().await.keys().cloned().collect();
        let mut sessions = Vec::with_capacity(active_ids.len());
        for id in active_ids {
            if let Some(session) = store.get(&id).await? {
                sessions.push((session.project_id, session.status));
            }
        }
        Ok(Self { sessions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StreamEventPayload;
    use async_trait::async_trait;
    use std::sync::Mutex as SyncMutex;

    #[derive(Default)]
    struct InMemorySessionStore {
        sessions: SyncMutex<HashMap<String, Session>>,
    }

    #[async_trait]
    impl SessionStore for InMemorySessionStore {
        async fn save(&self, session: &Session) -> std::result::Result<(), SessionError> {
            self.sessions
                .lock()
                .unwrap()
                .insert(session.id.clone(), session.clone());
            Ok(())
        }
        async fn get(&self, id: &str) -> std::result::Result<Option<Session>, SessionError> {
            Ok(self.sessions.lock().unwrap().get(id).cloned())
        }
        async fn list(
            &self,
            project_id: Option<Uuid>,
        ) -> std::result::Result<Vec<Session>, SessionError> {
            Ok(self
                .sessions
                .lock()
                .unwrap()
                .values()
                .filter(|s| project_id.map_or(true, |p| s.project_id == p))
                .cloned()
                .collect())
        }
        async fn delete(&self, id: &str) -> std::result::Result<(), SessionError> {
            self.sessions.lock().unwrap().remove(id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct InMemoryWorkspaceStore {
        workspaces: SyncMutex<HashMap<Uuid, Workspace>>,
    }

    #[async_trait]
    impl WorkspaceStore for InMemoryWorkspaceStore {
        async fn get(&self, id: Uuid) -> Result<Option<Workspace>> {
            Ok(self.workspaces.lock().unwrap().get(&id).cloned())
        }
        async fn default_for_project(&self, project_id: Uuid) -> Result<Option<Workspace>> {
            Ok(self
                .workspaces
                .lock()
                .unwrap()
                .values()
                .find(|w| w.project_id == project_id && w.is_default)
                .cloned())
        }
        async fn create(&self, workspace: &Workspace) -> Result<()> {
            self.workspaces
                .lock()
                .unwrap()
                .insert(workspace.id, workspace.clone());
            Ok(())
        }
    }

    struct ImmediateCompletionExecutor;

    #[async_trait]
    impl StreamingExecutor for ImmediateCompletionExecutor {
        async fn start(&self, _ctx: SessionContext) -> Result<()> {
            Ok(())
        }
        async fn send_message_async(&self, _turn: TurnRequest) -> Result<()> {
            Ok(())
        }
        async fn next_event(&self) -> Option<StreamEventPayload> {
            None
        }
        async fn abort(&self) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct NullExecutorFactory;
    impl ExecutorFactory for NullExecutorFactory {
        fn create(&self) -> Arc<dyn StreamingExecutor> {
            Arc::new(ImmediateCompletionExecutor)
        }
    }

    fn manager() -> (SessionManager, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::default());
        let workspaces = Arc::new(InMemoryWorkspaceStore::default());
        let manager = SessionManager::new(
            store.clone(),
            workspaces,
            Arc::new(NullExecutorFactory),
            Arc::new(RecursionGuard::default()),
        );
        (manager, store)
    }

    fn project_defaults() -> ProjectDefaults {
        ProjectDefaults {
            project_id: Uuid::new_v4(),
            default_workspace_id: Uuid::new_v4(),
            default_model_id: "claude".to_string(),
        }
    }

    #[tokio::test]
    async fn test_spawn_prime_session_depth_zero() {
        let (manager, _store) = manager();
        let project = project_defaults();
        let params = SpawnParams {
            project_id: project.project_id,
            workspace_id: None,
            create_workspace: false,
            parent_id: None,
            creator_identity: "admin".into(),
            prompt: "print hello".into(),
            overrides: SpawnOverrides::default(),
            caller_tools: vec![],
        };
        let (session, _active, _index) = manager.spawn(&project, params).await.unwrap();
        assert!(session.is_prime());
        assert_eq!(session.depth, 0);
        assert_eq!(session.workspace_id, project.default_workspace_id);
    }

    #[tokio::test]
    async fn test_spawn_child_increments_depth_and_shares_root() {
        let (manager, _store) = manager();
        let project = project_defaults();
        let root_params = SpawnParams {
            project_id: project.project_id,
            workspace_id: None,
            create_workspace: false,
            parent_id: None,
            creator_identity: "admin".into(),
            prompt: "root".into(),
            overrides: SpawnOverrides::default(),
            caller_tools: vec![],
        };
        let (root, _, _) = manager.spawn(&project, root_params).await.unwrap();

        let child_params = SpawnParams {
            project_id: project.project_id,
            workspace_id: None,
            create_workspace: false,
            parent_id: Some(root.id.clone()),
            creator_identity: "agent".into(),
            prompt: "child".into(),
            overrides: SpawnOverrides::default(),
            caller_tools: vec![],
        };
        let (child, _, _) = manager.spawn(&project, child_params).await.unwrap();
        assert_eq!(child.depth, 1);
        assert_eq!(child.root_id, root.id);
    }

    #[tokio::test]
    async fn test_spawn_with_unknown_workspace_not_found() {
        let (manager, _store) = manager();
        let project = project_defaults();
        let params = SpawnParams {
            project_id: project.project_id,
            workspace_id: Some(Uuid::new_v4()),
            create_workspace: false,
            parent_id: None,
            creator_identity: "admin".into(),
            prompt: "x".into(),
            overrides: SpawnOverrides::default(),
            caller_tools: vec![],
        };
        let err = manager.spawn(&project, params).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let (manager, _store) = manager();
        let project = project_defaults();
        let params = SpawnParams {
            project_id: project.project_id,
            workspace_id: None,
            create_workspace: false,
            parent_id: None,
            creator_identity: "admin".into(),
            prompt: "x".into(),
            overrides: SpawnOverrides::default(),
            caller_tools: vec![],
        };
        let (session, _active, _index) = manager.spawn(&project, params).await.unwrap();
        manager.end(&session.id).await.unwrap();
        let err = manager.end(&session.id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_terminal_old_sessions() {
        let (manager, store) = manager();
        let project = project_defaults();
        let params = SpawnParams {
            project_id: project.project_id,
            workspace_id: None,
            create_workspace: false,
            parent_id: None,
            creator_identity: "admin".into(),
            prompt: "x".into(),
            overrides: SpawnOverrides::default(),
            caller_tools: vec![],
        };
        let (session, _active, _index) = manager.spawn(&project, params).await.unwrap();
        manager.end(&session.id).await.unwrap();

        // not old enough yet
        let removed = manager.cleanup(None, chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(removed, 0);
        assert!(store.get(&session.id).await.unwrap().is_some());

        // backdate and retry
        if let Some(mut s) = store.sessions.lock().unwrap().get(&session.id).cloned() {
            s.updated_at = Utc::now() - chrono::Duration::hours(2);
            store.sessions.lock().unwrap().insert(s.id.clone(), s);
        }
        let removed = manager.cleanup(None, chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(removed, 1);
    }
}
