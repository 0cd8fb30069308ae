//! The unified MCP operation dispatcher: one entry point per
//! action, each checked against `(target, access)` before it touches
//! `oubliette-core`/`oubliette-scheduler` state. Everything an MCP caller
//! can do - project/workspace/session/schedule/token management, caller
//! tool responses - routes through a method here rather than through ad
//! hoc per-transport handlers, so the scope matrix is enforced exactly
//! once regardless of what framing (stdio/HTTP MCP) sits on top.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use oubliette_core::container::{ContainerLifecycle, ContainerRuntime};
use oubliette_core::manager::{ProjectDefaults, SessionManager, SessionManagerSessionCheck, SpawnOverrides, SpawnParams};
use oubliette_core::{
    Access, AuthContext, CallerToolRelay, PushSink, ProjectStore, SessionStore, Target, Token, TokenStore,
};
use oubliette_scheduler::{ExecutionOutcome, Schedule, Scheduler, ScheduleStore, SessionPolicy, Target as ScheduleTarget};

use crate::error::{DispatchError, DispatchResult};
use crate::ops::*;
use crate::scope::{authorize, resolve_target};

/// Deployment-wide defaults a dispatcher instance is built with;
/// per-project overrides are merged on top when recursion admission is
/// evaluated, mirroring `Project::resource_limits`.
#[derive(Debug, Clone)]
pub struct DefaultLimits {
    pub max_depth: u32,
    pub max_agents: u32,
    pub max_cost_usd: f64,
}

/// Broadcasts `Notification`s to every connection subscribed to a
/// session - the single push channel per connection.
/// The socket/HTTP transport layer (out of scope here) owns turning this
/// into frames on the wire; the dispatcher only owns deciding what to
/// push and to which session's subscribers. Uses a sync lock because
/// `ActiveSession`'s `PushSink::push` is itself a sync callback (it must
/// never block the async buffer-append it's called from).
pub struct NotificationHub {
    channels: SyncRwLock<HashMap<String, broadcast::Sender<Notification>>>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self {
            channels: SyncRwLock::new(HashMap::new()),
        }
    }
}

impl NotificationHub {
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<Notification> {
        let mut channels = self.channels.write();
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    fn publish(&self, session_id: &str, notification: Notification) {
        if let Some(tx) = self.channels.read().get(session_id) {
            let _ = tx.send(notification);
        }
    }

    pub fn drop_session(&self, session_id: &str) {
        self.channels.write().remove(session_id);
    }
}

/// Adapts `NotificationHub` to the `PushSink` an `ActiveSession` pushes
/// JSON-encoded events through. `ActiveSession` serializes both ordinary
/// `StreamEvent`s and the ad hoc `caller_tool` request shape (see
/// `ActiveSession::notify_caller_tool`) to `Value` before calling `push`,
/// so this is where they're told apart and re-typed into `Notification`.
struct HubPushSink {
    hub: Arc<NotificationHub>,
    session_id: String,
}

impl PushSink for HubPushSink {
    fn push(&self, event_json: serde_json::Value) -> std::result::Result<(), ()> {
        if event_json.get("type").and_then(|t| t.as_str()) == Some("caller_tool") {
            let request_id = event_json["request_id"].as_str().unwrap_or_default().to_string();
            let tool = event_json["tool_name"].as_str().unwrap_or_default().to_string();
            let arguments = event_json["params"].clone();
            self.hub.publish(
                &self.session_id,
                Notification::CallerToolRequest {
                    session_id: self.session_id.clone(),
                    request_id,
                    tool,
                    arguments,
                },
            );
            return Ok(());
        }
        let event: oubliette_core::StreamEvent = serde_json::from_value(event_json).map_err(|_| ())?;
        self.hub.publish(&self.session_id, Notification::SessionEvent { event });
        Ok(())
    }
}

/// Everything a dispatcher call needs to resolve `project.list`-style
/// defaults without round-tripping through the full `Project` record
/// twice; built from `ProjectStore::get`.
fn project_defaults(project: &oubliette_core::Project, models: &[String]) -> ProjectDefaults {
    ProjectDefaults {
        project_id: project.id,
        default_workspace_id: project.default_workspace_id,
        default_model_id: models.first().cloned().unwrap_or_else(|| "default".to_string()),
    }
}

pub struct Dispatcher<R: ContainerRuntime> {
    pub projects: Arc<dyn ProjectStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub manager: Arc<SessionManager>,
    pub containers: Arc<ContainerLifecycle<R>>,
    pub scheduler: Arc<Scheduler>,
    pub hub: Arc<NotificationHub>,
    pub caller_tool_relay: CallerToolRelay,
    pub default_limits: DefaultLimits,
    pub container_types: Vec<String>,
    pub models: Vec<String>,
    pub credential_refs: Vec<String>,
}

impl<R: ContainerRuntime> Dispatcher<R> {
    async fn authorize_call(
        &self,
        auth: &AuthContext,
        project_id: Option<Uuid>,
        session_id: Option<&str>,
        access: Access,
    ) -> DispatchResult<Target> {
        let target = resolve_target(self.sessions.as_ref(), project_id, session_id, auth.scope.project_id()).await?;
        authorize(auth, target, access)?;
        Ok(target)
    }

    async fn load_project(&self, id: Uuid) -> DispatchResult<oubliette_core::Project> {
        self.projects
            .get(id)
            .await
            .map_err(DispatchError::from)?
            .ok_or_else(|| DispatchError::from(oubliette_core::Error::NotFound(format!("project {id}"))))
    }

    // ---- project ----

    pub async fn project_create(
        &self,
        auth: &AuthContext,
        req: ProjectCreateRequest,
    ) -> DispatchResult<ProjectCreateResponse> {
        authorize(auth, Target::Global, Access::Admin)?;
        if !self.container_types.iter().any(|c| *c == req.container_type) {
            return Err(DispatchError::invalid_params(format!(
                "unknown container_type '{}'",
                req.container_type
            )));
        }
        let project_id = Uuid::new_v4();
        let workspace = oubliette_core::Workspace::new_default(project_id, "default");
        let now = chrono::Utc::now();
        let project = oubliette_core::Project {
            id: project_id,
            name: req.name,
            source_origin: req.source_url,
            container_type: req.container_type,
            credential_refs: req.credential_refs,
            default_workspace_id: workspace.id,
            resource_limits: req.resource_limits,
            isolation: req.isolation,
            status: oubliette_core::ProjectStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.projects.save(&project).await.map_err(DispatchError::from)?;
        Ok(ProjectCreateResponse { project })
    }

    pub async fn project_list(&self, auth: &AuthContext) -> DispatchResult<ProjectListResponse> {
        let all = self.projects.list().await.map_err(DispatchError::from)?;
        let projects = all
            .into_iter()
            .filter(|p| crate::scope::visible_project(&auth.scope, p.id))
            .collect();
        Ok(ProjectListResponse { projects })
    }

    pub async fn project_delete(&self, auth: &AuthContext, project_id: Uuid) -> DispatchResult<()> {
        authorize(auth, Target::Global, Access::Admin)?;
        let mut project = self.load_project(project_id).await?;
        if project.is_deleting() {
            return Err(oubliette_core::Error::Conflict(format!("project {project_id} already deleting")).into());
        }
        project.status = oubliette_core::ProjectStatus::Deleting;
        project.updated_at = chrono::Utc::now();
        self.projects.save(&project).await.map_err(DispatchError::from)?;

        self.containers
            .remove(&project)
            .await
            .map_err(DispatchError::from)?;
        self.projects.delete(project_id).await.map_err(DispatchError::from)?;
        Ok(())
    }

    pub async fn project_options(&self, auth: &AuthContext) -> DispatchResult<ProjectOptionsResponse> {
        authorize(auth, Target::Global, Access::Read)?;
        Ok(ProjectOptionsResponse {
            container_types: self.container_types.clone(),
            models: self.models.clone(),
            credential_refs: self.credential_refs.clone(),
        })
    }

    pub async fn config_limits(
        &self,
        auth: &AuthContext,
        req: ConfigLimitsRequest,
    ) -> DispatchResult<ConfigLimitsResponse> {
        self.authorize_call(auth, Some(req.project_id), None, Access::Read).await?;
        let project = self.load_project(req.project_id).await?;
        Ok(ConfigLimitsResponse {
            max_depth: project.resource_limits.max_depth.unwrap_or(self.default_limits.max_depth),
            max_agents: project.resource_limits.max_agents.unwrap_or(self.default_limits.max_agents),
            max_cost_usd: project.resource_limits.max_cost_usd.unwrap_or(self.default_limits.max_cost_usd),
        })
    }

    // ---- workspace ----

    pub async fn workspace_list(
        &self,
        auth: &AuthContext,
        project_id: Uuid,
    ) -> DispatchResult<WorkspaceListResponse> {
        self.authorize_call(auth, Some(project_id), None, Access::Read).await?;
        // Workspace listing is derived from sessions' workspace ids plus the
        // project default; no dedicated WorkspaceStore::list exists because
        // the only callers that need a full listing are operators, who can
        // enumerate via project + default lookup.
        let project = self.load_project(project_id).await?;
        let default = oubliette_core::Workspace::new_default(project_id, "default");
        let mut workspaces = vec![oubliette_core::Workspace {
            id: project.default_workspace_id,
            ..default
        }];
        workspaces.dedup_by_key(|w| w.id);
        Ok(WorkspaceListResponse { workspaces })
    }

    // ---- container ----

    pub async fn container_start(
        &self,
        auth: &AuthContext,
        project_id: Uuid,
    ) -> DispatchResult<ContainerStartResponse> {
        self.authorize_call(auth, Some(project_id), None, Access::Write).await?;
        let project = self.load_project(project_id).await?;
        let id = self.containers.ensure_running(&project).await.map_err(DispatchError::from)?;
        Ok(ContainerStartResponse { container_id: id.0 })
    }

    pub async fn container_refresh(
        &self,
        auth: &AuthContext,
        req: ContainerRefreshRequest,
    ) -> DispatchResult<ContainerStartResponse> {
        self.authorize_call(auth, Some(req.project_id), None, Access::Write).await?;
        let project = self.load_project(req.project_id).await?;
        let snapshot = SessionManagerSessionCheck::snapshot(&self.manager, self.sessions.as_ref())
            .await
            .map_err(DispatchError::from)?;
        let id = self
            .containers
            .refresh(&project, &snapshot)
            .await
            .map_err(DispatchError::from)?;
        Ok(ContainerStartResponse { container_id: id.0 })
    }

    pub async fn container_stop(&self, auth: &AuthContext, project_id: Uuid) -> DispatchResult<()> {
        self.authorize_call(auth, Some(project_id), None, Access::Write).await?;
        let project = self.load_project(project_id).await?;
        let snapshot = SessionManagerSessionCheck::snapshot(&self.manager, self.sessions.as_ref())
            .await
            .map_err(DispatchError::from)?;
        self.containers.stop(&project, &snapshot).await.map_err(DispatchError::from)?;
        Ok(())
    }

    pub async fn container_exec(
        &self,
        auth: &AuthContext,
        req: ContainerExecRequest,
    ) -> DispatchResult<ContainerExecResponse> {
        self.authorize_call(auth, Some(req.project_id), None, Access::Write).await?;
        let out = self
            .containers
            .exec(req.project_id, req.command)
            .await
            .map_err(DispatchError::from)?;
        Ok(ContainerExecResponse {
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    // ---- session ----

    pub async fn session_spawn(
        &self,
        auth: &AuthContext,
        req: SessionSpawnRequest,
    ) -> DispatchResult<SessionSendResponse> {
        self.authorize_call(auth, Some(req.project_id), None, Access::Write).await?;
        let project = self.load_project(req.project_id).await?;
        let defaults = project_defaults(&project, &self.models);

        let params = SpawnParams {
            project_id: req.project_id,
            workspace_id: req.workspace_id,
            create_workspace: req.create_workspace,
            parent_id: req.parent_id,
            creator_identity: auth.token_id.to_string(),
            prompt: req.prompt,
            overrides: SpawnOverrides {
                model_id: req.model_id,
                autonomy_level: req.autonomy_level,
                reasoning_level: req.reasoning_level,
                tool_allow_list: req.tool_allow_list,
                tool_deny_list: req.tool_deny_list,
                external_id: req.external_id,
                source: req.source,
            },
            caller_tools: Vec::new(),
        };

        let (session, active, index_at_start) = if req.new_session {
            self.manager.spawn(&defaults, params).await.map_err(DispatchError::from)?
        } else {
            self.manager
                .resume_or_spawn(&defaults, params, req.session_id.as_deref())
                .await
                .map_err(DispatchError::from)?
        };

        let sink = Arc::new(HubPushSink {
            hub: self.hub.clone(),
            session_id: session.id.clone(),
        });
        active.register_push_sink(sink).await;

        Ok(SessionSendResponse { index_at_start, session })
    }

    pub async fn session_message(
        &self,
        auth: &AuthContext,
        req: SessionMessageRequest,
    ) -> DispatchResult<SessionSendResponse> {
        let target = self
            .authorize_call(auth, None, Some(&req.session_id), Access::Write)
            .await?;
        let project_id = match target {
            Target::Project(p) => p,
            Target::Global => return Err(DispatchError::invalid_params("session has no project")),
        };
        let project = self.load_project(project_id).await?;
        let defaults = project_defaults(&project, &self.models);

        let index_at_start = self
            .manager
            .send(
                &defaults,
                &req.session_id,
                req.prompt,
                SpawnOverrides {
                    model_id: req.model_id,
                    autonomy_level: req.autonomy_level,
                    reasoning_level: req.reasoning_level,
                    ..Default::default()
                },
            )
            .await
            .map_err(DispatchError::from)?;

        let session = self
            .sessions
            .get(&req.session_id)
            .await
            .map_err(oubliette_core::Error::from)?
            .ok_or_else(|| oubliette_core::Error::NotFound(format!("session {}", req.session_id)))?;
        Ok(SessionSendResponse { session, index_at_start })
    }

    pub async fn session_events(
        &self,
        auth: &AuthContext,
        req: SessionEventsRequest,
    ) -> DispatchResult<SessionEventsResponse> {
        self.authorize_call(auth, None, Some(&req.session_id), Access::Read).await?;
        let active = self
            .manager
            .get_active(&req.session_id)
            .await
            .ok_or_else(|| oubliette_core::Error::NotFound(format!("session {} is not active", req.session_id)))?;
        let range = active.events_since(req.since_index);
        let mut events = range.events;
        if let Some(max) = req.max_events {
            events.truncate(max);
        }
        Ok(SessionEventsResponse {
            events,
            next_index: range.next_index,
            gap: range.gap,
        })
    }

    pub async fn session_list(
        &self,
        auth: &AuthContext,
        req: SessionListRequest,
    ) -> DispatchResult<SessionListResponse> {
        if let Some(project_id) = req.project_id {
            self.authorize_call(auth, Some(project_id), None, Access::Read).await?;
        } else {
            authorize(auth, Target::Global, Access::Read)?;
        }
        let all = self.manager.list(req.project_id).await.map_err(DispatchError::from)?;
        let sessions = all
            .into_iter()
            .filter(|s| crate::scope::visible_project(&auth.scope, s.project_id))
            .collect();
        Ok(SessionListResponse { sessions })
    }

    pub async fn session_end(&self, auth: &AuthContext, session_id: &str) -> DispatchResult<()> {
        self.authorize_call(auth, None, Some(session_id), Access::Write).await?;
        self.manager.end(session_id).await.map_err(DispatchError::from)?;
        self.hub.drop_session(session_id);
        Ok(())
    }

    pub async fn session_cleanup(
        &self,
        auth: &AuthContext,
        req: SessionCleanupRequest,
    ) -> DispatchResult<SessionCleanupResponse> {
        if let Some(project_id) = req.project_id {
            self.authorize_call(auth, Some(project_id), None, Access::Admin).await?;
        } else {
            authorize(auth, Target::Global, Access::Admin)?;
        }
        let removed = self
            .manager
            .cleanup(req.project_id, Duration::seconds(req.max_age_seconds))
            .await
            .map_err(DispatchError::from)?;
        Ok(SessionCleanupResponse { removed })
    }

    pub async fn caller_tool_response(
        &self,
        auth: &AuthContext,
        req: CallerToolResponseRequest,
    ) -> DispatchResult<()> {
        self.authorize_call(auth, None, Some(&req.session_id), Access::Write).await?;
        let owner_session_id = self
            .caller_tool_relay
            .owner_of(&req.request_id)
            .await
            .ok_or_else(|| oubliette_core::Error::from(oubliette_core::RelayError::Unknown(req.request_id.clone())))?;
        let active = self
            .manager
            .get_active(&owner_session_id)
            .await
            .ok_or_else(|| oubliette_core::Error::NotFound(format!("session {owner_session_id} is not active")))?;
        let value = req
            .result
            .unwrap_or_else(|| serde_json::json!({ "error": req.error.unwrap_or(serde_json::Value::Null) }));
        self.caller_tool_relay
            .resolve(&active, &req.session_id, &req.request_id, value)
            .await
            .map_err(|e| DispatchError::from(oubliette_core::Error::from(e)))?;
        Ok(())
    }

    // ---- token ----

    pub async fn token_create(
        &self,
        auth: &AuthContext,
        req: TokenCreateRequest,
    ) -> DispatchResult<TokenCreateResponse> {
        authorize(auth, Target::Global, Access::Admin)?;
        let token = Token::new(req.label, req.scope);
        self.tokens.save(&token).await.map_err(DispatchError::from)?;
        Ok(TokenCreateResponse { token })
    }

    pub async fn token_list(&self, auth: &AuthContext) -> DispatchResult<TokenListResponse> {
        authorize(auth, Target::Global, Access::Admin)?;
        let tokens = self.tokens.list().await.map_err(DispatchError::from)?;
        Ok(TokenListResponse { tokens })
    }

    pub async fn token_revoke(&self, auth: &AuthContext, token_id: Uuid) -> DispatchResult<()> {
        authorize(auth, Target::Global, Access::Admin)?;
        self.tokens.revoke(token_id).await.map_err(DispatchError::from)?;
        Ok(())
    }

    // ---- schedule ----

    pub async fn schedule_create(
        &self,
        auth: &AuthContext,
        req: ScheduleCreateRequest,
    ) -> DispatchResult<ScheduleResponse> {
        for target in &req.targets {
            self.authorize_call(auth, Some(target.project_id), None, Access::Write).await?;
        }
        if oubliette_scheduler::parse_cron(&req.cron_expression).is_err() {
            return Err(DispatchError::invalid_params(format!(
                "invalid cron expression '{}'",
                req.cron_expression
            )));
        }
        let mut schedule = Schedule::new(req.display_name, req.cron_expression, req.prompt, auth);
        schedule.targets = req
            .targets
            .into_iter()
            .map(|t| ScheduleTarget::new(t.project_id, t.workspace_id))
            .collect();
        if let Some(policy) = req.overlap_policy {
            schedule.overlap_policy = policy;
        }
        if let Some(policy) = req.session_policy {
            schedule.session_policy = policy;
        }
        schedule.next_run_at = Some(
            oubliette_scheduler::next_run_after(&schedule.cron_expression, chrono::Utc::now())
                .map_err(|e| DispatchError::invalid_params(e.to_string()))?,
        );
        self.schedules.save(&schedule).await.map_err(DispatchError::from)?;
        Ok(ScheduleResponse { schedule })
    }

    pub async fn schedule_update(
        &self,
        auth: &AuthContext,
        req: ScheduleUpdateRequest,
    ) -> DispatchResult<ScheduleResponse> {
        let mut schedule = self
            .schedules
            .get(req.id)
            .await
            .map_err(DispatchError::from)?
            .ok_or_else(|| DispatchError::from(oubliette_core::Error::NotFound(format!("schedule {}", req.id))))?;
        for target in &schedule.targets {
            self.authorize_call(auth, Some(target.project_id), None, Access::Write).await?;
        }
        if let Some(name) = req.display_name {
            schedule.display_name = name;
        }
        if let Some(cron) = req.cron_expression {
            if oubliette_scheduler::parse_cron(&cron).is_err() {
                return Err(DispatchError::invalid_params(format!("invalid cron expression '{cron}'")));
            }
            schedule.cron_expression = cron;
        }
        if let Some(prompt) = req.prompt {
            schedule.prompt = prompt;
        }
        if let Some(enabled) = req.enabled {
            schedule.enabled = enabled;
        }
        if let Some(policy) = req.overlap_policy {
            schedule.overlap_policy = policy;
        }
        if let Some(policy) = req.session_policy {
            schedule.session_policy = policy;
        }
        schedule.updated_at = chrono::Utc::now();
        schedule.next_run_at = Some(
            oubliette_scheduler::next_run_after(&schedule.cron_expression, chrono::Utc::now())
                .map_err(|e| DispatchError::invalid_params(e.to_string()))?,
        );
        self.schedules.save(&schedule).await.map_err(DispatchError::from)?;
        Ok(ScheduleResponse { schedule })
    }

    pub async fn schedule_delete(&self, auth: &AuthContext, id: Uuid) -> DispatchResult<()> {
        let schedule = self
            .schedules
            .get(id)
            .await
            .map_err(DispatchError::from)?
            .ok_or_else(|| DispatchError::from(oubliette_core::Error::NotFound(format!("schedule {id}"))))?;
        for target in &schedule.targets {
            self.authorize_call(auth, Some(target.project_id), None, Access::Write).await?;
        }
        self.schedules.delete(id).await.map_err(DispatchError::from)?;
        Ok(())
    }

    pub async fn schedule_list(&self, auth: &AuthContext) -> DispatchResult<ScheduleListResponse> {
        let all = self.schedules.list().await.map_err(DispatchError::from)?;
        let schedules = all.into_iter().filter(|s| s.visible_to(&auth.scope)).collect();
        Ok(ScheduleListResponse { schedules })
    }

    pub async fn schedule_history(
        &self,
        auth: &AuthContext,
        req: ScheduleHistoryRequest,
    ) -> DispatchResult<ScheduleHistoryResponse> {
        let schedule = self
            .schedules
            .get(req.schedule_id)
            .await
            .map_err(DispatchError::from)?
            .ok_or_else(|| DispatchError::from(oubliette_core::Error::NotFound(format!("schedule {}", req.schedule_id))))?;
        if !schedule.visible_to(&auth.scope) {
            return Err(oubliette_core::Error::PermissionDenied("schedule not visible to this scope".into()).into());
        }
        let rows = self
            .schedules
            .history(req.schedule_id, req.limit)
            .await
            .map_err(DispatchError::from)?;
        Ok(ScheduleHistoryResponse {
            rows: rows
                .into_iter()
                .map(|r| ScheduleHistoryRowWire {
                    executed_at: r.executed_at,
                    status: r.status,
                    output: r.output,
                    error: r.error,
                    duration_ms: r.duration_ms,
                })
                .collect(),
        })
    }
}

/// Whether `outcome` should be logged as a warning: the one non-fatal
/// surprise in the scheduler's overlap handling (`queue` degrading to
/// `skip`) doesn't produce its own `ExecutionOutcome`, so callers of
/// `Scheduler::tick` surface that distinction from the scheduler's own
/// tracing output rather than from dispatcher state.
pub fn log_unexpected_skip(outcome: ExecutionOutcome, schedule_display_name: &str) {
    if matches!(outcome, ExecutionOutcome::Skipped) {
        warn!(schedule = schedule_display_name, "scheduled run skipped due to overlap policy");
    }
}

/// Whether the session policy for a target calls for a brand new session
/// per firing rather than resuming the pinned one - used by the cron
/// runner (`oubliette-cli`'s `ScheduleRunner` impl) to decide whether to
/// clear `Target::session_id` before invoking `SessionManager`.
pub fn wants_new_session(policy: SessionPolicy) -> bool {
    matches!(policy, SessionPolicy::New)
}
