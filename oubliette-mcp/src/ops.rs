//! Typed request/response payloads for every action in the MCP tool
//! surface. These are what the dispatcher is driven by in tests and
//! by whatever wire transport (stdio/HTTP MCP) a caller layers on top.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use oubliette_core::{IsolationFlags, Project, ResourceLimitOverrides, Scope, Session, Workspace};
use oubliette_scheduler::{ExecutionOutcome, OverlapPolicy, Schedule, SessionPolicy};

// ---- project ----

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectCreateRequest {
    pub name: String,
    pub container_type: String,
    #[serde(default)]
    pub credential_refs: Vec<String>,
    #[serde(default)]
    pub resource_limits: ResourceLimitOverrides,
    #[serde(default)]
    pub isolation: IsolationFlags,
    #[serde(default)]
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectCreateResponse {
    pub project: Project,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectListResponse {
    pub projects: Vec<Project>,
}

// ---- container ----

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerExecRequest {
    pub project_id: Uuid,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerExecResponse {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerStartResponse {
    pub container_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerRefreshRequest {
    pub project_id: Uuid,
}

// ---- session ----

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSpawnRequest {
    pub project_id: Uuid,
    #[serde(default)]
    pub workspace_id: Option<Uuid>,
    #[serde(default)]
    pub create_workspace: bool,
    pub prompt: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub autonomy_level: Option<String>,
    #[serde(default)]
    pub reasoning_level: Option<String>,
    #[serde(default)]
    pub tool_allow_list: Vec<String>,
    #[serde(default)]
    pub tool_deny_list: Vec<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// Resume `session_id` if it already exists and `new_session` is false.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub new_session: bool,
    /// Recursive spawn only: the caller's own session id, used both to
    /// derive depth/root and as the global-target fallback project.
    #[serde(default)]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionMessageRequest {
    pub session_id: String,
    pub prompt: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub autonomy_level: Option<String>,
    #[serde(default)]
    pub reasoning_level: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSendResponse {
    pub session: Session,
    /// Buffer index to pass as `since_index` on the next `session.events` call.
    pub index_at_start: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionEventsRequest {
    pub session_id: String,
    pub since_index: u64,
    #[serde(default)]
    pub max_events: Option<usize>,
    #[serde(default)]
    pub include_children: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionEventsResponse {
    pub events: Vec<oubliette_core::StreamEvent>,
    pub next_index: u64,
    pub gap: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionListRequest {
    #[serde(default)]
    pub project_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<Session>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionCleanupRequest {
    #[serde(default)]
    pub project_id: Option<Uuid>,
    pub max_age_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionCleanupResponse {
    pub removed: u32,
}

// ---- workspace ----

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceListResponse {
    pub workspaces: Vec<Workspace>,
}

// ---- token ----

#[derive(Debug, Clone, Deserialize)]
pub struct TokenCreateRequest {
    pub label: String,
    pub scope: Scope,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenCreateResponse {
    pub token: oubliette_core::Token,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenListResponse {
    pub tokens: Vec<oubliette_core::Token>,
}

// ---- schedule ----

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleCreateRequest {
    pub display_name: String,
    pub cron_expression: String,
    pub prompt: String,
    pub targets: Vec<ScheduleTargetRequest>,
    #[serde(default)]
    pub overlap_policy: Option<OverlapPolicy>,
    #[serde(default)]
    pub session_policy: Option<SessionPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleTargetRequest {
    pub project_id: Uuid,
    #[serde(default)]
    pub workspace_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleUpdateRequest {
    pub id: Uuid,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub overlap_policy: Option<OverlapPolicy>,
    #[serde(default)]
    pub session_policy: Option<SessionPolicy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleResponse {
    pub schedule: Schedule,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleListResponse {
    pub schedules: Vec<Schedule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleHistoryRequest {
    pub schedule_id: Uuid,
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    50
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleHistoryResponse {
    pub rows: Vec<ScheduleHistoryRowWire>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleHistoryRowWire {
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionOutcome,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

// ---- caller tool response ----

#[derive(Debug, Clone, Deserialize)]
pub struct CallerToolResponseRequest {
    pub session_id: String,
    pub request_id: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

// ---- project_options / config_limits ----

#[derive(Debug, Clone, Serialize)]
pub struct ProjectOptionsResponse {
    pub container_types: Vec<String>,
    pub models: Vec<String>,
    pub credential_refs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigLimitsRequest {
    pub project_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigLimitsResponse {
    pub max_depth: u32,
    pub max_agents: u32,
    pub max_cost_usd: f64,
}

/// Server-to-client notification payload pushed over the single channel
/// per connection; a `caller_tool_request` is encoded the same
/// way the socket relay's own notification is, just surfaced through the
/// dispatcher's channel instead of the socket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    SessionEvent {
        event: oubliette_core::StreamEvent,
    },
    CallerToolRequest {
        session_id: String,
        request_id: String,
        tool: String,
        arguments: serde_json::Value,
    },
}
