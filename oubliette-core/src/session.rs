//! Persisted session metadata and its in-memory runtime projection.
//!
//! `Session` is the durable record, mutated only via `SessionManager`.
//! `ActiveSession` is the transient handle for a session with a live
//! executor attached - it owns the event buffer, the pending caller-tool
//! requests, and the push-notification sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex as AsyncMutex, RwLock};
use uuid::Uuid;

use crate::buffer::{EventBuffer, RangeRead, DEFAULT_CAPACITY};
use crate::events::StreamEventPayload;
use crate::executor::{StreamingExecutor, TurnRequest};

/// `active` | `running` | `idle` | `completed` | `failed`.
///
/// Transitions are monotone per message: `active -> running -> (idle |
/// completed | failed)`. `completed` and `failed` are terminal for that
/// turn but the session may be resumed into `active` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Running,
    Idle,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The durable record of one orchestration thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: Uuid,
    pub workspace_id: Uuid,
    pub parent_id: Option<String>,
    pub root_id: String,
    pub depth: u32,
    pub model_id: String,
    pub autonomy_level: String,
    pub reasoning_level: String,
    #[serde(default)]
    pub tool_allow_list: Vec<String>,
    #[serde(default)]
    pub tool_deny_list: Vec<String>,
    pub creator_identity: String,
    pub status: SessionStatus,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub turns: u32,
    pub cost_usd: f64,
    /// Opaque id returned by the agent; used to resume on reconnection.
    pub runtime_session_id: Option<String>,
    /// Set on `failed` transitions, cleared on successful resume.
    pub last_error: Option<String>,
    pub external_id: Option<String>,
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new_prime(
        id: String,
        project_id: Uuid,
        workspace_id: Uuid,
        model_id: impl Into<String>,
        creator_identity: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            root_id: id.clone(),
            id,
            project_id,
            workspace_id,
            parent_id: None,
            depth: 0,
            model_id: model_id.into(),
            autonomy_level: "default".to_string(),
            reasoning_level: "default".to_string(),
            tool_allow_list: Vec::new(),
            tool_deny_list: Vec::new(),
            creator_identity: creator_identity.into(),
            status: SessionStatus::Active,
            input_tokens: 0,
            output_tokens: 0,
            turns: 0,
            cost_usd: 0.0,
            runtime_session_id: None,
            last_error: None,
            external_id: None,
            source: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `depth == 0 <=> parent_id == None`, and depth always equals
    /// `parent.depth + 1` otherwise.
    pub fn is_prime(&self) -> bool {
        self.depth == 0 && self.parent_id.is_none()
    }

    pub fn record_usage(&mut self, input_tokens: u64, output_tokens: u64, cost_usd: f64) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.cost_usd += cost_usd;
        self.turns += 1;
        self.updated_at = Utc::now();
    }

    pub fn transition(&mut self, status: SessionStatus) {
        if status != SessionStatus::Failed {
            self.last_error = None;
        }
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn fail_with(&mut self, reason: impl Into<String>) {
        self.status = SessionStatus::Failed;
        self.last_error = Some(reason.into());
        self.updated_at = Utc::now();
    }
}

/// Validates a session id per the three accepted forms: a UUID
/// (admin-spawned), `gogol_<YYYYMMDD>_<HHMMSS>_<hex>` (agent-generated), or
/// `child_<parent>_<counter>` (legacy, read-only per the design notes).
pub fn validate_session_id(id: &str) -> bool {
    if Uuid::parse_str(id).is_ok() {
        return true;
    }
    if let Some(rest) = id.strip_prefix("gogol_") {
        let parts: Vec<&str> = rest.splitn(3, '_').collect();
        if parts.len() == 3
            && parts[0].len() == 8
            && parts[0].chars().all(|c| c.is_ascii_digit())
            && parts[1].len() == 6
            && parts[1].chars().all(|c| c.is_ascii_digit())
            && !parts[2].is_empty()
            && parts[2].chars().all(|c| c.is_ascii_hexdigit())
        {
            return true;
        }
    }
    if let Some(rest) = id.strip_prefix("child_") {
        return rest.contains('_') && !rest.is_empty();
    }
    false
}

/// Sink for push notifications to the caller that owns a session.
/// Implemented by the MCP dispatcher's per-connection channel.
pub trait PushSink: Send + Sync {
    /// Returns `Err` if the sink is broken (channel closed); the caller
    /// never retries - `ActiveSession` marks the sink disabled on error.
    fn push(&self, event_json: serde_json::Value) -> std::result::Result<(), ()>;
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session {0} has a send in flight")]
    SendInFlight(String),
    #[error("workspace {workspace} does not belong to project {project}")]
    WorkspaceMismatch { workspace: Uuid, project: Uuid },
    #[error("invalid session id: {0}")]
    InvalidId(String),
    #[error("event buffer gap")]
    BufferGap,
    #[error("agent event stream ended without completion")]
    StreamEndedWithoutCompletion,
}

/// Durable storage backend for sessions. Implemented by `oubliette-store`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, session: &Session) -> std::result::Result<(), SessionError>;
    async fn get(&self, id: &str) -> std::result::Result<Option<Session>, SessionError>;
    async fn list(
        &self,
        project_id: Option<Uuid>,
    ) -> std::result::Result<Vec<Session>, SessionError>;
    async fn delete(&self, id: &str) -> std::result::Result<(), SessionError>;
}

/// The in-memory handle for a session with a live executor attached.
///
/// Owns the executor, the event buffer, the pending caller-tool request
/// map, and a mutex serializing `send` on this session. `send` holds the
/// mutex only across the wire-level submit, not across the whole turn -
/// event consumption proceeds on a separate task via `pump_until_terminal`.
pub struct ActiveSession {
    pub session_id: String,
    executor: Arc<dyn StreamingExecutor>,
    buffer: Arc<EventBuffer>,
    send_lock: AsyncMutex<()>,
    push_sink: RwLock<Option<Arc<dyn PushSink>>>,
    pending: RwLock<HashMap<String, oneshot::Sender<serde_json::Value>>>,
    max_pending: usize,
    status: SyncMutex<SessionStatus>,
    last_completion_text: SyncMutex<Option<String>>,
    runtime_session_id: SyncMutex<Option<String>>,
    last_usage: SyncMutex<Option<(u64, u64, f64)>>,
}

impl ActiveSession {
    pub fn new(session_id: String, executor: Arc<dyn StreamingExecutor>) -> Self {
        Self::with_capacity(session_id, executor, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(
        session_id: String,
        executor: Arc<dyn StreamingExecutor>,
        capacity: usize,
    ) -> Self {
        Self {
            session_id,
            executor,
            buffer: Arc::new(EventBuffer::new(capacity)),
            send_lock: AsyncMutex::new(()),
            push_sink: RwLock::new(None),
            pending: RwLock::new(HashMap::new()),
            max_pending: 128,
            status: SyncMutex::new(SessionStatus::Active),
            last_completion_text: SyncMutex::new(None),
            runtime_session_id: SyncMutex::new(None),
            last_usage: SyncMutex::new(None),
        }
    }

    /// The most recent turn's final assistant text, if any turn has
    /// completed yet. Used by the scheduler's `ScheduleRunner` to capture
    /// `Target::last_output` without re-reading the whole event buffer.
    pub fn last_completion_text(&self) -> Option<String> {
        self.last_completion_text.lock().clone()
    }

    /// The agent-assigned runtime session id, if a `System` event has been
    /// observed yet. `SessionManager` reads this after each pump to persist
    /// it onto the `Session` record.
    pub fn runtime_session_id(&self) -> Option<String> {
        self.runtime_session_id.lock().clone()
    }

    /// Takes the most recent turn's token/cost usage, clearing it so a pump
    /// with no new completion doesn't cause it to be recorded twice.
    pub fn take_last_usage(&self) -> Option<(u64, u64, f64)> {
        self.last_usage.lock().take()
    }

    pub fn buffer(&self) -> &Arc<EventBuffer> {
        &self.buffer
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.lock() = status;
    }

    /// Installs or replaces the push sink. Idempotent.
    pub async fn register_push_sink(&self, sink: Arc<dyn PushSink>) {
        *self.push_sink.write().await = Some(sink);
    }

    /// Appends a payload to the buffer and, if it's pushable, forwards it
    /// to the push sink. A broken sink is disabled rather than retried;
    /// it never blocks the buffer.
    async fn append_and_maybe_push(&self, payload: StreamEventPayload) -> u64 {
        let pushable = payload.is_pushable();
        let index = self.buffer.append(payload, None, None, None);
        if pushable {
            let mut sink_slot = self.push_sink.write().await;
            if let Some(sink) = sink_slot.as_ref() {
                if let RangeRead { events, .. } = self.buffer.range_since(index) {
                    if let Some(event) = events.into_iter().find(|e| e.index == index) {
                        let json = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
                        if sink.push(json).is_err() {
                            *sink_slot = None;
                        }
                    }
                }
            }
        }
        index
    }

    /// Submits a prompt. Rejects with `SendInFlight` if another `send` is
    /// already running on this session - either still mid wire-submit
    /// (guarded by `send_lock`) or already submitted and streaming
    /// (guarded by `status`, which only leaves `Running` once
    /// `pump_until_terminal` observes completion, error, or stream end).
    /// The rejection itself is recorded as a buffered `status=failed`
    /// event and the session stays resumable.
    pub async fn send(&self, turn: TurnRequest) -> crate::error::Result<u64> {
        let _guard = match self.send_lock.try_lock() {
            Ok(g) => g,
            Err(_) => {
                self.append_and_maybe_push(StreamEventPayload::Status {
                    text: SessionStatus::Failed,
                })
                .await;
                return Err(SessionError::SendInFlight(self.session_id.clone()).into());
            }
        };
        if self.status() == SessionStatus::Running {
            self.append_and_maybe_push(StreamEventPayload::Status {
                text: SessionStatus::Failed,
            })
            .await;
            return Err(SessionError::SendInFlight(self.session_id.clone()).into());
        }
        self.set_status(SessionStatus::Running);
        let index_at_start = self.buffer.next_index();
        self.append_and_maybe_push(StreamEventPayload::Status {
            text: SessionStatus::Running,
        })
        .await;
        self.executor.send_message_async(turn).await?;
        Ok(index_at_start)
    }

    /// Drains the executor's event stream until completion, failure, or
    /// natural end, appending every payload to the buffer. Intended to run
    /// as a background pump task per turn, separate from `send`'s lock.
    pub async fn pump_until_terminal(&self) -> crate::error::Result<()> {
        loop {
            match self.executor.next_event().await {
                Some(StreamEventPayload::Completion {
                    ref text,
                    input_tokens,
                    output_tokens,
                    cost_usd,
                    ..
                }) => {
                    *self.last_completion_text.lock() = Some(text.clone());
                    *self.last_usage.lock() = Some((input_tokens, output_tokens, cost_usd));
                    self.set_status(SessionStatus::Idle);
                    break;
                }
                Some(StreamEventPayload::Error { .. }) => {
                    self.set_status(SessionStatus::Failed);
                    break;
                }
                Some(StreamEventPayload::System { ref runtime_session_id }) => {
                    *self.runtime_session_id.lock() = Some(runtime_session_id.clone());
                    self.append_and_maybe_push(StreamEventPayload::System {
                        runtime_session_id: runtime_session_id.clone(),
                    })
                    .await;
                }
                Some(payload) => {
                    self.append_and_maybe_push(payload).await;
                }
                None => {
                    // Stream ended without completion or error: treated
                    // as `failed` rather than left ambiguous.
                    self.set_status(SessionStatus::Failed);
                    self.append_and_maybe_push(StreamEventPayload::Status {
                        text: SessionStatus::Failed,
                    })
                    .await;
                    return Err(SessionError::StreamEndedWithoutCompletion.into());
                }
            }
        }
        Ok(())
    }

    /// Cancels the current turn. Cooperative: signals the executor; the
    /// caller is responsible for waiting a grace period for the event
    /// stream to drain before synthesizing `status=failed`.
    pub async fn abort(&self) -> crate::error::Result<()> {
        self.executor.abort().await?;
        Ok(())
    }

    pub fn events_since(&self, index: u64) -> RangeRead {
        self.buffer.range_since(index)
    }

    /// Registers a pending caller-tool request and returns its receiver.
    /// Bounded per session; exceeding the cap is `ResourceExhausted`.
    pub async fn pending_caller_request(
        &self,
        request_id: String,
    ) -> crate::error::Result<oneshot::Receiver<serde_json::Value>> {
        let mut pending = self.pending.write().await;
        if pending.len() >= self.max_pending {
            return Err(crate::relay::RelayError::PendingSetFull.into());
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(request_id, tx);
        Ok(rx)
    }

    /// Resolves a pending request by id. Unknown ids are dropped; the
    /// caller logs this at its own layer.
    pub async fn resolve_caller_request(
        &self,
        request_id: &str,
        result: serde_json::Value,
    ) -> bool {
        if let Some(tx) = self.pending.write().await.remove(request_id) {
            tx.send(result).is_ok()
        } else {
            false
        }
    }

    pub async fn cancel_caller_request(&self, request_id: &str) {
        self.pending.write().await.remove(request_id);
    }

    /// Sends a `caller_tool` notification directly to the push sink,
    /// bypassing the event buffer - this is a request to the caller, not a
    /// replayable session event. Returns `false` if no sink is attached or
    /// delivery failed (the sink is disabled on failure as elsewhere).
    pub async fn notify_caller_tool(
        &self,
        request_id: &str,
        tool_name: &str,
        params: serde_json::Value,
    ) -> bool {
        let mut sink_slot = self.push_sink.write().await;
        let Some(sink) = sink_slot.as_ref() else {
            return false;
        };
        let notification = serde_json::json!({
            "type": "caller_tool",
            "session_id": self.session_id,
            "request_id": request_id,
            "tool_name": tool_name,
            "params": params,
        });
        if sink.push(notification).is_err() {
            *sink_slot = None;
            return false;
        }
        true
    }
}

pub const DEFAULT_CALLER_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_session_id_uuid() {
        assert!(validate_session_id(&Uuid::new_v4().to_string()));
    }

    #[test]
    fn test_validate_session_id_gogol_form() {
        assert!(validate_session_id("gogol_20260727_143000_a1b2c3"));
        assert!(!validate_session_id("gogol_2026072_143000_a1b2c3"));
        assert!(!validate_session_id("gogol_20260727_143000_"));
    }

    #[test]
    fn test_validate_session_id_child_form() {
        assert!(validate_session_id("child_s0_1"));
        assert!(!validate_session_id("child_"));
    }

    #[test]
    fn test_validate_session_id_rejects_garbage() {
        assert!(!validate_session_id("not-an-id"));
        assert!(!validate_session_id(""));
    }

    #[test]
    fn test_session_is_prime() {
        let s = Session::new_prime(
            Uuid::new_v4().to_string(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "claude",
            "admin",
        );
        assert!(s.is_prime());
        assert_eq!(s.depth, 0);
    }

    #[test]
    fn test_record_usage_non_decreasing() {
        let mut s = Session::new_prime(
            Uuid::new_v4().to_string(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "claude",
            "admin",
        );
        s.record_usage(100, 50, 0.05);
        s.record_usage(10, 5, 0.01);
        assert_eq!(s.input_tokens, 110);
        assert_eq!(s.output_tokens, 55);
        assert_eq!(s.turns, 2);
        assert!((s.cost_usd - 0.06).abs() < 1e-9);
    }

    #[test]
    fn test_fail_with_sets_last_error() {
        let mut s = Session::new_prime(
            Uuid::new_v4().to_string(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "claude",
            "admin",
        );
        s.fail_with("agent crashed");
        assert_eq!(s.status, SessionStatus::Failed);
        assert_eq!(s.last_error.as_deref(), Some("agent crashed"));
        s.transition(SessionStatus::Active);
        assert!(s.last_error.is_none());
    }

    struct NullExecutor;

    #[async_trait]
    impl StreamingExecutor for NullExecutor {
        async fn start(&self, _ctx: crate::executor::SessionContext) -> crate::error::Result<()> {
            Ok(())
        }
        async fn send_message_async(&self, _turn: TurnRequest) -> crate::error::Result<()> {
            Ok(())
        }
        async fn next_event(&self) -> Option<StreamEventPayload> {
            None
        }
        async fn abort(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn close(&self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pending_caller_request_round_trip() {
        let active = ActiveSession::new("s1".into(), Arc::new(NullExecutor));
        let rx = active.pending_caller_request("req1".into()).await.unwrap();
        let resolved = active
            .resolve_caller_request("req1", serde_json::json!({"pong": true}))
            .await;
        assert!(resolved);
        let value = rx.await.unwrap();
        assert_eq!(value, serde_json::json!({"pong": true}));
    }

    #[tokio::test]
    async fn test_resolve_unknown_request_returns_false() {
        let active = ActiveSession::new("s1".into(), Arc::new(NullExecutor));
        let resolved = active
            .resolve_caller_request("missing", serde_json::json!(null))
            .await;
        assert!(!resolved);
    }

    #[tokio::test]
    async fn test_pump_without_completion_marks_failed() {
        let active = ActiveSession::new("s1".into(), Arc::new(NullExecutor));
        let result = active.pump_until_terminal().await;
        assert!(result.is_err());
        assert_eq!(active.status(), SessionStatus::Failed);
    }

    struct ScriptedExecutor {
        events: SyncMutex<Vec<StreamEventPayload>>,
    }

    impl ScriptedExecutor {
        fn new(events: Vec<StreamEventPayload>) -> Self {
            let mut events = events;
            events.reverse();
            Self {
                events: SyncMutex::new(events),
            }
        }
    }

    #[async_trait]
    impl StreamingExecutor for ScriptedExecutor {
        async fn start(&self, _ctx: crate::executor::SessionContext) -> crate::error::Result<()> {
            Ok(())
        }
        async fn send_message_async(&self, _turn: TurnRequest) -> crate::error::Result<()> {
            Ok(())
        }
        async fn next_event(&self) -> Option<StreamEventPayload> {
            self.events.lock().pop()
        }
        async fn abort(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn close(&self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pump_captures_runtime_session_id_and_usage() {
        let executor = ScriptedExecutor::new(vec![
            StreamEventPayload::System {
                runtime_session_id: "rt-123".to_string(),
            },
            StreamEventPayload::Completion {
                text: "done".to_string(),
                turn_count: 1,
                duration_ms: 10,
                input_tokens: 100,
                output_tokens: 40,
                cost_usd: 0.02,
            },
        ]);
        let active = ActiveSession::new("s1".into(), Arc::new(executor));
        active.pump_until_terminal().await.unwrap();

        assert_eq!(active.runtime_session_id().as_deref(), Some("rt-123"));
        assert_eq!(active.status(), SessionStatus::Idle);
        let usage = active.take_last_usage().unwrap();
        assert_eq!(usage, (100, 40, 0.02));
        // Taken once; a second read finds nothing left to double-record.
        assert!(active.take_last_usage().is_none());
    }
}
