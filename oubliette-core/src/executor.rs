//! The protocol adapter to one running agent instance.
//!
//! A single implementation (socket-relay-backed, see [`crate::socket`])
//! is sufficient today; the capability set below is kept narrow so an
//! alternative agent protocol can slot in without disturbing
//! `SessionManager` or `ActiveSession`.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::events::StreamEventPayload;

/// Context handed to an executor when it starts backing a session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub project_id: Uuid,
    pub workspace_id: Uuid,
    /// Set when resuming; the agent-assigned id from a prior `system` event.
    pub runtime_session_id: Option<String>,
}

/// A caller-declared tool the in-container agent should be able to invoke
/// via the relay. See `CallerToolRelay`.
#[derive(Debug, Clone)]
pub struct CallerToolDecl {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
}

/// One `send_message` request.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub prompt: String,
    /// Model/reasoning/autonomy override key, passed per message rather
    /// than baked into startup.
    pub variant: Option<String>,
    pub attachments: Vec<String>,
    pub caller_tools: Vec<CallerToolDecl>,
}

impl TurnRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            variant: None,
            attachments: Vec::new(),
            caller_tools: Vec::new(),
        }
    }
}

/// Protocol glue for one agent instance: start it, submit turns, and drain
/// its normalized event stream.
///
/// `next_event` models the "lazy sequence, single-consumer" contract: each
/// call pulls the next payload; `None` signals the stream ended (at
/// completion, at failure, or because the agent closed its side).
/// Restarting requires a fresh handle obtained via `start` for the same
/// `runtime_session_id`.
#[async_trait]
pub trait StreamingExecutor: Send + Sync {
    /// Brings the agent process/subsession to readiness. May be a no-op if
    /// the agent uses a persistent endpoint already bound to a session id.
    async fn start(&self, ctx: SessionContext) -> Result<()>;

    /// Submits a turn; returns immediately, before any events are produced.
    async fn send_message_async(&self, turn: TurnRequest) -> Result<()>;

    /// Pulls the next normalized payload, or `None` at end of stream.
    async fn next_event(&self) -> Option<StreamEventPayload>;

    /// Requests the agent stop current work. Idempotent.
    async fn abort(&self) -> Result<()>;

    /// Releases resources. Safe on an already-closed handle.
    async fn close(&self) -> Result<()>;
}
