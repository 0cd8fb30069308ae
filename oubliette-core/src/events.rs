//! The normalized event stream produced by every session, and the
//! normalizer that translates protocol-specific agent frames into it.
//!
//! Every event carries an index (its position in the owning
//! [`crate::buffer::EventBuffer`]), an optional session id (set when an
//! event is forwarded from a child session), and an optional role and tool
//! name.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::session::SessionStatus;

/// One normalized event, addressable by its position in the buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub index: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(flatten)]
    pub payload: StreamEventPayload,
}

/// The event payload. Tagged by `type` on the wire so pull and push
/// consumers share one shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEventPayload {
    /// Session init; carries the agent-assigned runtime session id. The
    /// SessionManager persists this on the `Session` the first time it is
    /// observed.
    System { runtime_session_id: String },
    /// A lifecycle transition. Synthesized by the owning `ActiveSession`,
    /// never by the normalizer directly.
    Status { text: SessionStatus },
    /// Consolidated assistant text (not per-token).
    Message { text: String },
    /// A per-token text chunk. Buffered but never pushed.
    Delta { text: String },
    ToolCall {
        tool_id: String,
        tool_name: String,
        params: Value,
    },
    ToolResult {
        tool_id: String,
        value: Value,
        is_error: bool,
    },
    /// Final assistant text for the turn, plus turn accounting. Token
    /// counts and cost are the agent's own report for this turn, not a
    /// running total - the `SessionManager` accumulates them onto the
    /// `Session` and the owning tree's `RecursionGuard`.
    Completion {
        text: String,
        turn_count: u32,
        duration_ms: u64,
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
        #[serde(default)]
        cost_usd: f64,
    },
    Error { message: String },
}

impl StreamEventPayload {
    /// `delta` events are buffered for replay but never forwarded to a push
    /// sink; everything else is both buffered and pushed.
    pub fn is_pushable(&self) -> bool {
        !matches!(self, StreamEventPayload::Delta { .. })
    }

    pub fn as_message_text(&self) -> Option<&str> {
        match self {
            StreamEventPayload::Message { text } => Some(text),
            _ => None,
        }
    }
}

/// Converts protocol-specific agent frames into [`StreamEventPayload`]s,
/// de-duplicating consolidated assistant text against the last checkpoint.
///
/// One `Normalizer` is owned per `ActiveSession`; it is not shared across
/// threads, so no internal locking is needed.
#[derive(Debug, Default)]
pub struct Normalizer {
    last_assistant_text: Option<String>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `message` event with text identical to the last checkpoint (set by
    /// either a prior message or a completion) is dropped entirely -
    /// returns `None`.
    pub fn normalize_message(&mut self, text: String) -> Option<StreamEventPayload> {
        if self.last_assistant_text.as_deref() == Some(text.as_str()) {
            return None;
        }
        self.last_assistant_text = Some(text.clone());
        Some(StreamEventPayload::Message { text })
    }

    /// `completion` always emits; it also updates the checkpoint so a
    /// trailing `message` event carrying the same text is suppressed.
    pub fn normalize_completion(
        &mut self,
        text: String,
        turn_count: u32,
        duration_ms: u64,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    ) -> StreamEventPayload {
        self.last_assistant_text = Some(text.clone());
        StreamEventPayload::Completion {
            text,
            turn_count,
            duration_ms,
            input_tokens,
            output_tokens,
            cost_usd,
        }
    }

    pub fn reset_checkpoint(&mut self) {
        self.last_assistant_text = None;
    }

    pub fn last_assistant_text(&self) -> Option<&str> {
        self.last_assistant_text.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_message_dropped() {
        let mut n = Normalizer::new();
        assert!(n.normalize_message("hello".into()).is_some());
        assert!(n.normalize_message("hello".into()).is_none());
        assert!(n.normalize_message("world".into()).is_some());
    }

    #[test]
    fn test_completion_suppresses_following_duplicate_message() {
        let mut n = Normalizer::new();
        let completion = n.normalize_completion("done".into(), 1, 250, 0, 0, 0.0);
        assert!(matches!(completion, StreamEventPayload::Completion { .. }));
        assert!(n.normalize_message("done".into()).is_none());
        assert!(n.normalize_message("more".into()).is_some());
    }

    #[test]
    fn test_delta_never_pushable() {
        let delta = StreamEventPayload::Delta { text: "a".into() };
        assert!(!delta.is_pushable());
        let message = StreamEventPayload::Message { text: "a".into() };
        assert!(message.is_pushable());
    }

    #[test]
    fn test_reset_checkpoint_allows_repeat() {
        let mut n = Normalizer::new();
        n.normalize_message("hi".into());
        n.reset_checkpoint();
        assert!(n.normalize_message("hi".into()).is_some());
    }
}
