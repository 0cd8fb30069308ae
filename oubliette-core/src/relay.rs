//! Bridges tool calls the in-container agent issues back to the caller
//! that owns the session - the inverse direction from the MCP dispatcher's
//! tool registry, which lets the caller invoke tools *inside* the container.
//!
//! One relay is shared across all sessions; each call operates against a
//! single `ActiveSession` keyed by its own request id. The relay keeps one
//! piece of shared state - the request id to owning session id map - so a
//! response can be resolved against the session that actually issued the
//! request rather than whatever session id the response claims.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::session::{ActiveSession, DEFAULT_CALLER_TOOL_TIMEOUT};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RelayError {
    #[error("caller tool call timed out: {0}")]
    Timeout(String),
    #[error("caller tool response targeted session {actual} but request belongs to {expected}")]
    SessionMismatch { expected: String, actual: String },
    #[error("unknown caller tool request: {0}")]
    Unknown(String),
    #[error("pending caller tool request set is full")]
    PendingSetFull,
    #[error("caller tool relay io error: {0}")]
    Io(String),
}

/// Declares one tool the in-container agent may invoke via the relay, as
/// advertised to the caller through a `caller_tools_config` notification.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CallerToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
}

/// Bridge: allocates request ids, registers a response channel on the
/// target session, notifies the push sink, and waits with a timeout. Also
/// tracks which session actually owns each outstanding request id,
/// independent of whatever session id a response claims to target - this
/// is what makes a mismatched response (one resolved against the wrong
/// session) something `resolve` can actually detect rather than a check
/// the caller of `resolve` always satisfies by construction.
#[derive(Debug, Default)]
pub struct CallerToolRelay {
    timeout_override: Option<Duration>,
    owners: RwLock<HashMap<String, String>>,
}

impl CallerToolRelay {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout_override: Some(timeout),
            owners: RwLock::new(HashMap::new()),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout_override.unwrap_or(DEFAULT_CALLER_TOOL_TIMEOUT)
    }

    /// The session id a pending request id was actually registered
    /// against, if it's still outstanding. Callers resolving a response
    /// should look the owning session up through this rather than trusting
    /// a caller-supplied session id, so a cross-session mismatch is
    /// resolved against the *real* session and can be flagged by
    /// [`Self::resolve`].
    pub async fn owner_of(&self, request_id: &str) -> Option<String> {
        self.owners.read().await.get(request_id).cloned()
    }

    /// Invokes `tool_name` on behalf of the agent running in `session`,
    /// blocking until the caller resolves it or the timeout elapses. On
    /// timeout the pending entry is cancelled so a late response is
    /// dropped rather than delivered to the wrong waiter.
    pub async fn invoke(
        &self,
        session: &ActiveSession,
        tool_name: &str,
        params: Value,
    ) -> Result<Value, RelayError> {
        let request_id = Uuid::new_v4().to_string();

        let rx = session
            .pending_caller_request(request_id.clone())
            .await
            .map_err(|_| RelayError::PendingSetFull)?;
        self.owners
            .write()
            .await
            .insert(request_id.clone(), session.session_id.clone());

        if !session.notify_caller_tool(&request_id, tool_name, params).await {
            session.cancel_caller_request(&request_id).await;
            self.owners.write().await.remove(&request_id);
            return Err(RelayError::Io(
                "no push sink attached to session".to_string(),
            ));
        }

        let result = match tokio::time::timeout(self.timeout(), rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(RelayError::Unknown(request_id.clone())),
            Err(_) => {
                session.cancel_caller_request(&request_id).await;
                Err(RelayError::Timeout(request_id.clone()))
            }
        };
        self.owners.write().await.remove(&request_id);
        result
    }

    /// Resolves a caller tool response. `session` must be the session
    /// [`Self::owner_of`] named for `request_id`, not merely whatever
    /// session the caller claims in `expected_session_id` - verifying the
    /// claim matches the real owner before delivering the value is what
    /// catches a client resolving a request that doesn't belong to the
    /// connection it arrived on, treated as a permission violation rather
    /// than silently routed.
    pub async fn resolve(
        &self,
        session: &ActiveSession,
        expected_session_id: &str,
        request_id: &str,
        result: Value,
    ) -> Result<(), RelayError> {
        if session.session_id != expected_session_id {
            return Err(RelayError::SessionMismatch {
                expected: expected_session_id.to_string(),
                actual: session.session_id.clone(),
            });
        }
        let resolved = session.resolve_caller_request(request_id, result).await;
        self.owners.write().await.remove(request_id);
        if resolved {
            Ok(())
        } else {
            Err(RelayError::Unknown(request_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::events::StreamEventPayload;
    use crate::executor::{SessionContext, StreamingExecutor, TurnRequest};
    use crate::session::PushSink;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    struct NullExecutor;

    #[async_trait]
    impl StreamingExecutor for NullExecutor {
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

    struct CapturingSink {
        captured: Mutex<Vec<Value>>,
    }

    impl PushSink for CapturingSink {
        fn push(&self, event_json: Value) -> std::result::Result<(), ()> {
            self.captured.lock().unwrap().push(event_json);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_invoke_and_resolve_round_trip() {
        let session = ActiveSession::new("s1".into(), Arc::new(NullExecutor));
        let sink = Arc::new(CapturingSink {
            captured: Mutex::new(Vec::new()),
        });
        session.register_push_sink(sink.clone()).await;

        let relay = CallerToolRelay::new(Duration::from_millis(200));
        let invoke = relay.invoke(&session, "read_file", serde_json::json!({"path": "a.txt"}));

        // Pull the request id the relay just pushed and resolve it as the
        // caller would after receiving the notification.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let notification = sink.captured.lock().unwrap().last().cloned().unwrap();
        let request_id = notification["request_id"].as_str().unwrap().to_string();

        let resolve = relay.resolve(
            &session,
            "s1",
            &request_id,
            serde_json::json!({"contents": "hi"}),
        );

        let (invoke_result, resolve_result) = tokio::join!(invoke, resolve);
        assert!(resolve_result.is_ok());
        assert_eq!(invoke_result.unwrap(), serde_json::json!({"contents": "hi"}));
    }

    #[tokio::test]
    async fn test_owner_of_reflects_invoking_session_not_caller_claim() {
        let owning_session = ActiveSession::new("s1".into(), Arc::new(NullExecutor));
        let sink = Arc::new(CapturingSink {
            captured: Mutex::new(Vec::new()),
        });
        owning_session.register_push_sink(sink.clone()).await;

        let relay = CallerToolRelay::new(Duration::from_millis(200));
        let invoke = relay.invoke(&owning_session, "read_file", serde_json::json!({}));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let notification = sink.captured.lock().unwrap().last().cloned().unwrap();
        let request_id = notification["request_id"].as_str().unwrap().to_string();

        // The registry names the session that actually invoked, independent
        // of whatever a later response claims to target.
        assert_eq!(relay.owner_of(&request_id).await.as_deref(), Some("s1"));

        // A dispatcher resolving this request would look `active` up via
        // `owner_of` (always "s1"), then pass along whatever session id the
        // response claims. A response claiming "s2" is now genuinely
        // reachable as a mismatch, since the looked-up session and the
        // claim can differ.
        let err = relay
            .resolve(&owning_session, "s2", &request_id, serde_json::json!(null))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RelayError::SessionMismatch {
                expected: "s2".to_string(),
                actual: "s1".to_string(),
            }
        );

        drop(invoke);
    }

    #[tokio::test]
    async fn test_invoke_times_out_without_sink() {
        let session = ActiveSession::new("s1".into(), Arc::new(NullExecutor));
        let relay = CallerToolRelay::new(Duration::from_millis(50));
        let err = relay
            .invoke(&session, "read_file", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Io(_)));
    }

    #[tokio::test]
    async fn test_resolve_session_mismatch_rejected() {
        let session = ActiveSession::new("s1".into(), Arc::new(NullExecutor));
        let relay = CallerToolRelay::default();
        let err = relay
            .resolve(&session, "some-other-session", "req", serde_json::json!(null))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RelayError::SessionMismatch {
                expected: "some-other-session".to_string(),
                actual: "s1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_resolve_unknown_request_id() {
        let session = ActiveSession::new("s1".into(), Arc::new(NullExecutor));
        let relay = CallerToolRelay::default();
        let err = relay
            .resolve(&session, "s1", "nonexistent", serde_json::json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Unknown(_)));
    }
}
