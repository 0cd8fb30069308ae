//! `StreamingExecutor` implementation backed by a per-project
//! [`crate::socket::SocketRelay`].
//!
//! A relay is opened once per project, when `oubliette-cli` accepts the
//! in-container agent wrapper's connection on that project's relay socket,
//! and lives for as long as the container does. Sessions come and go far
//! more often than that, so this executor looks its relay up by project id
//! at `start` time through a small shared [`RelayRegistry`] rather than
//! owning one outright - the same indirection `ContainerLifecycle` uses for
//! its per-project container map.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{Normalizer, StreamEventPayload};
use crate::executor::{SessionContext, StreamingExecutor, TurnRequest};
use crate::manager::ExecutorFactory;
use crate::socket::SocketRelay;

/// One entry per project with a live relay connection: the relay itself,
/// plus the shared receiver for its `agent_event` notifications. The
/// receiver is behind a mutex rather than handed out once, since a
/// project's relay outlives any one session bound to it.
struct RelayEntry {
    relay: Arc<SocketRelay>,
    events: Arc<AsyncMutex<mpsc::UnboundedReceiver<Value>>>,
}

/// Maps project id to its currently-connected relay. Populated by whatever
/// accepts the project's relay socket connection (`oubliette-cli`'s daemon
/// loop); consulted by [`RelayExecutor::start`].
#[derive(Default)]
pub struct RelayRegistry {
    entries: RwLock<HashMap<Uuid, RelayEntry>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly connected relay, taking ownership of its event
    /// channel. Replaces any prior entry for the project (a reconnect after
    /// container restart supersedes the old socket).
    pub async fn register(&self, relay: Arc<SocketRelay>) -> Result<()> {
        let events = relay
            .take_events()
            .await
            .ok_or_else(|| Error::Internal("relay events already taken".to_string()))?;
        let entry = RelayEntry {
            relay,
            events: Arc::new(AsyncMutex::new(events)),
        };
        self.entries.write().await.insert(entry.relay.project_id(), entry);
        Ok(())
    }

    pub async fn unregister(&self, project_id: Uuid) {
        self.entries.write().await.remove(&project_id);
    }

    async fn get(&self, project_id: Uuid) -> Option<(Arc<SocketRelay>, Arc<AsyncMutex<mpsc::UnboundedReceiver<Value>>>)> {
        self.entries
            .read()
            .await
            .get(&project_id)
            .map(|e| (e.relay.clone(), e.events.clone()))
    }
}

/// Obtains a [`RelayExecutor`] bound to whatever relay is registered for a
/// session's project at `start` time.
pub struct RelayExecutorFactory {
    registry: Arc<RelayRegistry>,
}

impl RelayExecutorFactory {
    pub fn new(registry: Arc<RelayRegistry>) -> Self {
        Self { registry }
    }
}

impl ExecutorFactory for RelayExecutorFactory {
    fn create(&self) -> Arc<dyn StreamingExecutor> {
        Arc::new(RelayExecutor {
            registry: self.registry.clone(),
            bound: AsyncMutex::new(None),
            normalizer: AsyncMutex::new(Normalizer::new()),
        })
    }
}

struct Bound {
    relay: Arc<SocketRelay>,
    events: Arc<AsyncMutex<mpsc::UnboundedReceiver<Value>>>,
}

/// Protocol adapter that speaks to one agent instance over its project's
/// `SocketRelay`. `send_message_async` fires a `send_message` notification;
/// `next_event` drains the relay's `agent_event` channel through a
/// `Normalizer`, looping past events the normalizer drops (a deduplicated
/// `message`) rather than surfacing them as end-of-stream.
pub struct RelayExecutor {
    registry: Arc<RelayRegistry>,
    bound: AsyncMutex<Option<Bound>>,
    normalizer: AsyncMutex<Normalizer>,
}

#[async_trait]
impl StreamingExecutor for RelayExecutor {
    async fn start(&self, ctx: SessionContext) -> Result<()> {
        let (relay, events) = self.registry.get(ctx.project_id).await.ok_or_else(|| {
            Error::Unavailable(format!(
                "no relay connected for project {}",
                ctx.project_id
            ))
        })?;
        *self.bound.lock().await = Some(Bound { relay, events });
        Ok(())
    }

    async fn send_message_async(&self, turn: TurnRequest) -> Result<()> {
        let bound = self.bound.lock().await;
        let bound = bound
            .as_ref()
            .ok_or_else(|| Error::Internal("executor used before start".to_string()))?;
        let caller_tools: Vec<Value> = turn
            .caller_tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        bound
            .relay
            .notify(
                "send_message",
                serde_json::json!({
                    "prompt": turn.prompt,
                    "variant": turn.variant,
                    "attachments": turn.attachments,
                    "caller_tools": caller_tools,
                }),
            )
            .await
    }

    async fn next_event(&self) -> Option<StreamEventPayload> {
        let bound = self.bound.lock().await;
        let bound = bound.as_ref()?;
        let events = bound.events.clone();
        drop(bound);

        loop {
            let raw = {
                let mut rx = events.lock().await;
                rx.recv().await?
            };
            let mut normalizer = self.normalizer.lock().await;
            match normalize_frame(&mut normalizer, raw) {
                Some(payload) => return Some(payload),
                None => continue,
            }
        }
    }

    async fn abort(&self) -> Result<()> {
        let bound = self.bound.lock().await;
        let Some(bound) = bound.as_ref() else {
            return Ok(());
        };
        bound.relay.notify("abort", Value::Null).await
    }

    async fn close(&self) -> Result<()> {
        *self.bound.lock().await = None;
        Ok(())
    }
}

/// Translates one raw `agent_event` payload into a normalized event,
/// returning `None` both for a deduplicated message and for a frame type
/// this executor doesn't recognize (logged, not fatal - an unrecognized
/// frame shouldn't end the stream).
fn normalize_frame(normalizer: &mut Normalizer, raw: Value) -> Option<StreamEventPayload> {
    let frame_type = raw.get("type").and_then(Value::as_str)?;
    match frame_type {
        "system" => {
            let runtime_session_id = raw.get("runtime_session_id")?.as_str()?.to_string();
            Some(StreamEventPayload::System { runtime_session_id })
        }
        "message" => {
            let text = raw.get("text")?.as_str()?.to_string();
            normalizer.normalize_message(text)
        }
        "delta" => {
            let text = raw.get("text")?.as_str()?.to_string();
            Some(StreamEventPayload::Delta { text })
        }
        "tool_call" => Some(StreamEventPayload::ToolCall {
            tool_id: raw.get("tool_id")?.as_str()?.to_string(),
            tool_name: raw.get("tool_name")?.as_str()?.to_string(),
            params: raw.get("params").cloned().unwrap_or(Value::Null),
        }),
        "tool_result" => Some(StreamEventPayload::ToolResult {
            tool_id: raw.get("tool_id")?.as_str()?.to_string(),
            value: raw.get("value").cloned().unwrap_or(Value::Null),
            is_error: raw.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        }),
        "completion" => {
            let text = raw.get("text")?.as_str()?.to_string();
            let turn_count = raw.get("turn_count").and_then(Value::as_u64).unwrap_or(0) as u32;
            let duration_ms = raw.get("duration_ms").and_then(Value::as_u64).unwrap_or(0);
            let input_tokens = raw.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
            let output_tokens = raw.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
            let cost_usd = raw.get("cost_usd").and_then(Value::as_f64).unwrap_or(0.0);
            Some(normalizer.normalize_completion(
                text,
                turn_count,
                duration_ms,
                input_tokens,
                output_tokens,
                cost_usd,
            ))
        }
        "error" => Some(StreamEventPayload::Error {
            message: raw
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown agent error")
                .to_string(),
        }),
        other => {
            warn!(frame_type = other, "dropping unrecognized agent_event frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SocketRequestHandler;
    use tokio::io::AsyncWriteExt;

    struct EchoHandler;

    #[async_trait]
    impl SocketRequestHandler for EchoHandler {
        async fn handle(&self, method: &str, params: Value) -> std::result::Result<Value, Value> {
            Ok(serde_json::json!({ "echo": method, "params": params }))
        }
    }

    fn ctx(project_id: Uuid) -> SessionContext {
        SessionContext {
            session_id: Uuid::new_v4(),
            project_id,
            workspace_id: Uuid::new_v4(),
            runtime_session_id: None,
        }
    }

    #[tokio::test]
    async fn start_fails_when_no_relay_registered_for_project() {
        let registry = Arc::new(RelayRegistry::new());
        let factory = RelayExecutorFactory::new(registry);
        let executor = factory.create();
        let err = executor.start(ctx(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn drains_normalized_events_and_dedupes_trailing_message() {
        let project_id = Uuid::new_v4();
        let (host_side, mut client_side) = tokio::io::duplex(8192);
        let (relay, _task) = SocketRelay::spawn(project_id, host_side, Arc::new(EchoHandler));
        let registry = Arc::new(RelayRegistry::new());
        registry.register(Arc::new(relay)).await.unwrap();

        let factory = RelayExecutorFactory::new(registry);
        let executor = factory.create();
        executor.start(ctx(project_id)).await.unwrap();

        client_side
            .write_all(b"{\"method\":\"agent_event\",\"params\":{\"type\":\"completion\",\"text\":\"done\",\"turn_count\":1,\"duration_ms\":5}}\n")
            .await
            .unwrap();
        client_side
            .write_all(b"{\"method\":\"agent_event\",\"params\":{\"type\":\"message\",\"text\":\"done\"}}\n")
            .await
            .unwrap();
        client_side
            .write_all(b"{\"method\":\"agent_event\",\"params\":{\"type\":\"message\",\"text\":\"fresh\"}}\n")
            .await
            .unwrap();

        let first = executor.next_event().await.unwrap();
        assert!(matches!(first, StreamEventPayload::Completion { ref text, .. } if text == "done"));

        // The duplicate "done" message is swallowed by the normalizer, so
        // the next event pulled is the non-duplicate one.
        let second = executor.next_event().await.unwrap();
        assert!(matches!(second, StreamEventPayload::Message { ref text } if text == "fresh"));
    }

    #[tokio::test]
    async fn send_message_async_writes_a_notification_frame() {
        let project_id = Uuid::new_v4();
        let (host_side, client_side) = tokio::io::duplex(8192);
        let (relay, _task) = SocketRelay::spawn(project_id, host_side, Arc::new(EchoHandler));
        let registry = Arc::new(RelayRegistry::new());
        registry.register(Arc::new(relay)).await.unwrap();

        let factory = RelayExecutorFactory::new(registry);
        let executor = factory.create();
        executor.start(ctx(project_id)).await.unwrap();
        executor
            .send_message_async(TurnRequest::new("hello"))
            .await
            .unwrap();

        let mut reader = tokio::io::BufReader::new(client_side);
        use tokio::io::AsyncBufReadExt;
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let frame: crate::socket::Frame = serde_json::from_str(&line).unwrap();
        assert_eq!(frame.method.as_deref(), Some("send_message"));
        assert_eq!(frame.params.unwrap()["prompt"], "hello");
    }
}
