//! Length-or-line-framed JSON-RPC bridge between the in-container agent
//! wrapper and the host orchestrator.
//!
//! One relay is bound to exactly one project; it carries traffic for
//! whichever session is currently active on that project (see
//! `bind_session`/`unbind_session`). The read side runs as a background
//! task: it owns the read half and pushes into shared state guarded by a
//! `tokio::sync::Mutex`, rather than the caller polling the socket directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::relay::{CallerToolRelay, CallerToolSpec};
use crate::session::ActiveSession;

/// One line of the wire protocol. A request/notification carries `method`
/// (+ `params`, + `id` if it expects a reply); a response carries `id` and
/// exactly one of `result`/`error`. An `id` present with no `result` or
/// `error` populated anywhere in the stream yet is an unresolved request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Frame {
    fn is_response(&self) -> bool {
        self.method.is_none() && self.id.is_some()
    }

    fn is_request(&self) -> bool {
        self.method.is_some() && self.id.is_some()
    }
}

/// Host-side handling of the two authenticated, token-scoped methods.
/// Implemented by the MCP dispatcher, the only component with access to
/// the token store and per-project tool registry.
#[async_trait]
pub trait SocketRequestHandler: Send + Sync {
    /// `method` is `oubliette_tools` or `oubliette_call_tool`. `Err`
    /// carries a JSON-RPC error object sent back over the wire verbatim.
    async fn handle(&self, method: &str, params: Value) -> std::result::Result<Value, Value>;
}

struct Inner {
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send>>,
    pending: AsyncMutex<HashMap<u64, oneshot::Sender<std::result::Result<Value, Value>>>>,
    next_id: AtomicU64,
    active_session: RwLock<Option<Arc<ActiveSession>>>,
    handler: Arc<dyn SocketRequestHandler>,
    caller_relay: CallerToolRelay,
    event_tx: mpsc::UnboundedSender<Value>,
    event_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<Value>>>,
}

/// A single framed JSON-RPC socket bound to one project's in-container
/// agent wrapper.
pub struct SocketRelay {
    project_id: Uuid,
    inner: Arc<Inner>,
}

impl SocketRelay {
    /// Splits `stream`, spawns the read loop as a background task, and
    /// returns the relay handle alongside that task's `JoinHandle`. The
    /// caller aborts the handle when the project's container stops;
    /// dropping the relay alone does not stop the pump.
    pub fn spawn<S>(
        project_id: Uuid,
        stream: S,
        handler: Arc<dyn SocketRequestHandler>,
    ) -> (Self, JoinHandle<()>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            writer: AsyncMutex::new(Box::new(write_half)),
            pending: AsyncMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            active_session: RwLock::new(None),
            handler,
            caller_relay: CallerToolRelay::default(),
            event_tx,
            event_rx: AsyncMutex::new(Some(event_rx)),
        });

        let pump_inner = inner.clone();
        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Frame>(&line) {
                            Ok(frame) => handle_frame(&pump_inner, frame).await,
                            Err(e) => warn!(error = %e, "dropping unparseable relay frame"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "relay read error, closing");
                        break;
                    }
                }
            }
            // Requests that outlive the connection are canceled with a
            // clear error rather than left to hang forever.
            for (_, tx) in pump_inner.pending.lock().await.drain() {
                let _ = tx.send(Err(
                    serde_json::json!({"code": -32000, "message": "relay connection closed"}),
                ));
            }
        });

        (Self { project_id, inner }, task)
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    /// Binds the session currently owning this relay's traffic.
    pub async fn bind_session(&self, session: Arc<ActiveSession>) {
        *self.inner.active_session.write().await = Some(session);
    }

    pub async fn unbind_session(&self) {
        *self.inner.active_session.write().await = None;
    }

    /// Sends the `caller_tools_config` notification advertising tools the
    /// in-container agent should dynamically register as
    /// `{caller_id}_{tool_name}`.
    pub async fn notify_caller_tools_config(
        &self,
        caller_id: &str,
        tools: Vec<CallerToolSpec>,
    ) -> Result<()> {
        self.notify(
            "caller_tools_config",
            serde_json::json!({ "caller_id": caller_id, "tools": tools }),
        )
        .await
    }

    /// Sends a host-to-client notification (no reply expected).
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let frame = Frame {
            id: None,
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        };
        write_frame(&self.inner, &frame).await
    }

    /// Takes ownership of the channel carrying `agent_event` notifications
    /// sent by the client. Call once per relay, right after `spawn` -
    /// whichever `StreamingExecutor` binds to this relay owns the receiver
    /// for the relay's lifetime. Returns `None` if already taken.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<Value>> {
        self.inner.event_rx.lock().await.take()
    }

    /// Issues a host-to-client request (e.g. a tool invocation the client
    /// must run in-container) and awaits its response. Callers wrap this
    /// in a timeout; the relay itself does not impose one.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let frame = Frame {
            id: Some(id),
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        };
        if let Err(e) = write_frame(&self.inner, &frame).await {
            self.inner.pending.lock().await.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(Error::Unavailable(format!("client error: {error}"))),
            Err(_) => Err(Error::Internal(
                "relay response channel dropped".to_string(),
            )),
        }
    }
}

async fn write_frame(inner: &Arc<Inner>, frame: &Frame) -> Result<()> {
    let mut line =
        serde_json::to_string(frame).map_err(|e| Error::Internal(format!("relay encode: {e}")))?;
    line.push('\n');
    let mut writer = inner.writer.lock().await;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| Error::Unavailable(format!("relay write: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Unavailable(format!("relay flush: {e}")))
}

async fn handle_frame(inner: &Arc<Inner>, frame: Frame) {
    if frame.is_response() {
        let id = frame.id.expect("is_response implies id");
        if let Some(tx) = inner.pending.lock().await.remove(&id) {
            let outcome = match frame.error {
                Some(err) => Err(err),
                None => Ok(frame.result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(outcome);
        }
        return;
    }

    if frame.is_request() {
        let id = frame.id.expect("is_request implies id");
        let method = frame.method.clone().unwrap_or_default();
        let params = frame.params.clone().unwrap_or(Value::Null);
        let outcome = dispatch_request(inner, &method, params).await;
        let response = match outcome {
            Ok(result) => Frame {
                id: Some(id),
                method: None,
                params: None,
                result: Some(result),
                error: None,
            },
            Err(error) => Frame {
                id: Some(id),
                method: None,
                params: None,
                result: None,
                error: Some(error),
            },
        };
        if let Err(e) = write_frame(inner, &response).await {
            warn!(error = %e, "failed to write relay response");
        }
        return;
    }

    if let Some(method) = frame.method.clone() {
        // A notification (method, no id). `agent_event` is the only
        // client-to-host one today - the raw frame the in-container agent
        // wrapper emits for its own output stream, which a `StreamingExecutor`
        // drains via `take_events` and runs through the `Normalizer`.
        if method == "agent_event" {
            let params = frame.params.clone().unwrap_or(Value::Null);
            let _ = inner.event_tx.send(params);
            return;
        }
    }

    debug!(?frame, "dropping frame that is neither request nor response");
}

async fn dispatch_request(
    inner: &Arc<Inner>,
    method: &str,
    params: Value,
) -> std::result::Result<Value, Value> {
    match method {
        "caller_tool" => {
            let session = inner.active_session.read().await.clone();
            let Some(session) = session else {
                return Err(
                    serde_json::json!({"code": -32001, "message": "no session bound to this relay"}),
                );
            };
            let tool = params
                .get("tool")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
            inner
                .caller_relay
                .invoke(&session, &tool, arguments)
                .await
                .map_err(|e| serde_json::json!({"code": -32002, "message": e.to_string()}))
        }
        "oubliette_tools" | "oubliette_call_tool" => inner.handler.handle(method, params).await,
        other => Err(serde_json::json!({
            "code": -32601,
            "message": format!("unknown method: {other}"),
        })),
    }
}
