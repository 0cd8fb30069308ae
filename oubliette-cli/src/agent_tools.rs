//! Handles the two authenticated methods an in-container agent wrapper
//! sends back over its project's relay socket: `oubliette_tools` and
//! `oubliette_call_tool`.
//!
//! A relay carries exactly one project's traffic, so the wrapper's
//! `OUBLIETTE_API_KEY` need not travel over the wire at all - the relay
//! listener already knows which project dialed in, and that project is
//! the whole of the agent's authority. Calls are authorized as
//! `Scope::Project(project_id)`, the same scope a project-scoped bearer
//! token would carry, against a fixed, small catalog rather than the
//! dispatcher's full operator surface.

use std::sync::Arc;

use oubliette_core::container::ContainerRuntime;
use oubliette_core::{AuthContext, Scope};
use oubliette_mcp::ops::{SessionListRequest, SessionMessageRequest, SessionSpawnRequest};
use oubliette_mcp::Dispatcher;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

/// One entry in the catalog returned by `oubliette_tools`.
#[derive(Debug, Clone, Serialize)]
struct ToolDescriptor {
    name: &'static str,
    description: &'static str,
}

const CATALOG: &[ToolDescriptor] = &[
    ToolDescriptor {
        name: "session_spawn",
        description: "Spawn a recursive child session under the current prompt's session.",
    },
    ToolDescriptor {
        name: "session_message",
        description: "Send a follow-up message to an existing session.",
    },
    ToolDescriptor {
        name: "session_list",
        description: "List sessions belonging to this project.",
    },
    ToolDescriptor {
        name: "workspace_list",
        description: "List the workspaces mounted into this project.",
    },
];

pub struct AgentToolHandler<R: ContainerRuntime> {
    dispatcher: Arc<Dispatcher<R>>,
    project_id: Uuid,
}

impl<R: ContainerRuntime> AgentToolHandler<R> {
    pub fn new(dispatcher: Arc<Dispatcher<R>>, project_id: Uuid) -> Self {
        Self { dispatcher, project_id }
    }

    fn auth(&self) -> AuthContext {
        AuthContext {
            token_id: self.project_id,
            scope: Scope::Project(self.project_id),
        }
    }

    async fn tools(&self) -> Value {
        json!({ "tools": CATALOG })
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, Value> {
        let auth = self.auth();
        match tool {
            "session_spawn" => {
                let mut req: SessionSpawnRequest =
                    serde_json::from_value(arguments).map_err(invalid_params)?;
                req.project_id = self.project_id;
                let resp = self
                    .dispatcher
                    .session_spawn(&auth, req)
                    .await
                    .map_err(|e| e.to_wire())?;
                serde_json::to_value(resp).map_err(internal_err)
            }
            "session_message" => {
                let req: SessionMessageRequest =
                    serde_json::from_value(arguments).map_err(invalid_params)?;
                let resp = self
                    .dispatcher
                    .session_message(&auth, req)
                    .await
                    .map_err(|e| e.to_wire())?;
                serde_json::to_value(resp).map_err(internal_err)
            }
            "session_list" => {
                let mut req: SessionListRequest =
                    serde_json::from_value(arguments).map_err(invalid_params)?;
                req.project_id = Some(self.project_id);
                let resp = self
                    .dispatcher
                    .session_list(&auth, req)
                    .await
                    .map_err(|e| e.to_wire())?;
                serde_json::to_value(resp).map_err(internal_err)
            }
            "workspace_list" => {
                let resp = self
                    .dispatcher
                    .workspace_list(&auth, self.project_id)
                    .await
                    .map_err(|e| e.to_wire())?;
                serde_json::to_value(resp).map_err(internal_err)
            }
            other => Err(json!({
                "code": -32601,
                "message": format!("unknown tool '{other}'"),
            })),
        }
    }
}

fn invalid_params(e: serde_json::Error) -> Value {
    json!({ "code": -32602, "message": format!("invalid params: {e}") })
}

fn internal_err(e: serde_json::Error) -> Value {
    json!({ "code": -32603, "message": format!("failed to encode result: {e}") })
}

#[async_trait::async_trait]
impl<R: ContainerRuntime + 'static> oubliette_core::SocketRequestHandler for AgentToolHandler<R> {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, Value> {
        match method {
            "oubliette_tools" => Ok(self.tools().await),
            "oubliette_call_tool" => {
                let tool = params
                    .get("tool")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| json!({"code": -32602, "message": "missing 'tool'"}))?
                    .to_string();
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                self.call_tool(&tool, arguments).await
            }
            other => Err(json!({
                "code": -32601,
                "message": format!("unknown method '{other}'"),
            })),
        }
    }
}
