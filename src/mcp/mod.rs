// SPDX-License-Identifier: MIT
//
// Protocol-adapter tool server. Exposes the mailbox as structured tools over
// a streamed request/response transport: the client opens an SSE stream,
// learns a per-connection POST endpoint, and pushes JSON-RPC frames there;
// responses stream back over the open connection.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use tracing::debug;
use uuid::Uuid;

use crate::audit::actions;
use crate::mailbox::model::Priority;
use crate::mailbox::SendRequest;
use crate::rest::routes::messages::perform_send;
use crate::AppContext;

/// Open tool-server connections: connection id → response channel.
pub struct McpState {
    sessions: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl McpState {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

impl Default for McpState {
    fn default() -> Self {
        Self::new()
    }
}

// ─── SSE side ─────────────────────────────────────────────────────────────────

/// GET /mcp/sse — open a stream. The first event advertises the POST
/// endpoint parameterized with this connection's id.
pub async fn sse_handler(
    State(ctx): State<Arc<AppContext>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let connection_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    ctx.mcp.sessions.lock().await.insert(connection_id.clone(), tx);
    debug!(connection = %connection_id, "tool server connection opened");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/mcp/messages?session={connection_id}"));
    let responses =
        UnboundedReceiverStream::new(rx).map(|frame| Event::default().event("message").data(frame));

    let stream = tokio_stream::once(endpoint)
        .chain(responses)
        .map(Ok::<Event, Infallible>);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ─── JSON-RPC side ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SessionParam {
    pub session: String,
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

/// POST /mcp/messages?session=<id> — push one JSON-RPC frame. The response
/// goes back over the SSE stream; the POST itself just acknowledges.
pub async fn messages_handler(
    State(ctx): State<Arc<AppContext>>,
    Query(param): Query<SessionParam>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let tx = {
        let sessions = ctx.mcp.sessions.lock().await;
        sessions.get(&param.session).cloned()
    };
    let Some(tx) = tx else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown session"})),
        );
    };

    let req: RpcRequest = match serde_json::from_value(body) {
        Ok(req) => req,
        Err(e) => {
            let _ = tx.send(
                json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": {"code": -32700, "message": format!("parse error: {e}")},
                })
                .to_string(),
            );
            return (StatusCode::ACCEPTED, Json(json!({"ok": true})));
        }
    };

    // Notifications carry no id and get no response.
    let Some(id) = req.id.clone() else {
        return (StatusCode::ACCEPTED, Json(json!({"ok": true})));
    };

    let response = match dispatch(&ctx, &req.method, req.params.unwrap_or(Value::Null)).await {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(e) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32000, "message": e.to_string()},
        }),
    };
    let dropped = tx.send(response.to_string()).is_err();
    if dropped {
        ctx.mcp.sessions.lock().await.remove(&param.session);
    }
    (StatusCode::ACCEPTED, Json(json!({"ok": true})))
}

async fn dispatch(ctx: &Arc<AppContext>, method: &str, params: Value) -> Result<Value> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": {"name": "quackd", "version": env!("CARGO_PKG_VERSION")},
            "capabilities": {"tools": {}},
        })),
        "tools/list" => Ok(json!({"tools": tool_schemas()})),
        "tools/call" => {
            let name = params["name"].as_str().unwrap_or_default().to_string();
            let args = params["arguments"].clone();
            let result = call_tool(ctx, &name, args).await;
            Ok(match result {
                Ok(value) => json!({
                    "content": [{"type": "text", "text": value.to_string()}],
                }),
                Err(e) => json!({
                    "content": [{"type": "text", "text": e.to_string()}],
                    "isError": true,
                }),
            })
        }
        other => Err(anyhow::anyhow!("unknown method '{other}'")),
    }
}

// ─── Tools ────────────────────────────────────────────────────────────────────

fn tool_schemas() -> Vec<Value> {
    vec![
        json!({
            "name": "send",
            "description": "Send a message to an agent inbox",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "to": {"type": "string", "description": "Destination inbox path"},
                    "from": {"type": "string", "description": "Sender identifier"},
                    "task": {"type": "string"},
                    "context": {"type": "string"},
                    "project": {"type": "string"},
                    "priority": {"type": "string", "enum": ["low", "normal", "high", "urgent"]},
                    "replyTo": {"type": "string"}
                },
                "required": ["to", "from", "task"]
            }
        }),
        json!({
            "name": "check",
            "description": "Check an inbox for actionable messages",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "inbox": {"type": "string"},
                    "includeRead": {"type": "boolean"},
                    "autoApprove": {"type": "boolean"}
                },
                "required": ["inbox"]
            }
        }),
        json!({
            "name": "receive",
            "description": "Mark a message as read",
            "inputSchema": {
                "type": "object",
                "properties": {"messageId": {"type": "string"}},
                "required": ["messageId"]
            }
        }),
        json!({
            "name": "complete",
            "description": "Mark a message as completed",
            "inputSchema": {
                "type": "object",
                "properties": {"messageId": {"type": "string"}},
                "required": ["messageId"]
            }
        }),
        json!({
            "name": "reply",
            "description": "Reply to a message; threads and completes the original",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "messageId": {"type": "string"},
                    "task": {"type": "string"},
                    "context": {"type": "string"}
                },
                "required": ["messageId", "task"]
            }
        }),
    ]
}

async fn call_tool(ctx: &Arc<AppContext>, name: &str, args: Value) -> Result<Value> {
    match name {
        "send" => {
            let req = SendRequest {
                to: required_str(&args, "to")?,
                from: required_str(&args, "from")?,
                task: required_str(&args, "task")?,
                context: args["context"].as_str().map(str::to_string),
                project: args["project"].as_str().map(str::to_string),
                priority: args["priority"]
                    .as_str()
                    .and_then(|p| serde_json::from_value::<Priority>(json!(p)).ok()),
                reply_to: args["replyTo"].as_str().map(str::to_string),
                ..Default::default()
            };
            let outcome = perform_send(ctx, req).await?;
            Ok(json!({"messageId": outcome.message.id, "status": outcome.message.status}))
        }
        "check" => {
            let inbox = required_str(&args, "inbox")?;
            let (messages, _) = ctx
                .mailbox
                .check_inbox(
                    &inbox,
                    args["includeRead"].as_bool().unwrap_or(false),
                    args["autoApprove"].as_bool().unwrap_or(false),
                )
                .await?;
            Ok(json!({"inbox": inbox, "messages": messages, "count": messages.len()}))
        }
        "receive" => {
            let id = required_str(&args, "messageId")?;
            let msg = ctx.mailbox.mark_read(&id).await?;
            ctx.audit
                .emit(actions::MESSAGE_READ, &msg.to, "message", &msg.id, Value::Null, Some("mcp"))
                .await;
            Ok(json!({"message": msg}))
        }
        "complete" => {
            let id = required_str(&args, "messageId")?;
            let msg = ctx.mailbox.complete(&id).await?;
            ctx.audit
                .emit(actions::MESSAGE_COMPLETE, &msg.to, "message", &msg.id, Value::Null, Some("mcp"))
                .await;
            Ok(json!({"message": msg}))
        }
        "reply" => {
            // Resolve the original to learn who to answer.
            let id = required_str(&args, "messageId")?;
            let original = ctx.mailbox.get_message(&id).await?;
            let req = SendRequest {
                to: original.from.clone(),
                from: original.to.clone(),
                task: required_str(&args, "task")?,
                context: args["context"].as_str().map(str::to_string),
                reply_to: Some(original.id.clone()),
                path_metadata_implied: true,
                ..Default::default()
            };
            let outcome = perform_send(ctx, req).await?;
            Ok(json!({
                "messageId": outcome.message.id,
                "threadId": outcome.message.thread_id,
                "completedParent": outcome.completed_parent,
            }))
        }
        other => Err(anyhow::anyhow!("unknown tool '{other}'")),
    }
}

fn required_str(args: &Value, key: &str) -> Result<String> {
    args[key]
        .as_str()
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing required argument '{key}'"))
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_schemas_cover_the_mailbox_surface() {
        let names: Vec<String> = tool_schemas()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["send", "check", "receive", "complete", "reply"]);
        for tool in tool_schemas() {
            assert!(tool["inputSchema"]["type"].as_str() == Some("object"));
        }
    }

    #[test]
    fn required_str_rejects_missing_and_empty() {
        let args = json!({"to": "replit/main", "task": ""});
        assert_eq!(required_str(&args, "to").unwrap(), "replit/main");
        assert!(required_str(&args, "task").is_err());
        assert!(required_str(&args, "from").is_err());
    }
}
