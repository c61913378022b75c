// SPDX-License-Identifier: MIT
//
// Real-time bridge. Long-lived WebSocket sessions on /bridge/connect with
// authenticated agent presence, direct delivery, command/response pairing,
// and pub/sub channels. Offline peers degrade to the mailbox. The HTTP-side
// GET relay shares the same delivery path.

pub mod frames;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::actions;
use crate::crypto;
use crate::mailbox::model::{Message, Priority};
use crate::mailbox::{paths, SendRequest};
use crate::registry::AgentCategory;
use crate::AppContext;

use frames::{AgentFilter, ClientFrame};

const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

// ─── Connection state ─────────────────────────────────────────────────────────

/// Outbound instructions for a connection's writer task.
enum OutMsg {
    Text(String),
    /// Send a goodbye/replace notice, then close the socket.
    Close(String),
}

struct ConnHandle {
    tx: mpsc::UnboundedSender<OutMsg>,
    capabilities: Vec<String>,
    subscribed: HashSet<String>,
    connected_at: String,
}

/// Shared bridge state. The connections map is the single point of
/// serialization; every handler mutates it under the mutex.
pub struct BridgeState {
    connections: Mutex<HashMap<String, ConnHandle>>,
    started_at: std::time::Instant,
}

impl BridgeState {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            started_at: std::time::Instant::now(),
        }
    }

    pub async fn online_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn is_online(&self, agent_id: &str) -> bool {
        self.connections.lock().await.contains_key(agent_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Deliver a frame to one agent. Returns false if the agent is offline
    /// or its channel is gone.
    async fn send_to(&self, agent_id: &str, frame: String) -> bool {
        let connections = self.connections.lock().await;
        match connections.get(agent_id) {
            Some(handle) => handle.tx.send(OutMsg::Text(frame)).is_ok(),
            None => false,
        }
    }

    /// Deliver a frame to every authenticated connection.
    async fn broadcast_all(&self, frame: &str) {
        let connections = self.connections.lock().await;
        for handle in connections.values() {
            let _ = handle.tx.send(OutMsg::Text(frame.to_string()));
        }
    }

    /// Deliver to every connection subscribed to `channel`.
    async fn broadcast_channel(&self, channel: &str, frame: &str) -> usize {
        let connections = self.connections.lock().await;
        let mut delivered = 0;
        for handle in connections.values() {
            if handle.subscribed.contains(channel)
                && handle.tx.send(OutMsg::Text(frame.to_string())).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Register a connection, closing any previous holder of the agent id
    /// with a replace notice.
    async fn register(
        &self,
        agent_id: &str,
        capabilities: Vec<String>,
        tx: mpsc::UnboundedSender<OutMsg>,
    ) {
        let mut connections = self.connections.lock().await;
        if let Some(previous) = connections.remove(agent_id) {
            let _ = previous.tx.send(OutMsg::Close(frames::replaced()));
        }
        connections.insert(
            agent_id.to_string(),
            ConnHandle {
                tx,
                capabilities,
                subscribed: HashSet::new(),
                connected_at: Utc::now().to_rfc3339(),
            },
        );
    }

    /// Remove a connection if (and only if) `tx` is still its handle — a
    /// replaced connection must not unregister its successor.
    async fn unregister(&self, agent_id: &str, tx: &mpsc::UnboundedSender<OutMsg>) -> bool {
        let mut connections = self.connections.lock().await;
        if connections
            .get(agent_id)
            .map(|h| h.tx.same_channel(tx))
            .unwrap_or(false)
        {
            connections.remove(agent_id);
            return true;
        }
        false
    }

    async fn subscribe(&self, agent_id: &str, channels: Vec<String>) {
        let mut connections = self.connections.lock().await;
        if let Some(handle) = connections.get_mut(agent_id) {
            handle.subscribed.extend(channels);
        }
    }

    /// Heartbeat sweep: drop connections whose writer has gone away and
    /// report them offline.
    pub async fn sweep_stale(&self) -> Vec<String> {
        let mut connections = self.connections.lock().await;
        let stale: Vec<String> = connections
            .iter()
            .filter(|(_, h)| h.tx.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            connections.remove(id);
        }
        stale
    }

    /// Close every connection with a goodbye frame (shutdown path).
    pub async fn close_all(&self) {
        let mut connections = self.connections.lock().await;
        for (_, handle) in connections.drain() {
            let _ = handle.tx.send(OutMsg::Close(frames::goodbye()));
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl Default for BridgeState {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Token validation ─────────────────────────────────────────────────────────

/// Bridge auth: dev bypass accepts anything; otherwise the supplied token
/// must equal HMAC-SHA256(secret, agent_id) truncated to 32 hex characters,
/// compared in constant time.
pub fn validate_token(ctx: &AppContext, agent_id: &str, token: Option<&str>) -> Result<()> {
    if ctx.config.dev_bypass {
        return Ok(());
    }
    let Some(secret) = ctx.config.bridge_secret.as_deref() else {
        bail!("bridge secret is not configured");
    };
    let expected = crypto::bridge_token(secret, agent_id);
    match token {
        Some(token) if crypto::constant_time_eq(token, &expected) => Ok(()),
        _ => bail!("invalid token"),
    }
}

fn valid_agent_id(agent_id: &str) -> bool {
    let segments: Vec<&str> = agent_id.split('/').collect();
    segments.len() == 2 && segments.iter().all(|s| !s.is_empty())
}

// ─── WebSocket handler ────────────────────────────────────────────────────────

pub async fn connect_handler(
    State(ctx): State<Arc<AppContext>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn handle_socket(socket: WebSocket, ctx: Arc<AppContext>) {
    let (mut sink, mut stream) = socket.split();

    if sink
        .send(WsMessage::Text(frames::welcome()))
        .await
        .is_err()
    {
        return;
    }

    // Writer task: everything outbound funnels through one channel so
    // frames from other connections never interleave mid-write.
    let (tx, mut rx) = mpsc::unbounded_channel::<OutMsg>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                OutMsg::Text(text) => {
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                OutMsg::Close(text) => {
                    let _ = sink.send(WsMessage::Text(text)).await;
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    let mut authenticated: Option<String> = None;

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let parsed: std::result::Result<ClientFrame, _> = serde_json::from_str(&text);
        let frame = match parsed {
            Ok(frame) => frame,
            Err(e) => {
                let _ = tx.send(OutMsg::Text(frames::error(&format!("bad frame: {e}"))));
                continue;
            }
        };

        match frame {
            // ── Authentication ───────────────────────────────────────────────
            ClientFrame::Auth { .. } if authenticated.is_some() => {
                let _ = tx.send(OutMsg::Text(frames::error("already authenticated")));
            }
            ClientFrame::Auth { agent_id, capabilities, token } => {
                let agent_id = paths::normalize(&agent_id);
                if !valid_agent_id(&agent_id) {
                    let _ = tx.send(OutMsg::Close(frames::error(
                        "agent_id must be 'platform/name'",
                    )));
                    break;
                }
                if let Err(e) = validate_token(&ctx, &agent_id, token.as_deref()) {
                    let _ = tx.send(OutMsg::Close(frames::error(&format!("auth failed: {e}"))));
                    break;
                }

                ctx.bridge
                    .register(&agent_id, capabilities.unwrap_or_default(), tx.clone())
                    .await;
                let _ = ctx.registry.update_last_activity(paths::root(&agent_id)).await;
                ctx.audit
                    .emit(
                        actions::BRIDGE_CONNECT,
                        &agent_id,
                        "bridge",
                        &agent_id,
                        Value::Null,
                        Some("quack-bridge"),
                    )
                    .await;

                let online = ctx.bridge.online_agents().await;
                let _ = tx.send(OutMsg::Text(frames::auth_success(&agent_id, &online)));
                ctx.bridge
                    .broadcast_all(&frames::presence(&agent_id, "online"))
                    .await;
                info!(agent = %agent_id, "bridge agent online");
                authenticated = Some(agent_id);
            }

            // ── Authenticated frames ─────────────────────────────────────────
            frame => match authenticated.clone() {
                None => {
                    let _ = tx.send(OutMsg::Text(frames::error("authenticate first")));
                }
                Some(agent_id) => {
                    if let Err(e) = handle_frame(&ctx, &agent_id, frame, &tx).await {
                        warn!(agent = %agent_id, err = %e, "bridge frame error");
                        let _ = tx.send(OutMsg::Text(frames::error(&e.to_string())));
                    }
                }
            },
        }
    }

    // Disconnect: unregister (unless replaced) and announce offline.
    if let Some(agent_id) = authenticated {
        if ctx.bridge.unregister(&agent_id, &tx).await {
            ctx.bridge
                .broadcast_all(&frames::presence(&agent_id, "offline"))
                .await;
            ctx.audit
                .emit(
                    actions::BRIDGE_DISCONNECT,
                    &agent_id,
                    "bridge",
                    &agent_id,
                    Value::Null,
                    Some("quack-bridge"),
                )
                .await;
            info!(agent = %agent_id, "bridge agent offline");
        }
    }
    drop(tx);
    let _ = writer.await;
}

async fn handle_frame(
    ctx: &Arc<AppContext>,
    agent_id: &str,
    frame: ClientFrame,
    tx: &mpsc::UnboundedSender<OutMsg>,
) -> Result<()> {
    match frame {
        ClientFrame::Auth { .. } => unreachable!("handled by the connection loop"),

        ClientFrame::Ping => {
            let _ = ctx.registry.update_last_activity(paths::root(agent_id)).await;
            let _ = tx.send(OutMsg::Text(frames::pong()));
        }

        ClientFrame::Message { to, content, metadata } => {
            let to = paths::normalize(&to);
            if ctx.bridge.is_online(&to).await {
                let delivered = ctx
                    .bridge
                    .send_to(
                        &to,
                        json!({
                            "type": "message",
                            "from": agent_id,
                            "content": content,
                            "metadata": metadata,
                        })
                        .to_string(),
                    )
                    .await;
                let _ = tx.send(OutMsg::Text(
                    json!({"type": "message_sent", "to": to, "delivered": delivered}).to_string(),
                ));
            } else {
                let message = fallback_to_mailbox(ctx, agent_id, &to, &content).await?;
                let _ = tx.send(OutMsg::Text(
                    json!({
                        "type": "message_sent",
                        "to": message.to,
                        "delivered": false,
                        "message_id": message.id,
                    })
                    .to_string(),
                ));
            }
        }

        ClientFrame::Command { to, action, payload, await_response, command_id } => {
            let to = paths::normalize(&to);
            let command_id = command_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            if ctx.bridge.is_online(&to).await {
                ctx.bridge
                    .send_to(
                        &to,
                        json!({
                            "type": "command",
                            "from": agent_id,
                            "action": action,
                            "payload": payload,
                            "await_response": await_response.unwrap_or(false),
                            "command_id": command_id,
                        })
                        .to_string(),
                    )
                    .await;
                let _ = tx.send(OutMsg::Text(
                    json!({"type": "command_sent", "to": to, "command_id": command_id}).to_string(),
                ));
            } else {
                let _ = tx.send(OutMsg::Text(
                    json!({
                        "type": "command_failed",
                        "to": to,
                        "command_id": command_id,
                        "error": "agent offline",
                    })
                    .to_string(),
                ));
            }
        }

        ClientFrame::Response { command_id, to, result, error } => {
            let to = paths::normalize(&to);
            if ctx.bridge.is_online(&to).await {
                ctx.bridge
                    .send_to(
                        &to,
                        json!({
                            "type": "response",
                            "from": agent_id,
                            "command_id": command_id,
                            "result": result,
                            "error": error,
                        })
                        .to_string(),
                    )
                    .await;
            } else {
                let _ = tx.send(OutMsg::Text(
                    json!({
                        "type": "response_failed",
                        "to": to,
                        "command_id": command_id,
                        "error": "agent offline",
                    })
                    .to_string(),
                ));
            }
        }

        ClientFrame::Broadcast { channel, content } => {
            let delivered = ctx
                .bridge
                .broadcast_channel(
                    &channel,
                    &json!({
                        "type": "broadcast",
                        "from": agent_id,
                        "channel": channel,
                        "content": content,
                    })
                    .to_string(),
                )
                .await;
            let _ = tx.send(OutMsg::Text(
                json!({"type": "broadcast_sent", "channel": channel, "delivered": delivered})
                    .to_string(),
            ));
        }

        ClientFrame::Subscribe { channels } => {
            ctx.bridge.subscribe(agent_id, channels.clone()).await;
            let _ = tx.send(OutMsg::Text(
                json!({"type": "subscribed", "channels": channels}).to_string(),
            ));
        }

        ClientFrame::ListAgents { filter } => {
            let list = list_agents(ctx, filter.unwrap_or_default()).await?;
            let _ = tx.send(OutMsg::Text(
                json!({"type": "agent_list", "agents": list}).to_string(),
            ));
        }
    }
    Ok(())
}

async fn list_agents(ctx: &Arc<AppContext>, filter: AgentFilter) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    let connections = ctx.bridge.connections.lock().await;
    for (id, handle) in connections.iter() {
        out.push(json!({
            "agent_id": id,
            "online": true,
            "capabilities": handle.capabilities,
            "connected_at": handle.connected_at,
        }));
    }
    let connected: HashSet<String> = connections.keys().cloned().collect();
    drop(connections);

    for record in ctx.registry.list(false).await? {
        if !connected.contains(&record.id) {
            out.push(json!({
                "agent_id": record.id,
                "online": false,
                "capabilities": record.capabilities,
            }));
        }
    }

    out.retain(|entry| {
        if let Some(online) = filter.online {
            if entry["online"].as_bool() != Some(online) {
                return false;
            }
        }
        if let Some(platform) = &filter.platform {
            let id = entry["agent_id"].as_str().unwrap_or_default();
            if paths::root(id) != platform.to_ascii_lowercase() {
                return false;
            }
        }
        if let Some(capability) = &filter.capability {
            let caps = entry["capabilities"].as_array().cloned().unwrap_or_default();
            if !caps.iter().any(|c| c.as_str() == Some(capability)) {
                return false;
            }
        }
        true
    });
    Ok(out)
}

// ─── Mailbox fallback ─────────────────────────────────────────────────────────

/// Deliver to an offline peer through the mailbox: coalesce conversational
/// sub-paths to the platform root, submit, then immediately approve. The
/// approval is audited with source `quack-bridge`.
pub async fn fallback_to_mailbox(
    ctx: &Arc<AppContext>,
    from: &str,
    to: &str,
    content: &str,
) -> Result<Message> {
    let mut inbox = paths::normalize(to);
    if inbox.contains('/') {
        let root = paths::root(&inbox).to_string();
        if let Some(agent) = ctx.registry.find_by_platform(&root).await? {
            // Legacy shim: conversational frontends poll their root inbox.
            if agent.category == AgentCategory::Conversational {
                inbox = root;
            }
        }
    }

    let outcome = ctx
        .mailbox
        .send(
            SendRequest {
                to: inbox,
                from: from.to_string(),
                task: content.to_string(),
                tags: Some(vec![
                    "bridge".to_string(),
                    "websocket".to_string(),
                    "auto-approved".to_string(),
                ]),
                require_approval: Some(true),
                path_metadata_implied: true,
                ..Default::default()
            },
            false,
        )
        .await?;
    ctx.audit
        .emit(
            actions::MESSAGE_SEND,
            from,
            "message",
            &outcome.message.id,
            json!({"inbox": outcome.message.to, "via": "bridge-fallback"}),
            Some("quack-bridge"),
        )
        .await;

    let approved = ctx.mailbox.approve(&outcome.message.id).await?;
    ctx.audit
        .emit(
            actions::MESSAGE_APPROVE,
            from,
            "message",
            &approved.id,
            json!({"inbox": approved.to}),
            Some("quack-bridge"),
        )
        .await;
    ctx.webhooks
        .fan_out(crate::webhooks::WebhookEvent::MessageReceived, &approved);
    ctx.webhooks
        .fan_out(crate::webhooks::WebhookEvent::MessageApproved, &approved);
    ctx.sessions
        .on_message(from, &approved.to, &approved.thread_id, approved.control_type)
        .await?;
    debug!(id = %approved.id, inbox = %approved.to, "bridge fallback delivered to mailbox");
    Ok(approved)
}

// ─── HTTP-side relay ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayParams {
    pub from: String,
    pub to: String,
    pub task: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// GET-only relay for agents that can only fetch URLs: send + approve in
/// one request, audited as `bridge-relay`.
pub async fn relay_handler(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<RelayParams>,
) -> impl IntoResponse {
    let outcome = ctx
        .mailbox
        .send(
            SendRequest {
                to: params.to,
                from: params.from.clone(),
                task: params.task,
                context: params.context,
                project: params.project,
                priority: params.priority,
                reply_to: params.reply_to,
                tags: Some(vec!["bridge".to_string(), "relay".to_string()]),
                require_approval: Some(true),
                path_metadata_implied: true,
                ..Default::default()
            },
            false,
        )
        .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            return Json(json!({"success": false, "error": e.to_string()}));
        }
    };

    match ctx.mailbox.approve(&outcome.message.id).await {
        Ok(approved) => {
            ctx.audit
                .emit(
                    actions::MESSAGE_APPROVE,
                    &params.from,
                    "message",
                    &approved.id,
                    json!({"inbox": approved.to}),
                    Some("bridge-relay"),
                )
                .await;
            let _ = ctx
                .sessions
                .on_message(&params.from, &approved.to, &approved.thread_id, approved.control_type)
                .await;
            Json(json!({
                "success": true,
                "message_id": approved.id,
                "status": approved.status,
            }))
        }
        Err(e) => Json(json!({"success": false, "error": e.to_string()})),
    }
}

/// GET /bridge/agents — online agents plus registered offline ones.
pub async fn agents_handler(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    match list_agents(&ctx, AgentFilter::default()).await {
        Ok(agents) => Json(json!({"agents": agents})),
        Err(e) => Json(json!({"error": e.to_string()})),
    }
}

/// GET /bridge/status — connection counts and uptime.
pub async fn status_handler(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let online = ctx.bridge.online_agents().await;
    Json(json!({
        "status": "ok",
        "protocolVersion": frames::PROTOCOL_VERSION,
        "connections": online.len(),
        "onlineAgents": online,
        "uptime": ctx.bridge.uptime_secs(),
    }))
}

// ─── Heartbeat sweep ──────────────────────────────────────────────────────────

/// 30-second sweep reaping connections whose sockets are gone.
pub async fn run_heartbeat_sweep(
    ctx: Arc<AppContext>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let stale = ctx.bridge.sweep_stale().await;
                for agent_id in stale {
                    debug!(agent = %agent_id, "heartbeat reaped stale connection");
                    ctx.bridge
                        .broadcast_all(&frames::presence(&agent_id, "offline"))
                        .await;
                }
            }
            _ = shutdown.changed() => {
                ctx.bridge.close_all().await;
                break;
            }
        }
    }
}
