// SPDX-License-Identifier: MIT
//! Bridge protocol tests over a real WebSocket connection.

mod common;

use common::{start_server, TEST_BRIDGE_SECRET};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(base: &str) -> Ws {
    let ws_url = format!("{}/bridge/connect", base.replace("http://", "ws://"));
    let (ws, _) = connect_async(ws_url).await.unwrap();
    ws
}

async fn send_frame(ws: &mut Ws, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Read frames until one of the wanted `type` arrives (drops interleaved
/// presence traffic).
async fn recv_type(ws: &mut Ws, wanted: &str) -> Value {
    let deadline = std::time::Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("frame should arrive")
            .expect("connection open")
            .expect("frame ok");
        if let Message::Text(text) = msg {
            let v: Value = serde_json::from_str(&text).unwrap();
            if v["type"] == wanted {
                return v;
            }
        }
    }
}

async fn auth(ws: &mut Ws, agent_id: &str) -> Value {
    let token = quackd::crypto::bridge_token(TEST_BRIDGE_SECRET, agent_id);
    send_frame(ws, json!({"type": "auth", "agent_id": agent_id, "token": token})).await;
    recv_type(ws, "auth_success").await
}

#[tokio::test]
async fn welcome_then_auth_succeeds_with_hmac_token() {
    let (base, _ctx) = start_server(false).await;
    let mut ws = connect(&base).await;

    let welcome = recv_type(&mut ws, "welcome").await;
    assert_eq!(welcome["protocol_version"], "1.0");

    let ok = auth(&mut ws, "replit/agent").await;
    assert_eq!(ok["agent_id"], "replit/agent");
    assert!(ok["online_agents"]
        .as_array()
        .unwrap()
        .contains(&json!("replit/agent")));
}

#[tokio::test]
async fn bad_token_is_rejected_and_closed() {
    let (base, _ctx) = start_server(false).await;
    let mut ws = connect(&base).await;
    recv_type(&mut ws, "welcome").await;

    send_frame(
        &mut ws,
        json!({"type": "auth", "agent_id": "replit/agent", "token": "wrong"}),
    )
    .await;
    let err = recv_type(&mut ws, "error").await;
    assert!(err["error"].as_str().unwrap().contains("auth failed"));
    // The server closes after an auth failure.
    loop {
        match ws.next().await {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
            Some(Ok(_)) => {}
        }
    }
}

#[tokio::test]
async fn malformed_agent_id_is_rejected() {
    let (base, _ctx) = start_server(true).await;
    let mut ws = connect(&base).await;
    recv_type(&mut ws, "welcome").await;

    send_frame(&mut ws, json!({"type": "auth", "agent_id": "no-slash"})).await;
    let err = recv_type(&mut ws, "error").await;
    assert!(err["error"].as_str().unwrap().contains("platform/name"));
}

#[tokio::test]
async fn frames_before_auth_are_rejected_but_connection_survives() {
    let (base, _ctx) = start_server(true).await;
    let mut ws = connect(&base).await;
    recv_type(&mut ws, "welcome").await;

    send_frame(&mut ws, json!({"type": "ping"})).await;
    let err = recv_type(&mut ws, "error").await;
    assert_eq!(err["error"], "authenticate first");

    // Still usable: dev bypass accepts auth without a token.
    send_frame(&mut ws, json!({"type": "auth", "agent_id": "replit/agent"})).await;
    recv_type(&mut ws, "auth_success").await;
}

#[tokio::test]
async fn ping_pong_marks_presence() {
    let (base, _ctx) = start_server(false).await;
    let mut ws = connect(&base).await;
    recv_type(&mut ws, "welcome").await;
    auth(&mut ws, "replit/agent").await;

    send_frame(&mut ws, json!({"type": "ping"})).await;
    recv_type(&mut ws, "pong").await;
}

#[tokio::test]
async fn online_peer_gets_direct_delivery() {
    let (base, _ctx) = start_server(false).await;

    let mut alice = connect(&base).await;
    recv_type(&mut alice, "welcome").await;
    auth(&mut alice, "cursor/agent").await;

    let mut bob = connect(&base).await;
    recv_type(&mut bob, "welcome").await;
    auth(&mut bob, "replit/agent").await;

    send_frame(
        &mut alice,
        json!({"type": "message", "to": "replit/agent", "content": "hi bob"}),
    )
    .await;
    let sent = recv_type(&mut alice, "message_sent").await;
    assert_eq!(sent["delivered"], true);

    let delivered = recv_type(&mut bob, "message").await;
    assert_eq!(delivered["from"], "cursor/agent");
    assert_eq!(delivered["content"], "hi bob");
}

#[tokio::test]
async fn offline_peer_falls_back_to_mailbox() {
    let (base, ctx) = start_server(false).await;
    let mut ws = connect(&base).await;
    recv_type(&mut ws, "welcome").await;
    auth(&mut ws, "cursor/agent").await;

    send_frame(
        &mut ws,
        json!({"type": "message", "to": "claude/web", "content": "hi"}),
    )
    .await;
    let sent = recv_type(&mut ws, "message_sent").await;
    assert_eq!(sent["delivered"], false);
    let message_id = sent["message_id"].as_str().unwrap().to_string();

    // Conversational root coalescing: the message landed in /claude.
    let (messages, _) = ctx.mailbox.check_inbox("claude", true, false).await.unwrap();
    let msg = messages.iter().find(|m| m.id == message_id).unwrap();
    assert_eq!(msg.to, "claude");
    assert_eq!(serde_json::to_value(msg.status).unwrap(), json!("approved"));
    let tags = msg.tags.clone().unwrap();
    for tag in ["bridge", "websocket", "auto-approved"] {
        assert!(tags.contains(&tag.to_string()), "missing tag {tag}");
    }

    // The approval is audited with the bridge source.
    let entries = ctx
        .audit
        .query(&quackd::audit::AuditFilter {
            action: Some("message.approve".to_string()),
            target_id: Some(message_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].source.as_deref(), Some("quack-bridge"));
}

#[tokio::test]
async fn broadcast_reaches_subscribers_only() {
    let (base, _ctx) = start_server(false).await;

    let mut publisher = connect(&base).await;
    recv_type(&mut publisher, "welcome").await;
    auth(&mut publisher, "cursor/agent").await;

    let mut listener = connect(&base).await;
    recv_type(&mut listener, "welcome").await;
    auth(&mut listener, "replit/agent").await;
    send_frame(&mut listener, json!({"type": "subscribe", "channels": ["deploys"]})).await;
    recv_type(&mut listener, "subscribed").await;

    let mut bystander = connect(&base).await;
    recv_type(&mut bystander, "welcome").await;
    auth(&mut bystander, "gemini/agent").await;

    send_frame(
        &mut publisher,
        json!({"type": "broadcast", "channel": "deploys", "content": {"build": 7}}),
    )
    .await;
    let receipt = recv_type(&mut publisher, "broadcast_sent").await;
    assert_eq!(receipt["delivered"], 1);

    let received = recv_type(&mut listener, "broadcast").await;
    assert_eq!(received["channel"], "deploys");
    assert_eq!(received["content"]["build"], 7);
}

#[tokio::test]
async fn commands_pair_with_responses_when_online() {
    let (base, _ctx) = start_server(false).await;

    let mut caller = connect(&base).await;
    recv_type(&mut caller, "welcome").await;
    auth(&mut caller, "cursor/agent").await;

    let mut worker = connect(&base).await;
    recv_type(&mut worker, "welcome").await;
    auth(&mut worker, "replit/agent").await;

    send_frame(
        &mut caller,
        json!({"type": "command", "to": "replit/agent", "action": "build", "payload": {"ref": "main"}}),
    )
    .await;
    let sent = recv_type(&mut caller, "command_sent").await;
    let command_id = sent["command_id"].as_str().unwrap().to_string();

    let cmd = recv_type(&mut worker, "command").await;
    assert_eq!(cmd["action"], "build");
    assert_eq!(cmd["command_id"], command_id.as_str());

    // The worker echoes the command id back.
    send_frame(
        &mut worker,
        json!({"type": "response", "to": "cursor/agent", "command_id": command_id, "result": {"ok": true}}),
    )
    .await;
    let resp = recv_type(&mut caller, "response").await;
    assert_eq!(resp["command_id"], command_id.as_str());
    assert_eq!(resp["result"]["ok"], true);

    // Offline target: command fails fast.
    send_frame(
        &mut caller,
        json!({"type": "command", "to": "grok/agent", "action": "noop"}),
    )
    .await;
    recv_type(&mut caller, "command_failed").await;
}

#[tokio::test]
async fn duplicate_agent_id_replaces_older_connection() {
    let (base, _ctx) = start_server(false).await;

    let mut first = connect(&base).await;
    recv_type(&mut first, "welcome").await;
    auth(&mut first, "replit/agent").await;

    let mut second = connect(&base).await;
    recv_type(&mut second, "welcome").await;
    auth(&mut second, "replit/agent").await;

    let notice = recv_type(&mut first, "replaced").await;
    assert!(notice["reason"].as_str().unwrap().contains("another connection"));
}

#[tokio::test]
async fn get_relay_sends_and_approves() {
    let (base, ctx) = start_server(false).await;
    let resp: Value = reqwest::get(format!(
        "{base}/bridge/relay?from=grok/agent&to=claude&task=hello%20there&context=from%20a%20browser"
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();

    assert_eq!(resp["success"], true);
    assert_eq!(resp["status"], "approved");
    let id = resp["message_id"].as_str().unwrap().to_string();

    let msg = ctx.mailbox.get_message(&id).await.unwrap();
    assert_eq!(msg.task, "hello there");
    assert_eq!(msg.context.as_deref(), Some("from a browser"));

    let entries = ctx
        .audit
        .query(&quackd::audit::AuditFilter {
            target_id: Some(id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(entries.iter().any(|e| e.source.as_deref() == Some("bridge-relay")));
}

#[tokio::test]
async fn bridge_status_reports_connections() {
    let (base, _ctx) = start_server(false).await;
    let mut ws = connect(&base).await;
    recv_type(&mut ws, "welcome").await;
    auth(&mut ws, "replit/agent").await;

    let status: Value = reqwest::get(format!("{base}/bridge/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["connections"], 1);
    assert_eq!(status["onlineAgents"][0], "replit/agent");
}
