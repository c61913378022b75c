// SPDX-License-Identifier: MIT
//
// Mailbox routes. `perform_send` is the one true send path: policy decision,
// store write, audit, session bookkeeping, webhook fan-out, auto-wake. The
// bridge fallback and the tool server reuse it.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::audit::actions;
use crate::mailbox::model::MessageStatus;
use crate::mailbox::paths;
use crate::mailbox::{SendOutcome, SendRequest};
use crate::rest::map_err;
use crate::webhooks::WebhookEvent;
use crate::AppContext;

type HandlerError = (StatusCode, Json<Value>);

// ─── Send ─────────────────────────────────────────────────────────────────────

/// Full send pipeline shared by REST, bridge send, and the tool server.
pub async fn perform_send(ctx: &Arc<AppContext>, req: SendRequest) -> anyhow::Result<SendOutcome> {
    let policy_approve = ctx.registry.should_auto_approve(&req.from, &req.to).await?;
    let from = req.from.clone();
    let outcome = ctx.mailbox.send(req, policy_approve).await?;
    let msg = &outcome.message;

    ctx.audit
        .emit(
            actions::MESSAGE_SEND,
            &from,
            "message",
            &msg.id,
            json!({"inbox": msg.to, "status": msg.status}),
            None,
        )
        .await;
    if let Some(parent_id) = &outcome.completed_parent {
        ctx.audit
            .emit(
                actions::MESSAGE_COMPLETE,
                &from,
                "message",
                parent_id,
                json!({"auto": true, "reply": msg.id}),
                None,
            )
            .await;
    }

    ctx.sessions
        .on_message(&msg.from, &msg.to, &msg.thread_id, msg.control_type)
        .await?;
    if msg.status == MessageStatus::Pending {
        let key = crate::sessions::session_key(&msg.from, &msg.to, &msg.thread_id);
        let _ = ctx.sessions.mark_awaiting_human(&key).await;
    }

    ctx.webhooks.fan_out(WebhookEvent::MessageReceived, msg);
    if let Ok(Some(agent)) = ctx.registry.find_by_platform(paths::root(&msg.to)).await {
        ctx.webhooks.auto_wake(&agent, msg);
    }

    Ok(outcome)
}

pub async fn send(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<SendRequest>,
) -> Result<Json<Value>, HandlerError> {
    let outcome = perform_send(&ctx, req).await.map_err(map_err)?;
    Ok(Json(json!({
        "success": true,
        "messageId": outcome.message.id,
        "message": outcome.message,
    })))
}

/// POST /bridge/send — same pipeline, bridge-flavored response.
pub async fn bridge_send(
    State(ctx): State<Arc<AppContext>>,
    Json(mut req): Json<SendRequest>,
) -> Result<Json<Value>, HandlerError> {
    req.path_metadata_implied = true;
    let outcome = perform_send(&ctx, req).await.map_err(map_err)?;
    Ok(Json(json!({
        "success": true,
        "message_id": outcome.message.id,
        "status": outcome.message.status,
    })))
}

// ─── Check ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckParams {
    #[serde(default)]
    pub include_read: Option<bool>,
    #[serde(default)]
    pub auto_approve: Option<bool>,
}

async fn check_inbox(
    ctx: Arc<AppContext>,
    inbox: String,
    params: CheckParams,
) -> Result<Json<Value>, HandlerError> {
    let include_terminal = params.include_read.unwrap_or(false);
    // Reading never escalates implicitly: the promotion happens only when
    // the caller asks for it, regardless of the agent record's flag.
    let auto_approve = params.auto_approve.unwrap_or(false);

    let (messages, approved_ids) = ctx
        .mailbox
        .check_inbox(&inbox, include_terminal, auto_approve)
        .await
        .map_err(map_err)?;

    for id in &approved_ids {
        ctx.audit
            .emit(
                actions::MESSAGE_APPROVE,
                "checker",
                "message",
                id,
                json!({"autoApproveOnCheck": true}),
                None,
            )
            .await;
    }
    let _ = ctx.registry.update_last_activity(paths::root(&inbox)).await;

    Ok(Json(json!({
        "inbox": paths::normalize(&inbox),
        "messages": messages,
        "count": messages.len(),
    })))
}

pub async fn check_inbox1(
    State(ctx): State<Arc<AppContext>>,
    Path(a): Path<String>,
    Query(params): Query<CheckParams>,
) -> Result<Json<Value>, HandlerError> {
    check_inbox(ctx, a, params).await
}

pub async fn check_inbox2(
    State(ctx): State<Arc<AppContext>>,
    Path((a, b)): Path<(String, String)>,
    Query(params): Query<CheckParams>,
) -> Result<Json<Value>, HandlerError> {
    check_inbox(ctx, format!("{a}/{b}"), params).await
}

pub async fn check_inbox3(
    State(ctx): State<Arc<AppContext>>,
    Path((a, b, c)): Path<(String, String, String)>,
    Query(params): Query<CheckParams>,
) -> Result<Json<Value>, HandlerError> {
    check_inbox(ctx, format!("{a}/{b}/{c}"), params).await
}

// ─── Lifecycle ────────────────────────────────────────────────────────────────

pub async fn get_message(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HandlerError> {
    let msg = ctx.mailbox.get_message(&id).await.map_err(map_err)?;
    Ok(Json(json!({"message": msg})))
}

pub async fn receive(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HandlerError> {
    let msg = ctx.mailbox.mark_read(&id).await.map_err(map_err)?;
    ctx.audit
        .emit(actions::MESSAGE_READ, &msg.to, "message", &msg.id, Value::Null, None)
        .await;
    Ok(Json(json!({"success": true, "message": msg})))
}

pub async fn complete(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HandlerError> {
    let msg = ctx.mailbox.complete(&id).await.map_err(map_err)?;
    ctx.audit
        .emit(actions::MESSAGE_COMPLETE, &msg.to, "message", &msg.id, Value::Null, None)
        .await;
    Ok(Json(json!({"success": true, "message": msg})))
}

/// Approve a held message: state machine first, then fan-out, auto-wake, an
/// in-band ping into the recipient's inbox, and an immediate dispatch.
pub async fn approve(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HandlerError> {
    let msg = ctx.mailbox.approve(&id).await.map_err(map_err)?;
    ctx.audit
        .emit(
            actions::MESSAGE_APPROVE,
            "operator",
            "message",
            &msg.id,
            json!({"inbox": msg.to}),
            None,
        )
        .await;

    ctx.webhooks.fan_out(WebhookEvent::MessageApproved, &msg);

    let agent = ctx
        .registry
        .find_by_platform(paths::root(&msg.to))
        .await
        .ok()
        .flatten();
    if let Some(agent) = &agent {
        ctx.webhooks.auto_wake(agent, &msg);
    }

    // Wake-up ping so polling agents see the approval without a webhook.
    let ping_task = format!(
        "🔔 PING: New message from {} is approved in {}. {}",
        msg.from,
        msg.to,
        agent
            .as_ref()
            .and_then(|a| a.notify_prompt.as_deref())
            .unwrap_or("Check your inbox and respond."),
    );
    let ping = ctx
        .mailbox
        .send(
            SendRequest {
                to: msg.to.clone(),
                from: "quack/system".to_string(),
                task: ping_task,
                tags: Some(vec!["ping".to_string(), "auto-wake".to_string()]),
                path_metadata_implied: true,
                ..Default::default()
            },
            true,
        )
        .await;
    match ping {
        Ok(ping) => {
            ctx.audit
                .emit(
                    actions::MESSAGE_SEND,
                    "quack/system",
                    "message",
                    &ping.message.id,
                    json!({"ping": true, "wakes": msg.id}),
                    None,
                )
                .await;
        }
        Err(e) => debug!(id = %msg.id, err = %e, "ping append failed"),
    }

    // Webhook-mode destinations get dispatched without waiting for the poll.
    let dispatcher = ctx.dispatcher.clone();
    let msg_id = msg.id.clone();
    tokio::spawn(async move {
        if let Err(e) = dispatcher.dispatch_now(&msg_id).await {
            debug!(id = %msg_id, err = %e, "post-approval dispatch failed");
        }
    });

    Ok(Json(json!({"success": true, "message": msg})))
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub status: String,
}

pub async fn update_status(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<Json<Value>, HandlerError> {
    let target: MessageStatus = body.status.parse().map_err(map_err)?;
    let before = ctx.mailbox.get_message(&id).await.map_err(map_err)?;
    let msg = ctx.mailbox.update_status(&id, target).await.map_err(map_err)?;
    ctx.audit
        .emit(
            actions::MESSAGE_STATUS,
            &msg.to,
            "message",
            &msg.id,
            json!({"from": before.status, "to": msg.status}),
            None,
        )
        .await;
    Ok(Json(json!({"success": true, "message": msg})))
}

pub async fn delete_message(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HandlerError> {
    let msg = ctx.mailbox.delete(&id).await.map_err(map_err)?;
    ctx.audit
        .emit(actions::MESSAGE_DELETE, &msg.to, "message", &msg.id, Value::Null, None)
        .await;
    Ok(Json(json!({"success": true, "deleted": msg.id})))
}

// ─── Threads ──────────────────────────────────────────────────────────────────

pub async fn list_threads(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let threads = ctx.mailbox.list_threads().await;
    let list: Vec<Value> = threads
        .iter()
        .map(|t| {
            json!({
                "threadId": t.first().map(|m| m.thread_id.clone()).unwrap_or_default(),
                "messageCount": t.len(),
                "lastActivity": t.last().map(|m| m.timestamp.clone()),
                "messages": t,
            })
        })
        .collect();
    Json(json!({"threads": list, "count": list.len()}))
}

pub async fn get_thread(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HandlerError> {
    let messages = ctx.mailbox.get_thread(&id).await;
    if messages.is_empty() {
        // The live store has nothing; fall back to the archive.
        if let Ok(Some(archived)) = ctx.archive.get_by_thread(&id).await {
            return Ok(Json(json!({"threadId": id, "archived": true, "messages": archived.messages})));
        }
        return Err(map_err(anyhow::anyhow!("NOT_FOUND:thread '{id}'")));
    }
    Ok(Json(json!({"threadId": id, "archived": false, "messages": messages})))
}
