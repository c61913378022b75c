// SPDX-License-Identifier: MIT
//
// Flight Recorder routes. `/journal` accepts the full entry shape; the
// `/thought`, `/error`, and `/checkpoint` shorthands pin the entry type.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::recorder::{ContextSnapshot, EntryType, NewEntry};
use crate::rest::map_err;
use crate::AppContext;

type HandlerError = (StatusCode, Json<Value>);

pub async fn journal(
    State(ctx): State<Arc<AppContext>>,
    Json(entry): Json<NewEntry>,
) -> Result<Json<Value>, HandlerError> {
    let stored = ctx.recorder.save_entry(entry).await.map_err(map_err)?;
    Ok(Json(json!({"success": true, "entry": stored})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShorthandBody {
    pub agent_id: String,
    pub content: Value,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub context_snapshot: Option<ContextSnapshot>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

async fn shorthand(
    ctx: Arc<AppContext>,
    entry_type: EntryType,
    body: ShorthandBody,
) -> Result<Json<Value>, HandlerError> {
    let stored = ctx
        .recorder
        .save_entry(NewEntry {
            agent_id: body.agent_id,
            entry_type,
            content: body.content,
            session_id: body.session_id,
            context_snapshot: body.context_snapshot,
            target_agent: None,
            tags: body.tags,
        })
        .await
        .map_err(map_err)?;
    Ok(Json(json!({"success": true, "entry": stored})))
}

pub async fn thought(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<ShorthandBody>,
) -> Result<Json<Value>, HandlerError> {
    shorthand(ctx, EntryType::Thought, body).await
}

pub async fn error(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<ShorthandBody>,
) -> Result<Json<Value>, HandlerError> {
    shorthand(ctx, EntryType::Error, body).await
}

pub async fn checkpoint(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<ShorthandBody>,
) -> Result<Json<Value>, HandlerError> {
    shorthand(ctx, EntryType::Checkpoint, body).await
}

// ─── Context & script ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ContextParams {
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn context_for_session(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
    Query(params): Query<ContextParams>,
) -> Result<Json<Value>, HandlerError> {
    let summary = ctx
        .recorder
        .get_context_for_session(&session_id, params.limit.unwrap_or(50))
        .await
        .map_err(map_err)?;
    Ok(Json(json!({"sessionId": session_id, "summary": summary})))
}

pub async fn context_for_agent(
    State(ctx): State<Arc<AppContext>>,
    Path(agent_id): Path<String>,
    Query(params): Query<ContextParams>,
) -> Result<Json<Value>, HandlerError> {
    let summary = ctx
        .recorder
        .get_context_for_agent(&agent_id, params.limit.unwrap_or(50))
        .await
        .map_err(map_err)?;
    let prompt = ctx
        .recorder
        .generate_universal_script(&agent_id, true)
        .await
        .map_err(map_err)?;
    Ok(Json(json!({"agentId": agent_id, "summary": summary, "prompt": prompt})))
}

#[derive(Debug, Deserialize)]
pub struct ScriptParams {
    #[serde(default)]
    pub include_context: Option<bool>,
}

pub async fn script(
    State(ctx): State<Arc<AppContext>>,
    Path(agent_id): Path<String>,
    Query(params): Query<ScriptParams>,
) -> Result<Json<Value>, HandlerError> {
    let script = ctx
        .recorder
        .generate_universal_script(&agent_id, params.include_context.unwrap_or(true))
        .await
        .map_err(map_err)?;
    Ok(Json(json!({"agentId": agent_id, "script": script})))
}

// ─── Sessions ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigninBody {
    pub agent_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

pub async fn signin(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<SigninBody>,
) -> Result<Json<Value>, HandlerError> {
    let session = ctx
        .recorder
        .get_or_create_session(&body.agent_id, body.session_id.as_deref())
        .await
        .map_err(map_err)?;
    Ok(Json(json!({"success": true, "session": session})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentBody {
    pub agent_id: String,
}

pub async fn session_new(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<AgentBody>,
) -> Result<Json<Value>, HandlerError> {
    let session = ctx
        .recorder
        .start_new_session(&body.agent_id)
        .await
        .map_err(map_err)?;
    Ok(Json(json!({"success": true, "session": session})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBody {
    pub session_id: String,
}

pub async fn session_close(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<SessionBody>,
) -> Result<Json<Value>, HandlerError> {
    ctx.recorder.close_session(&body.session_id).await.map_err(map_err)?;
    Ok(Json(json!({"success": true, "closed": body.session_id})))
}

pub async fn session_close_all(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<AgentBody>,
) -> Result<Json<Value>, HandlerError> {
    let closed = ctx
        .recorder
        .close_agent_sessions(&body.agent_id)
        .await
        .map_err(map_err)?;
    Ok(Json(json!({"success": true, "closed": closed})))
}

pub async fn sessions_for_agent(
    State(ctx): State<Arc<AppContext>>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, HandlerError> {
    let sessions = ctx
        .recorder
        .sessions_for_agent(&agent_id)
        .await
        .map_err(map_err)?;
    Ok(Json(json!({"sessions": sessions, "count": sessions.len()})))
}
