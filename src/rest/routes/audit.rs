// SPDX-License-Identifier: MIT

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::audit::AuditFilter;
use crate::rest::map_err;
use crate::AppContext;

type HandlerError = (StatusCode, Json<Value>);

pub async fn query(
    State(ctx): State<Arc<AppContext>>,
    Query(filter): Query<AuditFilter>,
) -> Result<Json<Value>, HandlerError> {
    let entries = ctx.audit.query(&filter).await.map_err(map_err)?;
    Ok(Json(json!({"entries": entries, "count": entries.len()})))
}

pub async fn stats(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, HandlerError> {
    let stats = ctx.audit.stats().await.map_err(map_err)?;
    Ok(Json(json!({"stats": stats})))
}

#[derive(serde::Deserialize)]
pub struct ArchiveListParams {
    #[serde(default)]
    pub limit: Option<i64>,
}

/// GET /api/archive — most recently archived threads.
pub async fn list_archived(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<ArchiveListParams>,
) -> Result<Json<Value>, HandlerError> {
    let threads = ctx
        .archive
        .list(params.limit.unwrap_or(50))
        .await
        .map_err(map_err)?;
    Ok(Json(json!({"threads": threads, "count": threads.len()})))
}

pub async fn archived_thread(
    State(ctx): State<Arc<AppContext>>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>, HandlerError> {
    let archived = ctx
        .archive
        .get_by_thread(&thread_id)
        .await
        .map_err(map_err)?
        .ok_or_else(|| map_err(anyhow::anyhow!("NOT_FOUND:archived thread '{thread_id}'")))?;
    Ok(Json(json!({"thread": archived})))
}

/// Freeze a live thread into the archive on demand, without waiting for the
/// TTL sweep.
pub async fn archive_thread(
    State(ctx): State<Arc<AppContext>>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>, HandlerError> {
    let messages = ctx.mailbox.get_thread(&thread_id).await;
    if messages.is_empty() {
        return Err(map_err(anyhow::anyhow!("NOT_FOUND:thread '{thread_id}'")));
    }
    let archived = ctx
        .archive
        .archive_thread(&thread_id, &messages, json!({"reason": "api-request"}))
        .await
        .map_err(map_err)?;
    ctx.audit
        .emit(
            crate::audit::actions::THREAD_ARCHIVE,
            "operator",
            "thread",
            &thread_id,
            json!({"messageCount": messages.len()}),
            None,
        )
        .await;
    Ok(Json(json!({"success": true, "thread": archived})))
}
