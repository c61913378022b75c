// SPDX-License-Identifier: MIT

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::audit::actions;
use crate::registry::AgentRecord;
use crate::rest::map_err;
use crate::AppContext;

type HandlerError = (StatusCode, Json<Value>);

pub async fn register(
    State(ctx): State<Arc<AppContext>>,
    Json(record): Json<AgentRecord>,
) -> Result<Json<Value>, HandlerError> {
    let record = ctx.registry.register(record).await.map_err(map_err)?;
    ctx.audit
        .emit(
            actions::AGENT_REGISTER,
            &record.id,
            "agent",
            &record.id,
            json!({"category": record.category, "notifyMode": record.notify_mode}),
            None,
        )
        .await;
    Ok(Json(json!({"success": true, "agent": record})))
}

pub async fn list(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, HandlerError> {
    let now = Utc::now();
    let agents = ctx.registry.list(false).await.map_err(map_err)?;
    let list: Vec<Value> = agents
        .iter()
        .map(|a| {
            let mut v = serde_json::to_value(a).unwrap_or_default();
            v["online"] = json!(a.is_online(now));
            v
        })
        .collect();
    Ok(Json(json!({"agents": list, "count": list.len()})))
}

pub async fn get(
    State(ctx): State<Arc<AppContext>>,
    Path((platform, name)): Path<(String, String)>,
) -> Result<Json<Value>, HandlerError> {
    let id = format!("{platform}/{name}");
    let agent = ctx
        .registry
        .get(&id)
        .await
        .map_err(map_err)?
        .ok_or_else(|| map_err(anyhow::anyhow!("NOT_FOUND:agent '{id}'")))?;
    let online = agent.is_online(Utc::now());
    let mut v = serde_json::to_value(&agent).unwrap_or_default();
    v["online"] = json!(online);
    Ok(Json(json!({"agent": v})))
}

pub async fn update(
    State(ctx): State<Arc<AppContext>>,
    Path((platform, name)): Path<(String, String)>,
    Json(record): Json<AgentRecord>,
) -> Result<Json<Value>, HandlerError> {
    let id = format!("{platform}/{name}");
    let record = ctx.registry.update(&id, record).await.map_err(map_err)?;
    ctx.audit
        .emit(actions::AGENT_UPDATE, &id, "agent", &id, Value::Null, None)
        .await;
    Ok(Json(json!({"success": true, "agent": record})))
}

pub async fn remove(
    State(ctx): State<Arc<AppContext>>,
    Path((platform, name)): Path<(String, String)>,
) -> Result<Json<Value>, HandlerError> {
    let id = format!("{platform}/{name}");
    ctx.registry.delete(&id).await.map_err(map_err)?;
    ctx.audit
        .emit(actions::AGENT_DELETE, &id, "agent", &id, Value::Null, None)
        .await;
    Ok(Json(json!({"success": true, "deleted": id})))
}

pub async fn ping(
    State(ctx): State<Arc<AppContext>>,
    Path((platform, name)): Path<(String, String)>,
) -> Result<Json<Value>, HandlerError> {
    let id = format!("{platform}/{name}");
    let agent = ctx.registry.ping(&id).await.map_err(map_err)?;
    ctx.audit
        .emit(actions::AGENT_PING, &id, "agent", &id, Value::Null, None)
        .await;
    Ok(Json(json!({"success": true, "agent": agent, "online": true})))
}
