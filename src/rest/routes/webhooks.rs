// SPDX-License-Identifier: MIT

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::audit::actions;
use crate::rest::map_err;
use crate::AppContext;

type HandlerError = (StatusCode, Json<Value>);

#[derive(Debug, Deserialize)]
pub struct SubscribeBody {
    pub inbox: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
}

pub async fn subscribe(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<SubscribeBody>,
) -> Result<Json<Value>, HandlerError> {
    let sub = ctx
        .webhooks
        .subscribe(&body.inbox, &body.url, body.secret)
        .await
        .map_err(map_err)?;
    ctx.audit
        .emit(
            actions::WEBHOOK_SUBSCRIBE,
            "operator",
            "webhook",
            &sub.id,
            json!({"inbox": sub.inbox, "url": sub.url}),
            None,
        )
        .await;
    Ok(Json(json!({"success": true, "webhook": sub})))
}

pub async fn list(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let subs = ctx.webhooks.list().await;
    Json(json!({"webhooks": subs, "count": subs.len()}))
}

pub async fn unsubscribe(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HandlerError> {
    ctx.webhooks.unsubscribe(&id).await.map_err(map_err)?;
    ctx.audit
        .emit(actions::WEBHOOK_UNSUBSCRIBE, "operator", "webhook", &id, Value::Null, None)
        .await;
    Ok(Json(json!({"success": true, "deleted": id})))
}
