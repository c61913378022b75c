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
pub struct CreateKeyBody {
    pub owner: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

pub async fn create(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateKeyBody>,
) -> Result<Json<Value>, HandlerError> {
    let (record, plaintext) = ctx
        .keys
        .create(&body.owner, body.permissions)
        .await
        .map_err(map_err)?;
    ctx.audit
        .emit(
            actions::KEY_CREATE,
            &body.owner,
            "api_key",
            &record.id,
            json!({"permissions": record.permissions}),
            None,
        )
        .await;
    // The plaintext key is shown exactly once.
    Ok(Json(json!({"success": true, "key": plaintext, "record": record})))
}

pub async fn list(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, HandlerError> {
    let keys = ctx.keys.list().await.map_err(map_err)?;
    Ok(Json(json!({"keys": keys, "count": keys.len()})))
}

pub async fn revoke(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HandlerError> {
    ctx.keys.revoke(&id).await.map_err(map_err)?;
    ctx.audit
        .emit(actions::KEY_REVOKE, "operator", "api_key", &id, Value::Null, None)
        .await;
    Ok(Json(json!({"success": true, "revoked": id})))
}
