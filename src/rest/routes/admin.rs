// SPDX-License-Identifier: MIT

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::mailbox::sweep::sweep_once;
use crate::rest::map_err;
use crate::AppContext;

type HandlerError = (StatusCode, Json<Value>);

/// On-demand TTL sweep.
pub async fn sweep(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, HandlerError> {
    let dropped = sweep_once(&ctx.mailbox, &ctx.archive, &ctx.audit)
        .await
        .map_err(map_err)?;
    Ok(Json(json!({"success": true, "dropped": dropped})))
}

/// Drop all mailbox state. Destructive; intended for test environments.
pub async fn reset(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, HandlerError> {
    ctx.mailbox.reset().await.map_err(map_err)?;
    Ok(Json(json!({"success": true})))
}
