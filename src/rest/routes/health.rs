// SPDX-License-Identifier: MIT

use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::AppContext;

pub async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let storage = ctx.storage.stats().await.ok();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": ctx.started_at.elapsed().as_secs(),
        "inboxes": ctx.mailbox.inbox_count().await,
        "messages": ctx.mailbox.message_count().await,
        "bridgeConnections": ctx.bridge.connection_count().await,
        "storage": storage,
    }))
}
