// SPDX-License-Identifier: MIT
//
// REST surface. Thin axum handlers over the stores; store errors carry
// sentinel prefixes that map onto HTTP status codes here.

pub mod auth;
pub mod routes;

use anyhow::Result;
use axum::{
    http::StatusCode,
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::AppContext;

pub async fn start_server(
    ctx: Arc<AppContext>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", ctx.config.port).parse()?;
    let router = build_router(ctx);

    info!("quackd listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    // /api routes behind the key check; health is open.
    let api = Router::new()
        // Mailbox
        .route("/api/send", post(routes::messages::send))
        .route("/api/inbox/:a", get(routes::messages::check_inbox1))
        .route("/api/inbox/:a/:b", get(routes::messages::check_inbox2))
        .route("/api/inbox/:a/:b/:c", get(routes::messages::check_inbox3))
        .route(
            "/api/message/:id",
            get(routes::messages::get_message).delete(routes::messages::delete_message),
        )
        .route("/api/receive/:id", post(routes::messages::receive))
        .route("/api/complete/:id", post(routes::messages::complete))
        .route("/api/approve/:id", post(routes::messages::approve))
        .route("/api/status/:id", post(routes::messages::update_status))
        .route("/api/threads", get(routes::messages::list_threads))
        .route("/api/thread/:id", get(routes::messages::get_thread))
        // Files
        .route("/api/files", post(routes::files::upload))
        .route(
            "/api/files/:id",
            get(routes::files::download).delete(routes::files::delete),
        )
        .route("/api/files/:id/meta", get(routes::files::meta))
        // Webhooks
        .route(
            "/api/webhooks",
            get(routes::webhooks::list).post(routes::webhooks::subscribe),
        )
        .route("/api/webhooks/:id", delete(routes::webhooks::unsubscribe))
        // Agents
        .route(
            "/api/agents",
            get(routes::agents::list).post(routes::agents::register),
        )
        .route(
            "/api/agents/:platform/:name",
            get(routes::agents::get)
                .put(routes::agents::update)
                .delete(routes::agents::remove),
        )
        .route("/api/agents/:platform/:name/ping", post(routes::agents::ping))
        // API keys
        .route("/api/keys", get(routes::keys::list).post(routes::keys::create))
        .route("/api/keys/:id", delete(routes::keys::revoke))
        // Audit & archive
        .route("/api/audit", get(routes::audit::query))
        .route("/api/audit/stats", get(routes::audit::stats))
        .route("/api/archive", get(routes::audit::list_archived))
        .route(
            "/api/archive/:thread_id",
            get(routes::audit::archived_thread).post(routes::audit::archive_thread),
        )
        // Admin
        .route("/api/admin/sweep", post(routes::admin::sweep))
        .route("/api/admin/reset", post(routes::admin::reset))
        // Flight recorder
        .route("/api/v1/agent/journal", post(routes::recorder::journal))
        .route("/api/v1/agent/thought", post(routes::recorder::thought))
        .route("/api/v1/agent/error", post(routes::recorder::error))
        .route("/api/v1/agent/checkpoint", post(routes::recorder::checkpoint))
        // Agent ids are `platform/name`, so agent-keyed paths take wildcards.
        .route(
            "/api/v1/agent/context/agent/*agent_id",
            get(routes::recorder::context_for_agent),
        )
        .route(
            "/api/v1/agent/context/:session_id",
            get(routes::recorder::context_for_session),
        )
        .route("/api/v1/agent/script/*agent_id", get(routes::recorder::script))
        .route("/api/v1/agent/signin", post(routes::recorder::signin))
        .route("/api/v1/agent/session/new", post(routes::recorder::session_new))
        .route("/api/v1/agent/session/close", post(routes::recorder::session_close))
        .route(
            "/api/v1/agent/session/close-all",
            post(routes::recorder::session_close_all),
        )
        .route(
            "/api/v1/agent/sessions/*agent_id",
            get(routes::recorder::sessions_for_agent),
        )
        .route_layer(middleware::from_fn_with_state(
            ctx.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .route("/api/health", get(routes::health::health))
        .merge(api)
        // Bridge surface: HMAC tokens, not API keys.
        .route("/bridge/connect", get(crate::bridge::connect_handler))
        .route("/bridge/relay", get(crate::bridge::relay_handler))
        .route("/bridge/send", post(routes::messages::bridge_send))
        .route("/bridge/agents", get(crate::bridge::agents_handler))
        .route("/bridge/status", get(crate::bridge::status_handler))
        // Protocol-adapter tool server
        .route("/mcp/sse", get(crate::mcp::sse_handler))
        .route("/mcp/messages", post(crate::mcp::messages_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Map a store error onto (status, body) using the sentinel prefix.
pub fn map_err(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    let msg = e.to_string();
    let (status, clean) = if let Some(rest) = msg.strip_prefix("NOT_FOUND:") {
        (StatusCode::NOT_FOUND, rest.to_string())
    } else if let Some(rest) = msg.strip_prefix("INVALID:") {
        (StatusCode::BAD_REQUEST, rest.to_string())
    } else if let Some(rest) = msg.strip_prefix("CONFLICT:") {
        (StatusCode::CONFLICT, rest.to_string())
    } else if let Some(rest) = msg.strip_prefix("UNAUTHORIZED:") {
        (StatusCode::UNAUTHORIZED, rest.to_string())
    } else {
        tracing::error!(err = %msg, "internal error");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    };
    (status, Json(json!({"error": clean})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_prefixes_map_to_status_codes() {
        let (status, _) = map_err(anyhow::anyhow!("NOT_FOUND:message 'x'"));
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = map_err(anyhow::anyhow!("INVALID:bad path"));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = map_err(anyhow::anyhow!("CONFLICT:dup"));
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = map_err(anyhow::anyhow!("boom"));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
