// SPDX-License-Identifier: MIT
//! Shared test harness: spins up a real quackd server on a free port over a
//! temporary data directory.

use quackd::{config::DaemonConfig, AppContext};
use std::sync::Arc;

pub const TEST_BRIDGE_SECRET: &str = "test-bridge-secret";

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server and return (base_url, ctx). With `dev_bypass` the API is
/// open; without it every `/api` call needs a key.
pub async fn start_server(dev_bypass: bool) -> (String, Arc<AppContext>) {
    let data_dir = tempfile::tempdir().unwrap().keep();
    let port = free_port();
    let config = Arc::new(DaemonConfig::new(
        port,
        Some(data_dir),
        "warn".to_string(),
        Some(TEST_BRIDGE_SECRET.to_string()),
        dev_bypass,
    ));
    let ctx = AppContext::build(config).await.unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    // Keep the sender alive for the process lifetime so the server never
    // sees a closed shutdown channel.
    std::mem::forget(shutdown_tx);

    let server_ctx = ctx.clone();
    tokio::spawn(async move {
        quackd::rest::start_server(server_ctx, shutdown_rx).await.ok();
    });

    // Give the listener a moment to bind.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    (format!("http://127.0.0.1:{port}"), ctx)
}
