// SPDX-License-Identifier: MIT

use anyhow::Result;
use clap::{Parser, Subcommand};
use quackd::{config::DaemonConfig, AppContext};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "quackd",
    about = "Quack — agent-to-agent mailbox relay daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP/WebSocket server port
    #[arg(long, default_value_t = 8787, env = "QUACKD_PORT")]
    port: u16,

    /// Data directory for snapshots and the SQLite database
    #[arg(long, env = "QUACKD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "QUACKD_LOG")]
    log: String,

    /// Shared secret for bridge tokens and webhook signing
    #[arg(long, env = "QUACK_BRIDGE_SECRET")]
    bridge_secret: Option<String>,

    /// Grant admin to every request and accept any bridge token (dev only)
    #[arg(long, default_value_t = false, env = "QUACK_DEV_BYPASS")]
    dev_bypass: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default when no subcommand given)
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log)
        .compact()
        .init();

    match args.command {
        None | Some(Command::Serve) => {
            run_server(args).await?;
        }
    }
    Ok(())
}

async fn run_server(args: Args) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        "quackd starting"
    );
    if args.dev_bypass {
        warn!("dev bypass is enabled — every request is admin and bridge auth is open");
    }

    let config = Arc::new(DaemonConfig::new(
        args.port,
        args.data_dir,
        args.log,
        args.bridge_secret,
        args.dev_bypass,
    ));
    info!(data_dir = %config.data_dir.display(), "data directory");

    let ctx = AppContext::build(config).await?;

    // Catch up on anything that expired while the daemon was down.
    match quackd::mailbox::sweep::sweep_once(&ctx.mailbox, &ctx.archive, &ctx.audit).await {
        Ok(dropped) if dropped > 0 => info!(dropped, "startup sweep removed expired messages"),
        Ok(_) => {}
        Err(e) => warn!(err = %e, "startup sweep failed"),
    }

    // Shutdown fan-out: flipping the watch stops every loop below and the
    // HTTP server's graceful shutdown.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received — stopping background loops");
        let _ = shutdown_tx.send(true);
    });

    tokio::spawn(ctx.dispatcher.clone().run(shutdown_rx.clone()));
    tokio::spawn(quackd::mailbox::sweep::run_ttl_sweep(
        ctx.mailbox.clone(),
        ctx.archive.clone(),
        ctx.audit.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(quackd::files::run_blob_sweep(
        ctx.files.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(quackd::sessions::run_session_janitor(
        ctx.sessions.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(quackd::bridge::run_heartbeat_sweep(
        ctx.clone(),
        shutdown_rx.clone(),
    ));

    quackd::rest::start_server(ctx, shutdown_rx).await
}

/// Resolves when a shutdown signal arrives. On Unix we listen for SIGTERM
/// and Ctrl-C; elsewhere Ctrl-C only.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
