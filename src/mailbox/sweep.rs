// SPDX-License-Identifier: MIT
//
// Hourly TTL sweep. Pass one freezes completed threads that are about to
// expire into the archive; pass two drops expired messages and empty
// inboxes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{actions, archive::ThreadArchive, AuditLog};
use crate::MailboxStore;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// One sweep pass. Also callable on demand from the admin surface.
pub async fn sweep_once(
    mailbox: &MailboxStore,
    archive: &ThreadArchive,
    audit: &AuditLog,
) -> anyhow::Result<usize> {
    let now = Utc::now();

    for thread in mailbox.collect_expiring_completed_threads(now).await {
        match archive
            .archive_thread(
                &thread.thread_id,
                &thread.messages,
                json!({"reason": "ttl-expiry", "messageCount": thread.messages.len()}),
            )
            .await
        {
            Ok(_) => {
                audit
                    .emit(
                        actions::THREAD_ARCHIVE,
                        "system",
                        "thread",
                        &thread.thread_id,
                        json!({"messageCount": thread.messages.len()}),
                        Some("ttl-sweep"),
                    )
                    .await;
            }
            Err(e) => {
                // Archive failure keeps the thread alive for the next pass.
                warn!(thread_id = %thread.thread_id, err = %e, "thread archive failed — skipping expiry");
                return Err(e);
            }
        }
    }

    let dropped = mailbox.drop_expired(now).await?;
    if dropped > 0 {
        audit
            .emit(
                actions::MESSAGE_EXPIRE,
                "system",
                "mailbox",
                "*",
                json!({"dropped": dropped}),
                Some("ttl-sweep"),
            )
            .await;
        info!(dropped, "ttl sweep removed expired messages");
    }
    Ok(dropped)
}

/// Background sweep loop. Runs once at startup, then hourly, until the
/// shutdown signal flips.
pub async fn run_ttl_sweep(
    mailbox: Arc<MailboxStore>,
    archive: ThreadArchive,
    audit: AuditLog,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!("ttl sweep started (hourly)");
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = sweep_once(&mailbox, &archive, &audit).await {
                    warn!(err = %e, "ttl sweep error");
                }
            }
            _ = shutdown.changed() => {
                info!("ttl sweep stopping");
                break;
            }
        }
    }
}
