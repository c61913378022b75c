// SPDX-License-Identifier: MIT
//
// Dispatcher — the poll-and-push worker. Every poll it scans for approved
// messages whose destination platform is a webhook-mode agent with a base
// URL, marks them in-progress, and POSTs the task payload to the agent.
// Completion is reported later by the receiver; a failed POST does not
// revert the message.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::audit::{actions, AuditLog};
use crate::mailbox::model::{Message, MessageStatus};
use crate::mailbox::paths;
use crate::registry::{AgentRegistry, NotifyMode};
use crate::MailboxStore;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Dispatcher {
    mailbox: Arc<MailboxStore>,
    registry: AgentRegistry,
    audit: AuditLog,
    client: reqwest::Client,
    /// Ids currently being dispatched; dedupes overlapping polls.
    in_flight: Mutex<HashSet<String>>,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        mailbox: Arc<MailboxStore>,
        registry: AgentRegistry,
        audit: AuditLog,
        poll_interval_secs: u64,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            mailbox,
            registry,
            audit,
            client: reqwest::Client::builder().timeout(DELIVERY_TIMEOUT).build()?,
            in_flight: Mutex::new(HashSet::new()),
            poll_interval: Duration::from_secs(poll_interval_secs.max(1)),
        })
    }

    /// The poll loop. Runs until shutdown; waits for in-flight dispatches to
    /// finish before returning because dispatch happens inline per cycle.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = self.poll_interval.as_secs(), "dispatcher started");
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(err = %e, "dispatcher poll error");
                    }
                }
                _ = shutdown.changed() => {
                    info!("dispatcher stopping");
                    break;
                }
            }
        }
    }

    /// One poll cycle: dispatch every approved message addressed to a
    /// webhook agent. Returns the number of dispatch attempts.
    pub async fn poll_once(&self) -> anyhow::Result<usize> {
        let approved = self.mailbox.messages_with_status(MessageStatus::Approved).await;
        let mut attempts = 0;
        for msg in approved {
            if self.dispatch_message(&msg).await? {
                attempts += 1;
            }
        }
        Ok(attempts)
    }

    /// Explicit single-message dispatch (e.g. right after an approval).
    pub async fn dispatch_now(&self, id: &str) -> anyhow::Result<bool> {
        let msg = self.mailbox.get_message(id).await?;
        if msg.status != MessageStatus::Approved {
            return Ok(false);
        }
        self.dispatch_message(&msg).await
    }

    /// Returns Ok(true) when a POST was attempted for this message.
    async fn dispatch_message(&self, msg: &Message) -> anyhow::Result<bool> {
        let Some(agent) = self.registry.find_by_platform(paths::root(&msg.to)).await? else {
            return Ok(false);
        };
        if agent.notify_mode != NotifyMode::Webhook {
            return Ok(false);
        }
        let Some(base_url) = agent.webhook_url.clone() else {
            return Ok(false);
        };

        // Claim the id; a concurrent poll that already holds it wins.
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(msg.id.clone()) {
                return Ok(false);
            }
        }

        let result = self.push_task(msg, &base_url).await;
        self.in_flight.lock().await.remove(&msg.id);
        result?;
        Ok(true)
    }

    async fn push_task(&self, msg: &Message, base_url: &str) -> anyhow::Result<()> {
        // The message may have been approved-then-mutated between the scan
        // and the claim; re-check via the state machine.
        let msg = match self.mailbox.update_status(&msg.id, MessageStatus::InProgress).await {
            Ok(m) => m,
            Err(e) => {
                debug!(id = %msg.id, err = %e, "message no longer dispatchable");
                return Ok(());
            }
        };
        self.audit
            .emit(
                actions::MESSAGE_STATUS,
                "system",
                "message",
                &msg.id,
                json!({"from": "approved", "to": "in_progress"}),
                Some("dispatcher"),
            )
            .await;

        let url = format!("{}/api/task", base_url.trim_end_matches('/'));
        let payload = json!({
            "messageId": msg.id,
            "task": msg.task,
            "context": msg.context,
            "from": msg.from,
            "to": msg.to,
            "files": msg.files,
            "timestamp": Utc::now().to_rfc3339(),
        });

        match self.client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(id = %msg.id, url = %url, "task dispatched");
            }
            Ok(resp) => {
                // The receiver reports completion (or failure) later via
                // the status API; do not revert here.
                warn!(id = %msg.id, url = %url, status = %resp.status(), "task dispatch rejected");
            }
            Err(e) => {
                warn!(id = %msg.id, url = %url, err = %e, "task dispatch failed");
            }
        }
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
