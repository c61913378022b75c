// SPDX-License-Identifier: MIT
//
// Webhook fan-out. Per-inbox subscriber lists are a JSON snapshot; send and
// approval events POST the message to every subscriber of the destination
// inbox. Auto-Wake independently pokes the destination agent's own webhook.
// All delivery is best-effort: failures bump a counter and are logged, the
// triggering operation still succeeds.

use anyhow::{bail, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crypto;
use crate::mailbox::model::Message;
use crate::registry::AgentRecord;

pub const SIGNATURE_HEADER: &str = "X-Quack-Signature";
const DELIVERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Fan-out event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEvent {
    MessageReceived,
    MessageApproved,
}

impl WebhookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookEvent::MessageReceived => "message.received",
            WebhookEvent::MessageApproved => "message.approved",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSubscriber {
    pub id: String,
    pub inbox: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<String>,
}

struct Inner {
    subscribers: Vec<WebhookSubscriber>,
    snapshot_path: PathBuf,
}

/// Cheap to clone: delivery tasks carry a handle into the shared state so
/// failure counters land back on the live subscriber list.
#[derive(Clone)]
pub struct WebhookRegistry {
    inner: Arc<Mutex<Inner>>,
    client: reqwest::Client,
}

impl WebhookRegistry {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let snapshot_path = data_dir.join("webhooks.json");
        let subscribers = match std::fs::read_to_string(&snapshot_path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(err = %e, "webhook snapshot unreadable — starting empty");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                subscribers,
                snapshot_path,
            })),
            client,
        })
    }

    // ── Subscription management ───────────────────────────────────────────────

    pub async fn subscribe(
        &self,
        inbox: &str,
        url: &str,
        secret: Option<String>,
    ) -> Result<WebhookSubscriber> {
        if url.trim().is_empty() {
            bail!("INVALID:webhook url is required");
        }
        let sub = WebhookSubscriber {
            id: Uuid::new_v4().to_string(),
            inbox: crate::mailbox::paths::normalize(inbox),
            url: url.to_string(),
            secret,
            created_at: Utc::now().to_rfc3339(),
            failure_count: 0,
            last_failure_at: None,
        };
        let mut inner = self.inner.lock().await;
        inner.subscribers.push(sub.clone());
        persist(&inner)?;
        Ok(sub)
    }

    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != id);
        if inner.subscribers.len() == before {
            bail!("NOT_FOUND:webhook '{id}'");
        }
        persist(&inner)?;
        Ok(())
    }

    pub async fn list(&self) -> Vec<WebhookSubscriber> {
        self.inner.lock().await.subscribers.clone()
    }

    async fn record_failure(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(sub) = inner.subscribers.iter_mut().find(|s| s.id == id) {
            sub.failure_count += 1;
            sub.last_failure_at = Some(Utc::now().to_rfc3339());
        }
        if let Err(e) = persist(&inner) {
            warn!(err = %e, "webhook snapshot write failed");
        }
    }

    // ── Fan-out ───────────────────────────────────────────────────────────────

    /// Queue a POST to every subscriber of the destination inbox. Returns
    /// immediately; delivery happens on spawned tasks.
    pub fn fan_out(&self, event: WebhookEvent, message: &Message) {
        let inbox = message.to.clone();
        let body = json!({
            "event": event.as_str(),
            "inbox": inbox,
            "message": message,
        });
        let registry = self.clone();
        tokio::spawn(async move {
            let targets: Vec<WebhookSubscriber> = {
                let inner = registry.inner.lock().await;
                inner
                    .subscribers
                    .iter()
                    .filter(|s| s.inbox == inbox)
                    .cloned()
                    .collect()
            };
            for sub in targets {
                registry.deliver(&sub, &body).await;
            }
        });
    }

    async fn deliver(&self, sub: &WebhookSubscriber, body: &serde_json::Value) {
        let raw = body.to_string();
        let mut req = self
            .client
            .post(&sub.url)
            .header("content-type", "application/json");
        if let Some(secret) = &sub.secret {
            req = req.header(SIGNATURE_HEADER, crypto::hmac_sha256_hex(secret, raw.as_bytes()));
        }
        match req.body(raw).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(url = %sub.url, "webhook delivered");
            }
            Ok(resp) => {
                warn!(url = %sub.url, status = %resp.status(), "webhook rejected");
                self.record_failure(&sub.id).await;
            }
            Err(e) => {
                warn!(url = %sub.url, err = %e, "webhook delivery failed");
                self.record_failure(&sub.id).await;
            }
        }
    }

    // ── Auto-Wake ─────────────────────────────────────────────────────────────

    /// Concise new-message poke to the destination agent's own webhook,
    /// independent of inbox subscribers. Log-only failures.
    pub fn auto_wake(&self, agent: &AgentRecord, message: &Message) {
        let Some(url) = agent.webhook_url.clone() else {
            return;
        };
        let task_brief: String = message.task.chars().take(200).collect();
        let body = json!({
            "event": "new_message",
            "inbox": message.to,
            "from": message.from,
            "messageId": message.id,
            "task": task_brief,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let secret = agent.webhook_secret.clone();
        let client = self.client.clone();
        let agent_id = agent.id.clone();
        tokio::spawn(async move {
            let raw = body.to_string();
            let mut req = client.post(&url).header("content-type", "application/json");
            if let Some(secret) = &secret {
                req = req.header(SIGNATURE_HEADER, crypto::hmac_sha256_hex(secret, raw.as_bytes()));
            }
            match req.body(raw).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(agent = %agent_id, "auto-wake delivered");
                }
                Ok(resp) => {
                    warn!(agent = %agent_id, status = %resp.status(), "auto-wake rejected");
                }
                Err(e) => {
                    warn!(agent = %agent_id, err = %e, "auto-wake failed");
                }
            }
        });
    }
}

fn persist(inner: &Inner) -> Result<()> {
    let raw = serde_json::to_string_pretty(&inner.subscribers)?;
    if let Some(dir) = inner.snapshot_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = inner.snapshot_path.with_extension("json.tmp");
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, &inner.snapshot_path)?;
    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> WebhookRegistry {
        let dir = tempfile::tempdir().unwrap().keep();
        WebhookRegistry::load(&dir).unwrap()
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe_round_trip() {
        let reg = registry();
        let sub = reg
            .subscribe("/Replit/Main", "http://localhost:9/hook", None)
            .await
            .unwrap();
        assert_eq!(sub.inbox, "replit/main");
        assert_eq!(reg.list().await.len(), 1);
        reg.unsubscribe(&sub.id).await.unwrap();
        assert!(reg.list().await.is_empty());
        assert!(reg.unsubscribe(&sub.id).await.is_err());
    }

    #[tokio::test]
    async fn failures_increment_counter_without_unsubscribing() {
        let reg = registry();
        let sub = reg
            .subscribe("replit/main", "http://localhost:9/hook", None)
            .await
            .unwrap();
        reg.record_failure(&sub.id).await;
        reg.record_failure(&sub.id).await;
        let subs = reg.list().await;
        assert_eq!(subs[0].failure_count, 2);
        assert!(subs[0].last_failure_at.is_some());
    }

    #[tokio::test]
    async fn subscribers_survive_reload() {
        let dir = tempfile::tempdir().unwrap().keep();
        let reg = WebhookRegistry::load(&dir).unwrap();
        reg.subscribe("replit/main", "http://localhost:9/hook", Some("s".into()))
            .await
            .unwrap();
        drop(reg);
        let reloaded = WebhookRegistry::load(&dir).unwrap();
        let subs = reloaded.list().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].secret.as_deref(), Some("s"));
    }
}
