// SPDX-License-Identifier: MIT
//
// Mailbox store — named inboxes holding messages with a strict lifecycle
// state machine, TTL expiry, and thread reconstruction. All reads and writes
// go through one mutex; the append + snapshot-write pair happens under the
// lock so no caller observes an inbox between the two.

pub mod model;
pub mod paths;
pub mod sweep;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use model::{ControlType, Message, MessageFile, MessageStatus, Priority, RoutingMode};

// ─── Send request ─────────────────────────────────────────────────────────────

/// Caller-supplied fields for a new message. REST, bridge, and the tool
/// server all funnel through this.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub to: String,
    pub from: String,
    pub task: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub files: Vec<MessageFile>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub conversation_excerpt: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub routing: Option<RoutingMode>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Unconditionally forces the initial status to `pending`.
    #[serde(default)]
    pub require_approval: Option<bool>,
    /// Internal callers (bridge fallback, relay) imply project metadata so
    /// single-segment platform inboxes validate. Never set from the wire.
    #[serde(skip)]
    pub path_metadata_implied: bool,
}

/// Result of a successful send, including side effects the caller needs for
/// auditing and fan-out.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    /// Parent message id that was auto-completed by this reply, if any.
    pub completed_parent: Option<String>,
}

/// A completed thread that is about to be dropped by the sweep. The caller
/// archives it before calling `drop_expired`.
#[derive(Debug, Clone)]
pub struct ExpiringThread {
    pub thread_id: String,
    pub messages: Vec<Message>,
}

// ─── Store ────────────────────────────────────────────────────────────────────

struct Inner {
    /// Inbox path → messages in arrival order.
    inboxes: BTreeMap<String, Vec<Message>>,
    snapshot_path: PathBuf,
}

pub struct MailboxStore {
    inner: Mutex<Inner>,
}

impl MailboxStore {
    /// Load the snapshot from `data_dir/mailbox.json`, or start empty.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let snapshot_path = data_dir.join("mailbox.json");
        let inboxes = match std::fs::read_to_string(&snapshot_path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(err = %e, "mailbox snapshot unreadable — starting empty");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Ok(Self {
            inner: Mutex::new(Inner {
                inboxes,
                snapshot_path,
            }),
        })
    }

    // ── Send ──────────────────────────────────────────────────────────────────

    /// Create a message. `policy_approve` is the routing-policy decision for
    /// the (from, to) pair; `require_approval` on the request overrides it.
    pub async fn send(&self, req: SendRequest, policy_approve: bool) -> Result<SendOutcome> {
        let routing = req.routing.unwrap_or_default();

        // Cowork routing may override the destination inbox.
        let (raw_dest, cowork_status) = match (routing, &req.destination) {
            (RoutingMode::Cowork, Some(dest)) => (dest.clone(), Some("routed".to_string())),
            (RoutingMode::Cowork, None) => (req.to.clone(), Some("direct".to_string())),
            _ => (req.to.clone(), None),
        };
        let inbox = paths::normalize(&raw_dest);
        let has_meta =
            req.project.is_some() || req.project_name.is_some() || req.path_metadata_implied;
        paths::validate(&inbox, has_meta)?;

        if req.task.trim().is_empty() {
            bail!("INVALID:task text is required");
        }
        if req.from.trim().is_empty() {
            bail!("INVALID:from is required");
        }

        let mut msg = Message::new(inbox.clone(), paths::normalize(&req.from), req.task);
        msg.context = req.context;
        msg.files = req.files;
        msg.project = req.project;
        msg.project_name = req.project_name;
        msg.conversation_excerpt = req.conversation_excerpt;
        msg.priority = req.priority;
        msg.tags = req.tags;
        msg.routing = routing;
        msg.destination = req.destination;
        msg.cowork_status = cowork_status;
        msg.reply_to = req.reply_to.clone();
        msg.routed_at = Some(Utc::now().to_rfc3339());

        // Control messages affect conversation state, not work.
        if let Some(ct) = ControlType::from_task(&msg.task) {
            msg.is_control_message = Some(true);
            msg.control_type = Some(ct);
            if ct == ControlType::ConversationEnd {
                msg.thread_status = Some("completed".to_string());
            }
        }

        msg.status = match req.require_approval {
            Some(true) => MessageStatus::Pending,
            _ if policy_approve => MessageStatus::Approved,
            _ => MessageStatus::Pending,
        };

        let mut inner = self.inner.lock().await;

        // Threading: resolve the parent, inherit its thread, bump its reply
        // count, and auto-complete it if still actionable.
        let mut completed_parent = None;
        if let Some(parent_id) = &req.reply_to {
            let parent = find_mut(&mut inner.inboxes, parent_id)
                .ok_or_else(|| anyhow::anyhow!("NOT_FOUND:reply target '{parent_id}'"))?;
            msg.thread_id = parent.thread_id.clone();
            parent.reply_count += 1;
            if parent.status.is_actionable() {
                parent.status = MessageStatus::Completed;
                completed_parent = Some(parent.id.clone());
            }
        }

        if msg.control_type == Some(ControlType::ConversationEnd) {
            let thread_id = msg.thread_id.clone();
            for list in inner.inboxes.values_mut() {
                for m in list.iter_mut().filter(|m| m.thread_id == thread_id) {
                    m.thread_status = Some("completed".to_string());
                }
            }
        }

        inner.inboxes.entry(inbox).or_default().push(msg.clone());
        persist(&inner)?;
        debug!(id = %msg.id, to = %msg.to, status = msg.status.as_str(), "message stored");

        Ok(SendOutcome {
            message: msg,
            completed_parent,
        })
    }

    // ── Check ─────────────────────────────────────────────────────────────────

    /// Return an inbox's messages. Default view is actionable statuses only;
    /// `include_terminal` returns everything. With `auto_approve`, pending
    /// messages transition to approved before being returned; the approved
    /// ids come back for auditing.
    pub async fn check_inbox(
        &self,
        path: &str,
        include_terminal: bool,
        auto_approve: bool,
    ) -> Result<(Vec<Message>, Vec<String>)> {
        let inbox = paths::normalize(path);
        paths::validate(&inbox, true)?;

        let mut inner = self.inner.lock().await;
        let mut approved_ids = Vec::new();

        if auto_approve {
            if let Some(list) = inner.inboxes.get_mut(&inbox) {
                for m in list.iter_mut() {
                    if m.status == MessageStatus::Pending {
                        m.status = MessageStatus::Approved;
                        approved_ids.push(m.id.clone());
                    }
                }
            }
            if !approved_ids.is_empty() {
                persist(&inner)?;
            }
        }

        let messages = inner
            .inboxes
            .get(&inbox)
            .map(|list| {
                list.iter()
                    .filter(|m| include_terminal || m.status.is_actionable())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok((messages, approved_ids))
    }

    // ── Lookups ───────────────────────────────────────────────────────────────

    pub async fn get_message(&self, id: &str) -> Result<Message> {
        let inner = self.inner.lock().await;
        find(&inner.inboxes, id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("NOT_FOUND:message '{id}'"))
    }

    /// Every message whose `thread_id` or `id` matches the key, timestamp
    /// ascending with ties broken by id.
    pub async fn get_thread(&self, key: &str) -> Vec<Message> {
        let inner = self.inner.lock().await;
        let mut out: Vec<Message> = inner
            .inboxes
            .values()
            .flatten()
            .filter(|m| m.thread_id == key || m.id == key)
            .cloned()
            .collect();
        sort_thread(&mut out);
        out
    }

    /// All threads, each sorted ascending, ordered by latest activity
    /// descending.
    pub async fn list_threads(&self) -> Vec<Vec<Message>> {
        let inner = self.inner.lock().await;
        let mut groups: BTreeMap<String, Vec<Message>> = BTreeMap::new();
        for m in inner.inboxes.values().flatten() {
            groups.entry(m.thread_id.clone()).or_default().push(m.clone());
        }
        let mut threads: Vec<Vec<Message>> = groups.into_values().collect();
        for t in threads.iter_mut() {
            sort_thread(t);
        }
        threads.sort_by(|a, b| {
            let la = a.last().map(|m| m.timestamp.clone()).unwrap_or_default();
            let lb = b.last().map(|m| m.timestamp.clone()).unwrap_or_default();
            lb.cmp(&la)
        });
        threads
    }

    /// Every message currently in `status`, across all inboxes. The
    /// dispatcher polls this for approved work.
    pub async fn messages_with_status(&self, status: MessageStatus) -> Vec<Message> {
        let inner = self.inner.lock().await;
        inner
            .inboxes
            .values()
            .flatten()
            .filter(|m| m.status == status)
            .cloned()
            .collect()
    }

    pub async fn inbox_count(&self) -> usize {
        self.inner.lock().await.inboxes.len()
    }

    pub async fn message_count(&self) -> usize {
        self.inner.lock().await.inboxes.values().map(Vec::len).sum()
    }

    // ── Transitions ───────────────────────────────────────────────────────────

    /// Consult the transition table and move the message to `target`.
    pub async fn update_status(&self, id: &str, target: MessageStatus) -> Result<Message> {
        let mut inner = self.inner.lock().await;
        let msg = find_mut(&mut inner.inboxes, id)
            .ok_or_else(|| anyhow::anyhow!("NOT_FOUND:message '{id}'"))?;
        if !msg.status.can_transition_to(target) {
            bail!(
                "INVALID:illegal transition {} -> {} for message '{id}'",
                msg.status.as_str(),
                target.as_str()
            );
        }
        msg.status = target;
        let out = msg.clone();
        persist(&inner)?;
        Ok(out)
    }

    /// Approve a held message. Enforces that the source state is `pending`;
    /// approving anything else is a conflict.
    pub async fn approve(&self, id: &str) -> Result<Message> {
        let mut inner = self.inner.lock().await;
        let msg = find_mut(&mut inner.inboxes, id)
            .ok_or_else(|| anyhow::anyhow!("NOT_FOUND:message '{id}'"))?;
        if msg.status != MessageStatus::Pending {
            bail!(
                "CONFLICT:cannot approve message '{id}' in status {}",
                msg.status.as_str()
            );
        }
        msg.status = MessageStatus::Approved;
        let out = msg.clone();
        persist(&inner)?;
        Ok(out)
    }

    /// Mark a message completed (assumes the in-progress → completed edge).
    pub async fn complete(&self, id: &str) -> Result<Message> {
        self.update_status(id, MessageStatus::Completed).await
    }

    /// Stamp `read_at`. Status moves to `read` only while the message is
    /// still pending or approved; later states keep their status.
    pub async fn mark_read(&self, id: &str) -> Result<Message> {
        let mut inner = self.inner.lock().await;
        let msg = find_mut(&mut inner.inboxes, id)
            .ok_or_else(|| anyhow::anyhow!("NOT_FOUND:message '{id}'"))?;
        msg.read_at = Some(Utc::now().to_rfc3339());
        if matches!(msg.status, MessageStatus::Pending | MessageStatus::Approved) {
            msg.status = MessageStatus::Read;
        }
        let out = msg.clone();
        persist(&inner)?;
        Ok(out)
    }

    pub async fn delete(&self, id: &str) -> Result<Message> {
        let mut inner = self.inner.lock().await;
        let mut removed = None;
        inner.inboxes.retain(|_, list| {
            if removed.is_none() {
                if let Some(pos) = list.iter().position(|m| m.id == id) {
                    removed = Some(list.remove(pos));
                }
            }
            !list.is_empty()
        });
        let msg = removed.ok_or_else(|| anyhow::anyhow!("NOT_FOUND:message '{id}'"))?;
        persist(&inner)?;
        Ok(msg)
    }

    // ── TTL sweep ─────────────────────────────────────────────────────────────

    /// First sweep pass: completed threads whose messages are about to
    /// expire, frozen for archival before `drop_expired` removes them.
    pub async fn collect_expiring_completed_threads(
        &self,
        now: DateTime<Utc>,
    ) -> Vec<ExpiringThread> {
        let inner = self.inner.lock().await;
        let mut thread_ids: Vec<String> = inner
            .inboxes
            .values()
            .flatten()
            .filter(|m| m.status == MessageStatus::Completed && m.is_expired_at(now))
            .map(|m| m.thread_id.clone())
            .collect();
        thread_ids.sort();
        thread_ids.dedup();

        thread_ids
            .into_iter()
            .map(|thread_id| {
                let mut messages: Vec<Message> = inner
                    .inboxes
                    .values()
                    .flatten()
                    .filter(|m| m.thread_id == thread_id)
                    .cloned()
                    .collect();
                sort_thread(&mut messages);
                ExpiringThread {
                    thread_id,
                    messages,
                }
            })
            .collect()
    }

    /// Second sweep pass: drop every expired message and any inbox that
    /// becomes empty. Returns the number of messages removed.
    pub async fn drop_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let before: usize = inner.inboxes.values().map(Vec::len).sum();
        inner.inboxes.retain(|_, list| {
            list.retain(|m| !m.is_expired_at(now));
            !list.is_empty()
        });
        let after: usize = inner.inboxes.values().map(Vec::len).sum();
        if before != after {
            persist(&inner)?;
        }
        Ok(before - after)
    }

    /// Drop all state (admin/test hook).
    pub async fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.inboxes.clear();
        persist(&inner)?;
        Ok(())
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn find<'a>(inboxes: &'a BTreeMap<String, Vec<Message>>, id: &str) -> Option<&'a Message> {
    inboxes.values().flatten().find(|m| m.id == id)
}

fn find_mut<'a>(
    inboxes: &'a mut BTreeMap<String, Vec<Message>>,
    id: &str,
) -> Option<&'a mut Message> {
    inboxes.values_mut().flatten().find(|m| m.id == id)
}

fn sort_thread(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Snapshot write: serialize the full inbox map and rename into place so a
/// crash mid-write never corrupts the store.
fn persist(inner: &Inner) -> Result<()> {
    let raw = serde_json::to_string_pretty(&inner.inboxes)?;
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

    fn store() -> MailboxStore {
        let dir = tempfile::tempdir().unwrap().keep();
        MailboxStore::load(&dir).unwrap()
    }

    fn req(to: &str, from: &str, task: &str) -> SendRequest {
        SendRequest {
            to: to.to_string(),
            from: from.to_string(),
            task: task.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn send_then_check_returns_message_in_order() {
        let store = store();
        let a = store.send(req("replit/main", "cursor/dev", "one"), true).await.unwrap();
        let b = store.send(req("replit/main", "cursor/dev", "two"), true).await.unwrap();
        let (msgs, _) = store.check_inbox("replit/main", false, false).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].id, a.message.id);
        assert_eq!(msgs[1].id, b.message.id);
    }

    #[tokio::test]
    async fn require_approval_overrides_policy() {
        let store = store();
        let mut r = req("replit/main", "cursor/dev", "deploy");
        r.require_approval = Some(true);
        let out = store.send(r, true).await.unwrap();
        assert_eq!(out.message.status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn reply_inherits_thread_and_completes_parent() {
        let store = store();
        let root = store.send(req("replit/main", "cursor/dev", "do it"), true).await.unwrap();
        let mut r = req("cursor/dev", "replit/main", "done");
        r.reply_to = Some(root.message.id.clone());
        let reply = store.send(r, true).await.unwrap();

        assert_eq!(reply.message.thread_id, root.message.id);
        assert_eq!(reply.completed_parent.as_deref(), Some(root.message.id.as_str()));
        let parent = store.get_message(&root.message.id).await.unwrap();
        assert_eq!(parent.status, MessageStatus::Completed);
        assert_eq!(parent.reply_count, 1);
    }

    #[tokio::test]
    async fn reply_to_missing_parent_is_rejected() {
        let store = store();
        let mut r = req("replit/main", "cursor/dev", "hello");
        r.reply_to = Some("nope".to_string());
        let err = store.send(r, true).await.unwrap_err();
        assert!(err.to_string().starts_with("NOT_FOUND:"));
    }

    #[tokio::test]
    async fn conversation_end_marks_thread_completed() {
        let store = store();
        let out = store
            .send(req("replit/main", "cursor/dev", "CONVERSATION_END"), true)
            .await
            .unwrap();
        assert_eq!(out.message.is_control_message, Some(true));
        assert_eq!(out.message.control_type, Some(ControlType::ConversationEnd));
        assert_eq!(out.message.thread_status.as_deref(), Some("completed"));
    }

    #[tokio::test]
    async fn approve_rejects_non_pending() {
        let store = store();
        let out = store.send(req("replit/main", "cursor/dev", "x"), true).await.unwrap();
        // Already approved by policy.
        let err = store.approve(&out.message.id).await.unwrap_err();
        assert!(err.to_string().starts_with("CONFLICT:"), "{err}");
    }

    #[tokio::test]
    async fn update_status_enforces_transition_table() {
        let store = store();
        let out = store.send(req("replit/main", "cursor/dev", "x"), false).await.unwrap();
        // pending -> completed is not in the table.
        let err = store
            .update_status(&out.message.id, MessageStatus::Completed)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("INVALID:"));
        // pending -> approved -> in_progress -> completed is.
        store.update_status(&out.message.id, MessageStatus::Approved).await.unwrap();
        store.update_status(&out.message.id, MessageStatus::InProgress).await.unwrap();
        let m = store.update_status(&out.message.id, MessageStatus::Completed).await.unwrap();
        assert_eq!(m.status, MessageStatus::Completed);
    }

    #[tokio::test]
    async fn auto_approve_on_check_promotes_pending() {
        let store = store();
        store.send(req("claude/web", "replit/dev", "review"), false).await.unwrap();
        let (msgs, approved) = store.check_inbox("claude/web", false, true).await.unwrap();
        assert_eq!(approved.len(), 1);
        assert!(msgs.iter().all(|m| m.status != MessageStatus::Pending));
    }

    #[tokio::test]
    async fn terminal_messages_hidden_without_include_terminal() {
        let store = store();
        let out = store.send(req("replit/main", "cursor/dev", "x"), true).await.unwrap();
        store.update_status(&out.message.id, MessageStatus::InProgress).await.unwrap();
        store.complete(&out.message.id).await.unwrap();
        let (visible, _) = store.check_inbox("replit/main", false, false).await.unwrap();
        assert!(visible.is_empty());
        let (all, _) = store.check_inbox("replit/main", true, false).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn sweep_archives_completed_threads_then_drops() {
        let store = store();
        let out = store.send(req("replit/main", "cursor/dev", "x"), true).await.unwrap();
        store.update_status(&out.message.id, MessageStatus::InProgress).await.unwrap();
        store.complete(&out.message.id).await.unwrap();

        // Not expired yet: nothing to collect or drop.
        let now = Utc::now();
        assert!(store.collect_expiring_completed_threads(now).await.is_empty());
        assert_eq!(store.drop_expired(now).await.unwrap(), 0);

        // One second past expiry: archived then gone.
        let later = now + chrono::Duration::hours(48) + chrono::Duration::seconds(1);
        let expiring = store.collect_expiring_completed_threads(later).await;
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].messages.len(), 1);
        assert_eq!(store.drop_expired(later).await.unwrap(), 1);
        assert_eq!(store.inbox_count().await, 0);
    }

    #[tokio::test]
    async fn thread_view_orders_by_timestamp() {
        let store = store();
        let root = store.send(req("replit/main", "cursor/dev", "root"), true).await.unwrap();
        let mut r = req("cursor/dev", "replit/main", "reply");
        r.reply_to = Some(root.message.id.clone());
        store.send(r, true).await.unwrap();

        let thread = store.get_thread(&root.message.id).await;
        assert_eq!(thread.len(), 2);
        assert!(thread[0].timestamp <= thread[1].timestamp);

        let threads = store.list_threads().await;
        assert_eq!(threads.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_survives_reload() {
        let dir = tempfile::tempdir().unwrap().keep();
        let store = MailboxStore::load(&dir).unwrap();
        let out = store.send(req("replit/main", "cursor/dev", "persist me"), true).await.unwrap();
        drop(store);

        let reloaded = MailboxStore::load(&dir).unwrap();
        let m = reloaded.get_message(&out.message.id).await.unwrap();
        assert_eq!(m.task, "persist me");
    }

    #[tokio::test]
    async fn cowork_routing_respects_destination_override() {
        let store = store();
        let mut r = req("claude/web", "cursor/dev", "pair on this");
        r.routing = Some(RoutingMode::Cowork);
        r.destination = Some("replit/main".to_string());
        let out = store.send(r, true).await.unwrap();
        assert_eq!(out.message.to, "replit/main");
        let (msgs, _) = store.check_inbox("replit/main", false, false).await.unwrap();
        assert_eq!(msgs.len(), 1);
    }
}
