// SPDX-License-Identifier: MIT
//
// Conversation session registry. Tracks turn-taking state between two
// agents sharing a thread. Sessions live in a JSON snapshot; a janitor
// abandons expired ones and discards old terminal ones.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::mailbox::model::ControlType;
use crate::mailbox::paths;

/// Inactivity window after which an active session is abandoned.
const SESSION_TTL_HOURS: i64 = 24;
/// Terminal sessions older than this are discarded by the janitor.
const RETENTION_DAYS: i64 = 7;
const JANITOR_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    AwaitingReply,
    AwaitingHuman,
    Completed,
    Abandoned,
}

impl ConversationStatus {
    fn is_terminal(self) -> bool {
        matches!(self, ConversationStatus::Completed | ConversationStatus::Abandoned)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSession {
    pub key: String,
    pub participants: Vec<String>,
    pub status: ConversationStatus,
    /// The agent whose turn it is to act.
    pub current_turn: String,
    pub turn_count: u32,
    pub message_count: u32,
    pub started_at: String,
    pub last_message_at: String,
    pub expires_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Structured key: `agent:<from>:to:<to>:thread:<threadId>` with both
/// identifiers normalized.
pub fn session_key(from: &str, to: &str, thread_id: &str) -> String {
    format!(
        "agent:{}:to:{}:thread:{}",
        paths::normalize(from),
        paths::normalize(to),
        thread_id
    )
}

struct Inner {
    sessions: BTreeMap<String, ConversationSession>,
    snapshot_path: PathBuf,
}

pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let snapshot_path = data_dir.join("sessions.json");
        let sessions = match std::fs::read_to_string(&snapshot_path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(err = %e, "session snapshot unreadable — starting empty");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Ok(Self {
            inner: Mutex::new(Inner {
                sessions,
                snapshot_path,
            }),
        })
    }

    /// Bookkeeping for one sent message: create or refresh the session,
    /// bump counters, swap the turn, and apply any control consequence.
    pub async fn on_message(
        &self,
        from: &str,
        to: &str,
        thread_id: &str,
        control: Option<ControlType>,
    ) -> Result<ConversationSession> {
        let from = paths::normalize(from);
        let to = paths::normalize(to);
        let key = session_key(&from, &to, thread_id);
        let now = Utc::now();

        let mut inner = self.inner.lock().await;
        let session = inner.sessions.entry(key.clone()).or_insert_with(|| {
            ConversationSession {
                key: key.clone(),
                participants: vec![from.clone(), to.clone()],
                status: ConversationStatus::Active,
                // A fresh conversation waits on the recipient.
                current_turn: to.clone(),
                turn_count: 0,
                message_count: 0,
                started_at: now.to_rfc3339(),
                last_message_at: now.to_rfc3339(),
                expires_at: (now + Duration::hours(SESSION_TTL_HOURS)).to_rfc3339(),
                completed_at: None,
            }
        });

        session.message_count += 1;
        session.last_message_at = now.to_rfc3339();
        session.expires_at = (now + Duration::hours(SESSION_TTL_HOURS)).to_rfc3339();
        for participant in [&from, &to] {
            if !session.participants.contains(participant) {
                session.participants.push(participant.clone());
            }
        }
        if session.current_turn == from {
            session.current_turn = to.clone();
            session.turn_count += 1;
        }

        match control {
            Some(ControlType::ConversationEnd) => {
                session.status = ConversationStatus::Completed;
                session.completed_at = Some(now.to_rfc3339());
            }
            Some(ControlType::ReplySkip) => {
                session.status = ConversationStatus::AwaitingReply;
            }
            Some(ControlType::AnnounceSkip) | None => {}
        }

        let out = session.clone();
        persist(&inner)?;
        Ok(out)
    }

    pub async fn get(&self, key: &str) -> Option<ConversationSession> {
        self.inner.lock().await.sessions.get(key).cloned()
    }

    pub async fn list(&self) -> Vec<ConversationSession> {
        self.inner.lock().await.sessions.values().cloned().collect()
    }

    /// Mark a session as awaiting a human decision (held approvals).
    pub async fn mark_awaiting_human(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get_mut(key) {
            if !session.status.is_terminal() {
                session.status = ConversationStatus::AwaitingHuman;
            }
            persist(&inner)?;
        }
        Ok(())
    }

    /// Janitor pass: expire stale active sessions, discard old terminal
    /// ones. Returns (abandoned, discarded).
    pub async fn janitor_pass(&self, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let mut inner = self.inner.lock().await;
        let mut abandoned = 0;

        for session in inner.sessions.values_mut() {
            if session.status.is_terminal() {
                continue;
            }
            let expired = DateTime::parse_from_rfc3339(&session.expires_at)
                .map(|t| t.with_timezone(&Utc) <= now)
                .unwrap_or(false);
            if expired {
                session.status = ConversationStatus::Abandoned;
                session.completed_at = Some(now.to_rfc3339());
                abandoned += 1;
            }
        }

        let cutoff = now - Duration::days(RETENTION_DAYS);
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| {
            if !s.status.is_terminal() {
                return true;
            }
            let reference = s.completed_at.as_deref().unwrap_or(&s.last_message_at);
            DateTime::parse_from_rfc3339(reference)
                .map(|t| t.with_timezone(&Utc) > cutoff)
                .unwrap_or(false)
        });
        let discarded = before - inner.sessions.len();

        if abandoned > 0 || discarded > 0 {
            persist(&inner)?;
        }
        Ok((abandoned, discarded))
    }
}

fn persist(inner: &Inner) -> Result<()> {
    let raw = serde_json::to_string_pretty(&inner.sessions)?;
    if let Some(dir) = inner.snapshot_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = inner.snapshot_path.with_extension("json.tmp");
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, &inner.snapshot_path)?;
    Ok(())
}

/// 15-minute janitor loop.
pub async fn run_session_janitor(
    sessions: Arc<SessionRegistry>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!("session janitor started (15m interval)");
    let mut interval = tokio::time::interval(JANITOR_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match sessions.janitor_pass(Utc::now()).await {
                    Ok((a, d)) if a > 0 || d > 0 => {
                        info!(abandoned = a, discarded = d, "session janitor pass");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(err = %e, "session janitor error"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
