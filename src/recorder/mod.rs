// SPDX-License-Identifier: MIT
//
// Flight Recorder — a durable journal of per-agent thoughts, checkpoints,
// and errors, grouped into sessions. Independent of the mailbox; keyed by
// agent id. Its primary output is the resumption prompt in `context.rs`.

pub mod context;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

/// A session stays eligible for new entries for this long after its last
/// activity; beyond it a fresh session is created.
const SESSION_ACTIVITY_WINDOW_HOURS: i64 = 24;

// ─── Model ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    #[serde(rename = "THOUGHT")]
    Thought,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "CHECKPOINT")]
    Checkpoint,
    #[serde(rename = "MESSAGE")]
    Message,
}

impl EntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryType::Thought => "THOUGHT",
            EntryType::Error => "ERROR",
            EntryType::Checkpoint => "CHECKPOINT",
            EntryType::Message => "MESSAGE",
        }
    }
}

impl std::str::FromStr for EntryType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "THOUGHT" => Ok(EntryType::Thought),
            "ERROR" => Ok(EntryType::Error),
            "CHECKPOINT" => Ok(EntryType::Checkpoint),
            "MESSAGE" => Ok(EntryType::Message),
            other => Err(anyhow::anyhow!("INVALID:unknown entry type '{other}'")),
        }
    }
}

/// Point-in-time working state attached to an entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_file_edited: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking_issue: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_decisions: Vec<String>,
    /// Free-form agent state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub timestamp: String,
    pub entry_type: EntryType,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_snapshot: Option<ContextSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderSession {
    pub id: String,
    pub agent_id: String,
    pub created_at: String,
    pub last_activity: String,
    pub entry_count: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SessionRow {
    id: String,
    agent_id: String,
    created_at: String,
    last_activity: String,
    entry_count: i64,
    is_active: i64,
}

impl From<SessionRow> for RecorderSession {
    fn from(r: SessionRow) -> RecorderSession {
        RecorderSession {
            id: r.id,
            agent_id: r.agent_id,
            created_at: r.created_at,
            last_activity: r.last_activity,
            entry_count: r.entry_count,
            is_active: r.is_active != 0,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct EntryRow {
    id: String,
    session_id: String,
    agent_id: String,
    timestamp: String,
    entry_type: String,
    content: String,
    context_snapshot: Option<String>,
    target_agent: Option<String>,
    tags: Option<String>,
}

impl TryFrom<EntryRow> for JournalEntry {
    type Error = anyhow::Error;

    fn try_from(r: EntryRow) -> Result<JournalEntry> {
        Ok(JournalEntry {
            id: r.id,
            session_id: r.session_id,
            agent_id: r.agent_id,
            timestamp: r.timestamp,
            entry_type: r.entry_type.parse()?,
            content: serde_json::from_str(&r.content).unwrap_or(Value::Null),
            context_snapshot: r.context_snapshot.and_then(|s| serde_json::from_str(&s).ok()),
            target_agent: r.target_agent,
            tags: r.tags.and_then(|t| serde_json::from_str(&t).ok()),
        })
    }
}

/// Caller-supplied fields for a new journal entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEntry {
    pub agent_id: String,
    pub entry_type: EntryType,
    pub content: Value,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub context_snapshot: Option<ContextSnapshot>,
    #[serde(default)]
    pub target_agent: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

// ─── Recorder ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct FlightRecorder {
    pool: SqlitePool,
}

impl FlightRecorder {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an entry, resolving (or creating) its session and bumping the
    /// session's activity counters.
    pub async fn save_entry(&self, entry: NewEntry) -> Result<JournalEntry> {
        if entry.agent_id.trim().is_empty() {
            bail!("INVALID:agent id is required");
        }
        let session = self
            .get_or_create_session(&entry.agent_id, entry.session_id.as_deref())
            .await?;

        let now = Utc::now().to_rfc3339();
        let stored = JournalEntry {
            id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            agent_id: entry.agent_id,
            timestamp: now.clone(),
            entry_type: entry.entry_type,
            content: entry.content,
            context_snapshot: entry.context_snapshot,
            target_agent: entry.target_agent,
            tags: entry.tags,
        };

        sqlx::query(
            "INSERT INTO recorder_entries
                 (id, session_id, agent_id, timestamp, entry_type, content,
                  context_snapshot, target_agent, tags)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&stored.id)
        .bind(&stored.session_id)
        .bind(&stored.agent_id)
        .bind(&stored.timestamp)
        .bind(stored.entry_type.as_str())
        .bind(stored.content.to_string())
        .bind(
            stored
                .context_snapshot
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&stored.target_agent)
        .bind(stored.tags.as_ref().map(serde_json::to_string).transpose()?)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "UPDATE recorder_sessions
             SET entry_count = entry_count + 1, last_activity = ?
             WHERE id = ?",
        )
        .bind(&now)
        .bind(&session.id)
        .execute(&self.pool)
        .await?;

        Ok(stored)
    }

    /// Session selection: an explicit id is inserted-or-reused as is; else
    /// the most recent active session inside the 24 h activity window; else
    /// a fresh active session.
    pub async fn get_or_create_session(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
    ) -> Result<RecorderSession> {
        let now = Utc::now();

        if let Some(id) = session_id {
            if let Some(existing) = self.get_session(id).await? {
                return Ok(existing);
            }
            return self.insert_session(id, agent_id, now).await;
        }

        let cutoff = (now - Duration::hours(SESSION_ACTIVITY_WINDOW_HOURS)).to_rfc3339();
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT * FROM recorder_sessions
             WHERE agent_id = ? AND is_active = 1 AND last_activity > ?
             ORDER BY last_activity DESC LIMIT 1",
        )
        .bind(agent_id)
        .bind(&cutoff)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = row {
            return Ok(row.into());
        }

        self.insert_session(&Uuid::new_v4().to_string(), agent_id, now)
            .await
    }

    async fn insert_session(
        &self,
        id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RecorderSession> {
        let ts = now.to_rfc3339();
        sqlx::query(
            "INSERT OR IGNORE INTO recorder_sessions
                 (id, agent_id, created_at, last_activity, entry_count, is_active)
             VALUES (?, ?, ?, ?, 0, 1)",
        )
        .bind(id)
        .bind(agent_id)
        .bind(&ts)
        .bind(&ts)
        .execute(&self.pool)
        .await?;
        self.get_session(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session not found after insert"))
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<RecorderSession>> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM recorder_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    /// Close any active session for the agent, then open a fresh one.
    pub async fn start_new_session(&self, agent_id: &str) -> Result<RecorderSession> {
        self.close_agent_sessions(agent_id).await?;
        self.insert_session(&Uuid::new_v4().to_string(), agent_id, Utc::now())
            .await
    }

    pub async fn close_session(&self, id: &str) -> Result<()> {
        let n = sqlx::query("UPDATE recorder_sessions SET is_active = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if n == 0 {
            bail!("NOT_FOUND:session '{id}'");
        }
        Ok(())
    }

    /// Close every active session for an agent; returns how many closed.
    pub async fn close_agent_sessions(&self, agent_id: &str) -> Result<u64> {
        Ok(
            sqlx::query("UPDATE recorder_sessions SET is_active = 0 WHERE agent_id = ? AND is_active = 1")
                .bind(agent_id)
                .execute(&self.pool)
                .await?
                .rows_affected(),
        )
    }

    /// Most recent entries for a session, newest first.
    pub async fn entries_for_session(&self, session_id: &str, limit: i64) -> Result<Vec<JournalEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT * FROM recorder_entries WHERE session_id = ?
             ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// The agent's most recently active session, if any.
    pub async fn latest_session_for_agent(&self, agent_id: &str) -> Result<Option<RecorderSession>> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT * FROM recorder_sessions WHERE agent_id = ?
             ORDER BY last_activity DESC LIMIT 1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn sessions_for_agent(&self, agent_id: &str) -> Result<Vec<RecorderSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT * FROM recorder_sessions WHERE agent_id = ?
             ORDER BY last_activity DESC",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // ── Synthesis entry points ────────────────────────────────────────────────

    pub async fn get_context_for_session(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<context::ContextSummary> {
        let entries = self.entries_for_session(session_id, limit).await?;
        Ok(context::synthesize(&entries))
    }

    pub async fn get_context_for_agent(
        &self,
        agent_id: &str,
        limit: i64,
    ) -> Result<context::ContextSummary> {
        match self.latest_session_for_agent(agent_id).await? {
            Some(session) => self.get_context_for_session(&session.id, limit).await,
            None => Ok(context::synthesize(&[])),
        }
    }

    /// The resumption prompt for a restarting agent.
    pub async fn generate_universal_script(
        &self,
        agent_id: &str,
        include_context: bool,
    ) -> Result<String> {
        let entries = match self.latest_session_for_agent(agent_id).await? {
            Some(session) if include_context => {
                self.entries_for_session(&session.id, context::RECENT_LOG_LIMIT as i64)
                    .await?
            }
            _ => Vec::new(),
        };
        let summary = context::synthesize(&entries);
        Ok(context::resumption_prompt(agent_id, &summary, &entries))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
