// SPDX-License-Identifier: MIT
//
// Agent registry and routing policy. Records live in SQLite; the policy
// decides whether a send auto-approves or is held for human review.

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;

use crate::mailbox::paths;

/// An agent is considered online if it was seen within this window.
const ONLINE_WINDOW_MINUTES: i64 = 5;

// ─── Enums ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentCategory {
    /// Chat frontends driven by a human; inbound work is held for review.
    Conversational,
    /// Fully autonomous build/deploy agents.
    Autonomous,
    /// Autonomous but under explicit human supervision.
    Supervised,
}

impl AgentCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentCategory::Conversational => "conversational",
            AgentCategory::Autonomous => "autonomous",
            AgentCategory::Supervised => "supervised",
        }
    }
}

impl std::str::FromStr for AgentCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversational" => Ok(AgentCategory::Conversational),
            "autonomous" => Ok(AgentCategory::Autonomous),
            "supervised" => Ok(AgentCategory::Supervised),
            other => Err(anyhow::anyhow!("INVALID:unknown agent category '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyMode {
    Polling,
    Webhook,
    Websocket,
}

impl NotifyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            NotifyMode::Polling => "polling",
            NotifyMode::Webhook => "webhook",
            NotifyMode::Websocket => "websocket",
        }
    }
}

impl std::str::FromStr for NotifyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(NotifyMode::Polling),
            "webhook" => Ok(NotifyMode::Webhook),
            "websocket" => Ok(NotifyMode::Websocket),
            other => Err(anyhow::anyhow!("INVALID:unknown notify mode '{other}'")),
        }
    }
}

// ─── Agent record ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
struct AgentRow {
    id: String,
    display_name: String,
    capabilities: String,
    category: String,
    requires_approval: i64,
    auto_approve_on_check: i64,
    notify_mode: String,
    webhook_url: Option<String>,
    webhook_secret: Option<String>,
    platform_url: Option<String>,
    notify_prompt: Option<String>,
    is_public: i64,
    owner: Option<String>,
    created_at: String,
    last_seen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    /// `platform/name` identifier.
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub category: AgentCategory,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub auto_approve_on_check: bool,
    pub notify_mode: NotifyMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_prompt: Option<String>,
    #[serde(default = "default_true")]
    pub is_public: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
}

fn default_true() -> bool {
    true
}

impl AgentRecord {
    pub fn platform(&self) -> &str {
        paths::root(&self.id)
    }

    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        self.last_seen
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| now - t.with_timezone(&Utc) < Duration::minutes(ONLINE_WINDOW_MINUTES))
            .unwrap_or(false)
    }
}

impl TryFrom<AgentRow> for AgentRecord {
    type Error = anyhow::Error;

    fn try_from(r: AgentRow) -> Result<AgentRecord> {
        Ok(AgentRecord {
            id: r.id,
            display_name: r.display_name,
            capabilities: serde_json::from_str(&r.capabilities).unwrap_or_default(),
            category: r.category.parse()?,
            requires_approval: r.requires_approval != 0,
            auto_approve_on_check: r.auto_approve_on_check != 0,
            notify_mode: r.notify_mode.parse()?,
            webhook_url: r.webhook_url,
            webhook_secret: r.webhook_secret,
            platform_url: r.platform_url,
            notify_prompt: r.notify_prompt,
            is_public: r.is_public != 0,
            owner: r.owner,
            created_at: r.created_at,
            last_seen: r.last_seen,
        })
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AgentRegistry {
    pool: SqlitePool,
}

impl AgentRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn register(&self, mut record: AgentRecord) -> Result<AgentRecord> {
        record.id = paths::normalize(&record.id);
        if !record.id.contains('/') {
            bail!("INVALID:agent id must be 'platform/name', got '{}'", record.id);
        }
        if self.get(&record.id).await?.is_some() {
            bail!("CONFLICT:agent '{}' is already registered", record.id);
        }
        record.created_at = Utc::now().to_rfc3339();
        self.insert(&record).await?;
        Ok(record)
    }

    async fn insert(&self, record: &AgentRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO agents
                 (id, display_name, capabilities, category, requires_approval,
                  auto_approve_on_check, notify_mode, webhook_url, webhook_secret,
                  platform_url, notify_prompt, is_public, owner, created_at, last_seen)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.display_name)
        .bind(serde_json::to_string(&record.capabilities)?)
        .bind(record.category.as_str())
        .bind(record.requires_approval as i64)
        .bind(record.auto_approve_on_check as i64)
        .bind(record.notify_mode.as_str())
        .bind(&record.webhook_url)
        .bind(&record.webhook_secret)
        .bind(&record.platform_url)
        .bind(&record.notify_prompt)
        .bind(record.is_public as i64)
        .bind(&record.owner)
        .bind(&record.created_at)
        .bind(&record.last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<AgentRecord>> {
        let row: Option<AgentRow> = sqlx::query_as("SELECT * FROM agents WHERE id = ?")
            .bind(paths::normalize(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Find the agent responsible for a platform root — an exact id match or
    /// the oldest `root/...` registration.
    pub async fn find_by_platform(&self, platform: &str) -> Result<Option<AgentRecord>> {
        let platform = paths::normalize(platform);
        let row: Option<AgentRow> = sqlx::query_as(
            "SELECT * FROM agents WHERE id = ? OR id LIKE ? || '/%'
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(&platform)
        .bind(&platform)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    pub async fn update(&self, id: &str, mut record: AgentRecord) -> Result<AgentRecord> {
        let id = paths::normalize(id);
        let existing = self
            .get(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("NOT_FOUND:agent '{id}'"))?;
        record.id = id.clone();
        record.created_at = existing.created_at;
        record.last_seen = existing.last_seen;
        sqlx::query(
            "UPDATE agents SET
                 display_name = ?, capabilities = ?, category = ?,
                 requires_approval = ?, auto_approve_on_check = ?, notify_mode = ?,
                 webhook_url = ?, webhook_secret = ?, platform_url = ?,
                 notify_prompt = ?, is_public = ?, owner = ?
             WHERE id = ?",
        )
        .bind(&record.display_name)
        .bind(serde_json::to_string(&record.capabilities)?)
        .bind(record.category.as_str())
        .bind(record.requires_approval as i64)
        .bind(record.auto_approve_on_check as i64)
        .bind(record.notify_mode.as_str())
        .bind(&record.webhook_url)
        .bind(&record.webhook_secret)
        .bind(&record.platform_url)
        .bind(&record.notify_prompt)
        .bind(record.is_public as i64)
        .bind(&record.owner)
        .bind(&id)
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let n = sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(paths::normalize(id))
            .execute(&self.pool)
            .await?
            .rows_affected();
        if n == 0 {
            bail!("NOT_FOUND:agent '{id}'");
        }
        Ok(())
    }

    /// Discovery list. Private agents are omitted unless requested.
    pub async fn list(&self, include_private: bool) -> Result<Vec<AgentRecord>> {
        let rows: Vec<AgentRow> = if include_private {
            sqlx::query_as("SELECT * FROM agents ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query_as("SELECT * FROM agents WHERE is_public = 1 ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?
        };
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Stamp `last_seen` for every agent on a platform.
    pub async fn update_last_activity(&self, platform: &str) -> Result<()> {
        let platform = paths::normalize(platform);
        sqlx::query("UPDATE agents SET last_seen = ? WHERE id = ? OR id LIKE ? || '/%'")
            .bind(Utc::now().to_rfc3339())
            .bind(&platform)
            .bind(&platform)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stamp `last_seen` for one agent and return the fresh record.
    pub async fn ping(&self, id: &str) -> Result<AgentRecord> {
        let id = paths::normalize(id);
        let n = sqlx::query("UPDATE agents SET last_seen = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(&id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if n == 0 {
            bail!("NOT_FOUND:agent '{id}'");
        }
        self.get(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("NOT_FOUND:agent '{id}'"))
    }

    // ── Routing policy ────────────────────────────────────────────────────────

    /// The auto-approval rule:
    /// - neither platform registered → approve
    /// - destination requires approval → hold
    /// - sender is conversational → hold
    /// - otherwise → approve
    pub async fn should_auto_approve(&self, from: &str, to: &str) -> Result<bool> {
        let sender = self.find_by_platform(paths::root(&paths::normalize(from))).await?;
        let dest = self.find_by_platform(paths::root(&paths::normalize(to))).await?;

        if sender.is_none() && dest.is_none() {
            return Ok(true);
        }
        if let Some(dest) = &dest {
            if dest.requires_approval {
                return Ok(false);
            }
        }
        if let Some(sender) = &sender {
            if sender.category == AgentCategory::Conversational {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ── Seeding ───────────────────────────────────────────────────────────────

    /// First-start seeding: conversational frontends held for approval,
    /// autonomous builders auto-approved. No-op when any agent exists.
    pub async fn seed_defaults(&self) -> Result<()> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM agents")
            .fetch_one(&self.pool)
            .await?;
        if count > 0 {
            return Ok(());
        }

        let conversational: &[(&str, &str, &str)] = &[
            ("claude/chat", "Claude", "https://claude.ai"),
            ("gpt/chat", "ChatGPT", "https://chatgpt.com"),
            ("gemini/chat", "Gemini", "https://gemini.google.com"),
            ("grok/chat", "Grok", "https://grok.com"),
            ("copilot/chat", "Copilot", "https://copilot.microsoft.com"),
        ];
        let autonomous: &[(&str, &str, &str)] = &[
            ("replit/agent", "Replit Agent", "https://replit.com"),
            ("cursor/agent", "Cursor", "https://cursor.com"),
            ("antigravity/agent", "Antigravity", "https://antigravity.google"),
        ];

        let now = Utc::now().to_rfc3339();
        for (id, name, url) in conversational {
            let record = AgentRecord {
                id: id.to_string(),
                display_name: name.to_string(),
                capabilities: vec!["chat".to_string()],
                category: AgentCategory::Conversational,
                requires_approval: true,
                auto_approve_on_check: false,
                notify_mode: NotifyMode::Polling,
                webhook_url: None,
                webhook_secret: None,
                platform_url: Some(url.to_string()),
                notify_prompt: Some(format!(
                    "{name}, check your Quack inbox and reply when you are done."
                )),
                is_public: true,
                owner: None,
                created_at: now.clone(),
                last_seen: None,
            };
            self.insert(&record).await?;
        }
        for (id, name, url) in autonomous {
            let record = AgentRecord {
                id: id.to_string(),
                display_name: name.to_string(),
                capabilities: vec!["build".to_string(), "deploy".to_string()],
                category: AgentCategory::Autonomous,
                requires_approval: false,
                auto_approve_on_check: true,
                notify_mode: NotifyMode::Polling,
                webhook_url: None,
                webhook_secret: None,
                platform_url: Some(url.to_string()),
                notify_prompt: Some(format!(
                    "{name}, a new task is waiting in your Quack inbox."
                )),
                is_public: true,
                owner: None,
                created_at: now.clone(),
                last_seen: None,
            };
            self.insert(&record).await?;
        }

        info!(
            seeded = conversational.len() + autonomous.len(),
            "seeded default agent registry"
        );
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    async fn registry() -> AgentRegistry {
        let storage = Storage::in_memory().await.unwrap();
        AgentRegistry::new(storage.pool())
    }

    fn agent(id: &str, category: AgentCategory, requires_approval: bool) -> AgentRecord {
        AgentRecord {
            id: id.to_string(),
            display_name: id.to_string(),
            capabilities: vec![],
            category,
            requires_approval,
            auto_approve_on_check: false,
            notify_mode: NotifyMode::Polling,
            webhook_url: None,
            webhook_secret: None,
            platform_url: None,
            notify_prompt: None,
            is_public: true,
            owner: None,
            created_at: String::new(),
            last_seen: None,
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_conflict() {
        let reg = registry().await;
        reg.register(agent("replit/agent", AgentCategory::Autonomous, false)).await.unwrap();
        let err = reg
            .register(agent("replit/agent", AgentCategory::Autonomous, false))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("CONFLICT:"));
    }

    #[tokio::test]
    async fn policy_unregistered_pair_approves() {
        let reg = registry().await;
        assert!(reg.should_auto_approve("nobody/a", "stranger/b").await.unwrap());
    }

    #[tokio::test]
    async fn policy_destination_requiring_approval_holds() {
        let reg = registry().await;
        reg.register(agent("claude/chat", AgentCategory::Conversational, true)).await.unwrap();
        assert!(!reg.should_auto_approve("replit/dev", "claude/web").await.unwrap());
    }

    #[tokio::test]
    async fn policy_conversational_sender_holds() {
        let reg = registry().await;
        reg.register(agent("claude/chat", AgentCategory::Conversational, false)).await.unwrap();
        reg.register(agent("replit/agent", AgentCategory::Autonomous, false)).await.unwrap();
        assert!(!reg.should_auto_approve("claude/web", "replit/main").await.unwrap());
    }

    #[tokio::test]
    async fn policy_autonomous_pair_approves() {
        let reg = registry().await;
        reg.register(agent("replit/agent", AgentCategory::Autonomous, false)).await.unwrap();
        reg.register(agent("cursor/agent", AgentCategory::Autonomous, false)).await.unwrap();
        assert!(reg.should_auto_approve("cursor/dev", "replit/main").await.unwrap());
    }

    #[tokio::test]
    async fn seed_defaults_is_idempotent_and_split_by_category() {
        let reg = registry().await;
        reg.seed_defaults().await.unwrap();
        reg.seed_defaults().await.unwrap();
        let all = reg.list(true).await.unwrap();
        assert_eq!(all.len(), 8);
        let claude = reg.find_by_platform("claude").await.unwrap().unwrap();
        assert!(claude.requires_approval);
        let replit = reg.find_by_platform("replit").await.unwrap().unwrap();
        assert!(!replit.requires_approval);
        assert_eq!(replit.category, AgentCategory::Autonomous);
    }

    #[tokio::test]
    async fn ping_marks_agent_online() {
        let reg = registry().await;
        reg.register(agent("replit/agent", AgentCategory::Autonomous, false)).await.unwrap();
        let before = reg.get("replit/agent").await.unwrap().unwrap();
        assert!(!before.is_online(Utc::now()));
        let after = reg.ping("replit/agent").await.unwrap();
        assert!(after.is_online(Utc::now()));
    }
}
