// SPDX-License-Identifier: MIT
//
// Append-only audit log. Every lifecycle mutation emits exactly one entry;
// writes are best-effort and never fail the operation that triggered them.

pub mod archive;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::warn;

// ─── Action verbs ─────────────────────────────────────────────────────────────

pub mod actions {
    pub const MESSAGE_SEND: &str = "message.send";
    pub const MESSAGE_APPROVE: &str = "message.approve";
    pub const MESSAGE_COMPLETE: &str = "message.complete";
    pub const MESSAGE_READ: &str = "message.read";
    pub const MESSAGE_STATUS: &str = "message.status";
    pub const MESSAGE_DELETE: &str = "message.delete";
    pub const MESSAGE_EXPIRE: &str = "message.expire";
    pub const THREAD_ARCHIVE: &str = "thread.archive";
    pub const AGENT_REGISTER: &str = "agent.register";
    pub const AGENT_UPDATE: &str = "agent.update";
    pub const AGENT_DELETE: &str = "agent.delete";
    pub const AGENT_PING: &str = "agent.ping";
    pub const KEY_CREATE: &str = "key.create";
    pub const KEY_REVOKE: &str = "key.revoke";
    pub const WEBHOOK_SUBSCRIBE: &str = "webhook.subscribe";
    pub const WEBHOOK_UNSUBSCRIBE: &str = "webhook.unsubscribe";
    pub const FILE_UPLOAD: &str = "file.upload";
    pub const FILE_DELETE: &str = "file.delete";
    pub const BRIDGE_CONNECT: &str = "bridge.connect";
    pub const BRIDGE_DISCONNECT: &str = "bridge.disconnect";
}

// ─── Rows ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
struct AuditRow {
    id: i64,
    timestamp: String,
    action: String,
    actor: String,
    target_type: String,
    target_id: String,
    details: Option<String>,
    source: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: String,
    pub action: String,
    pub actor: String,
    pub target_type: String,
    pub target_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl From<AuditRow> for AuditEntry {
    fn from(r: AuditRow) -> AuditEntry {
        AuditEntry {
            id: r.id,
            timestamp: r.timestamp,
            action: r.action,
            actor: r.actor,
            target_type: r.target_type,
            target_id: r.target_id,
            details: r.details.and_then(|d| serde_json::from_str(&d).ok()),
            source: r.source,
        }
    }
}

/// Query filters. All fields optional; `limit` defaults to 100.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFilter {
    pub action: Option<String>,
    pub actor: Option<String>,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStats {
    pub total: i64,
    pub last_24h: i64,
    pub top_actions: Vec<(String, i64)>,
    pub top_actors: Vec<(String, i64)>,
}

// ─── AuditLog ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AuditLog {
    pool: SqlitePool,
}

impl AuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an entry. Failures are logged and swallowed — audit must never
    /// block or fail the mutating operation.
    pub async fn emit(
        &self,
        action: &str,
        actor: &str,
        target_type: &str,
        target_id: &str,
        details: Value,
        source: Option<&str>,
    ) {
        let details_str = if details.is_null() {
            None
        } else {
            Some(details.to_string())
        };
        let result = sqlx::query(
            "INSERT INTO audit_log (timestamp, action, actor, target_type, target_id, details, source)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(action)
        .bind(actor)
        .bind(target_type)
        .bind(target_id)
        .bind(details_str)
        .bind(source)
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            warn!(action, target_id, err = %e, "audit write failed");
        }
    }

    /// Filtered query, newest first.
    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let mut sql = String::from("SELECT * FROM audit_log WHERE 1=1");
        let mut binds: Vec<String> = Vec::new();
        if let Some(v) = &filter.action {
            sql.push_str(" AND action = ?");
            binds.push(v.clone());
        }
        if let Some(v) = &filter.actor {
            sql.push_str(" AND actor = ?");
            binds.push(v.clone());
        }
        if let Some(v) = &filter.target_type {
            sql.push_str(" AND target_type = ?");
            binds.push(v.clone());
        }
        if let Some(v) = &filter.target_id {
            sql.push_str(" AND target_id = ?");
            binds.push(v.clone());
        }
        if let Some(v) = &filter.since {
            sql.push_str(" AND timestamp >= ?");
            binds.push(v.clone());
        }
        if let Some(v) = &filter.until {
            sql.push_str(" AND timestamp <= ?");
            binds.push(v.clone());
        }
        sql.push_str(" ORDER BY id DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, AuditRow>(&sql);
        for b in &binds {
            query = query.bind(b);
        }
        let rows = query
            .bind(filter.limit.unwrap_or(100).clamp(1, 1000))
            .bind(filter.offset.unwrap_or(0).max(0))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn stats(&self) -> Result<AuditStats> {
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_log")
            .fetch_one(&self.pool)
            .await?;

        let cutoff = (Utc::now() - Duration::hours(24)).to_rfc3339();
        let (last_24h,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM audit_log WHERE timestamp >= ?")
                .bind(&cutoff)
                .fetch_one(&self.pool)
                .await?;

        let top_actions: Vec<(String, i64)> = sqlx::query_as(
            "SELECT action, COUNT(*) as n FROM audit_log
             GROUP BY action ORDER BY n DESC LIMIT 5",
        )
        .fetch_all(&self.pool)
        .await?;

        let top_actors: Vec<(String, i64)> = sqlx::query_as(
            "SELECT actor, COUNT(*) as n FROM audit_log
             GROUP BY actor ORDER BY n DESC LIMIT 5",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(AuditStats {
            total,
            last_24h,
            top_actions,
            top_actors,
        })
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use serde_json::json;

    async fn log() -> AuditLog {
        let storage = Storage::in_memory().await.unwrap();
        AuditLog::new(storage.pool())
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let log = log().await;
        for i in 0..3 {
            log.emit(
                actions::MESSAGE_SEND,
                "cursor/dev",
                "message",
                &format!("m{i}"),
                Value::Null,
                None,
            )
            .await;
        }
        let entries = log.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 3);
        // Newest first, strictly decreasing ids.
        assert!(entries[0].id > entries[1].id && entries[1].id > entries[2].id);
    }

    #[tokio::test]
    async fn filters_narrow_by_action_and_actor() {
        let log = log().await;
        log.emit(actions::MESSAGE_SEND, "a", "message", "1", json!({"k": 1}), None).await;
        log.emit(actions::MESSAGE_APPROVE, "b", "message", "1", Value::Null, Some("quack-bridge")).await;

        let filter = AuditFilter {
            action: Some(actions::MESSAGE_APPROVE.to_string()),
            ..Default::default()
        };
        let entries = log.query(&filter).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].actor, "b");
        assert_eq!(entries[0].source.as_deref(), Some("quack-bridge"));
    }

    #[tokio::test]
    async fn stats_aggregate_totals_and_top_actions() {
        let log = log().await;
        for _ in 0..2 {
            log.emit(actions::MESSAGE_SEND, "a", "message", "1", Value::Null, None).await;
        }
        log.emit(actions::AGENT_PING, "a", "agent", "replit", Value::Null, None).await;

        let stats = log.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.last_24h, 3);
        assert_eq!(stats.top_actions[0].0, actions::MESSAGE_SEND);
        assert_eq!(stats.top_actions[0].1, 2);
    }
}
