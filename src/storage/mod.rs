// SPDX-License-Identifier: MIT

use anyhow::Result;
use serde::Serialize;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};

/// Row counts across the durable tables, surfaced by the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub agents: i64,
    pub audit_entries: i64,
    pub archived_threads: i64,
    pub api_keys: i64,
    pub recorder_sessions: i64,
    pub recorder_entries: i64,
}

/// Shared SQLite handle. Audit, archive, agent registry, API keys, and the
/// flight recorder all share one pool; the mailbox itself lives in JSON
/// snapshots and only touches the pool through the archive.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("quackd.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. Pinned to a single connection that
    /// never recycles — every pooled connection to `:memory:` would
    /// otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [
            include_str!("migrations/001_init.sql"),
            include_str!("migrations/002_recorder.sql"),
        ] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    /// Count every durable table in one pass.
    pub async fn stats(&self) -> Result<StorageStats> {
        async fn count(pool: &SqlitePool, table: &str) -> Result<i64> {
            // Table names come from the fixed list below, never from input.
            let (n,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(pool)
                .await?;
            Ok(n)
        }

        Ok(StorageStats {
            agents: count(&self.pool, "agents").await?,
            audit_entries: count(&self.pool, "audit_log").await?,
            archived_threads: count(&self.pool, "archived_threads").await?,
            api_keys: count(&self.pool, "api_keys").await?,
            recorder_sessions: count(&self.pool, "recorder_sessions").await?,
            recorder_entries: count(&self.pool, "recorder_entries").await?,
        })
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let storage = Storage::in_memory().await.unwrap();
        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.agents, 0);
        assert_eq!(stats.audit_entries, 0);
        assert_eq!(stats.archived_threads, 0);
        assert_eq!(stats.api_keys, 0);
        assert_eq!(stats.recorder_sessions, 0);
        assert_eq!(stats.recorder_entries, 0);
    }

    #[tokio::test]
    async fn stats_track_inserts() {
        let storage = Storage::in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO audit_log (timestamp, action, actor, target_type, target_id)
             VALUES ('2026-08-01T00:00:00Z', 'message.send', 'a/b', 'message', 'm1')",
        )
        .execute(&storage.pool())
        .await
        .unwrap();
        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.audit_entries, 1);
    }
}
