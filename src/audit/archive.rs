// SPDX-License-Identifier: MIT
//
// Thread archive. A completed thread is frozen into a single row — full
// participants list, first/last timestamps, embedded message list — before
// the TTL sweep destroys the live copies.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::mailbox::model::Message;

#[derive(Debug, Clone, sqlx::FromRow)]
struct ArchivedThreadRow {
    id: String,
    thread_id: String,
    participants: String,
    first_at: String,
    last_at: String,
    messages: String,
    metadata: Option<String>,
    archived_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedThread {
    pub id: String,
    pub thread_id: String,
    pub participants: Vec<String>,
    pub first_at: String,
    pub last_at: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub archived_at: String,
}

impl From<ArchivedThreadRow> for ArchivedThread {
    fn from(r: ArchivedThreadRow) -> ArchivedThread {
        ArchivedThread {
            id: r.id,
            thread_id: r.thread_id,
            participants: serde_json::from_str(&r.participants).unwrap_or_default(),
            first_at: r.first_at,
            last_at: r.last_at,
            messages: serde_json::from_str(&r.messages).unwrap_or_default(),
            metadata: r.metadata.and_then(|m| serde_json::from_str(&m).ok()),
            archived_at: r.archived_at,
        }
    }
}

#[derive(Clone)]
pub struct ThreadArchive {
    pool: SqlitePool,
}

impl ThreadArchive {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Freeze a thread. `messages` must already be in timestamp order. This
    /// write is synchronous with respect to the sweep: it completes before
    /// the live messages are dropped.
    pub async fn archive_thread(
        &self,
        thread_id: &str,
        messages: &[Message],
        metadata: Value,
    ) -> Result<ArchivedThread> {
        let mut participants: Vec<String> = messages
            .iter()
            .flat_map(|m| [m.from.clone(), m.to.clone()])
            .collect();
        participants.sort();
        participants.dedup();

        let first_at = messages.first().map(|m| m.timestamp.clone()).unwrap_or_default();
        let last_at = messages.last().map(|m| m.timestamp.clone()).unwrap_or_default();

        let id = Uuid::new_v4().to_string();
        let archived_at = Utc::now().to_rfc3339();
        let metadata_str = if metadata.is_null() {
            None
        } else {
            Some(metadata.to_string())
        };

        sqlx::query(
            "INSERT INTO archived_threads
                 (id, thread_id, participants, first_at, last_at, messages, metadata, archived_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(thread_id)
        .bind(serde_json::to_string(&participants)?)
        .bind(&first_at)
        .bind(&last_at)
        .bind(serde_json::to_string(messages)?)
        .bind(&metadata_str)
        .bind(&archived_at)
        .execute(&self.pool)
        .await?;

        let row: ArchivedThreadRow = sqlx::query_as("SELECT * FROM archived_threads WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    /// Latest archived copy of a thread, if any.
    pub async fn get_by_thread(&self, thread_id: &str) -> Result<Option<ArchivedThread>> {
        let row: Option<ArchivedThreadRow> = sqlx::query_as(
            "SELECT * FROM archived_threads WHERE thread_id = ?
             ORDER BY archived_at DESC LIMIT 1",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Most recently archived threads, newest first.
    pub async fn list(&self, limit: i64) -> Result<Vec<ArchivedThread>> {
        let rows: Vec<ArchivedThreadRow> = sqlx::query_as(
            "SELECT * FROM archived_threads ORDER BY archived_at DESC LIMIT ?",
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::model::Message;
    use crate::storage::Storage;
    use serde_json::json;

    #[tokio::test]
    async fn archive_freezes_participants_and_messages() {
        let storage = Storage::in_memory().await.unwrap();
        let archive = ThreadArchive::new(storage.pool());

        let root = Message::new("replit/main".into(), "cursor/dev".into(), "task".into());
        let mut reply = Message::new("cursor/dev".into(), "replit/main".into(), "done".into());
        reply.thread_id = root.id.clone();

        let thread_id = root.id.clone();
        let stored = archive
            .archive_thread(&thread_id, &[root, reply], json!({"reason": "ttl"}))
            .await
            .unwrap();

        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.participants, vec!["cursor/dev", "replit/main"]);

        let found = archive.get_by_thread(&thread_id).await.unwrap().unwrap();
        assert_eq!(found.id, stored.id);
        assert!(archive.get_by_thread("missing").await.unwrap().is_none());
    }
}
