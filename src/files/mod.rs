// SPDX-License-Identifier: MIT
//
// Content blob store for message attachments. The index is a JSON snapshot;
// payloads live in one file per blob so metadata reads never touch payload
// bytes. Blobs carry their own 24 h TTL, independent of message TTL.

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const BLOB_TTL_HOURS: i64 = 24;
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Code,
    Doc,
    Image,
    Data,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub id: String,
    pub name: String,
    pub file_type: FileType,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub created_at: String,
    pub expires_at: String,
}

impl FileMeta {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        DateTime::parse_from_rfc3339(&self.expires_at)
            .map(|t| t.with_timezone(&Utc) <= now)
            .unwrap_or(false)
    }
}

struct Inner {
    index: BTreeMap<String, FileMeta>,
    index_path: PathBuf,
    payload_dir: PathBuf,
}

pub struct FileStore {
    inner: Mutex<Inner>,
}

impl FileStore {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let index_path = data_dir.join("files.json");
        let payload_dir = data_dir.join("files");
        std::fs::create_dir_all(&payload_dir)?;
        let index = match std::fs::read_to_string(&index_path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(err = %e, "file index unreadable — starting empty");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Ok(Self {
            inner: Mutex::new(Inner {
                index,
                index_path,
                payload_dir,
            }),
        })
    }

    pub async fn upload(
        &self,
        name: &str,
        payload: &[u8],
        file_type: FileType,
        mime_type: Option<String>,
    ) -> Result<FileMeta> {
        if name.trim().is_empty() {
            bail!("INVALID:file name is required");
        }
        let now = Utc::now();
        let meta = FileMeta {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            file_type,
            size: payload.len() as u64,
            mime_type,
            created_at: now.to_rfc3339(),
            expires_at: (now + Duration::hours(BLOB_TTL_HOURS)).to_rfc3339(),
        };

        let mut inner = self.inner.lock().await;
        std::fs::write(inner.payload_dir.join(format!("{}.bin", meta.id)), payload)?;
        inner.index.insert(meta.id.clone(), meta.clone());
        persist_index(&inner)?;
        Ok(meta)
    }

    pub async fn get_meta(&self, id: &str) -> Result<FileMeta> {
        let inner = self.inner.lock().await;
        inner
            .index
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("NOT_FOUND:file '{id}'"))
    }

    /// Metadata plus payload bytes.
    pub async fn get(&self, id: &str) -> Result<(FileMeta, Vec<u8>)> {
        let inner = self.inner.lock().await;
        let meta = inner
            .index
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("NOT_FOUND:file '{id}'"))?;
        let payload = std::fs::read(inner.payload_dir.join(format!("{id}.bin")))?;
        Ok((meta, payload))
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.index.remove(id).is_none() {
            bail!("NOT_FOUND:file '{id}'");
        }
        let _ = std::fs::remove_file(inner.payload_dir.join(format!("{id}.bin")));
        persist_index(&inner)?;
        Ok(())
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.index.len()
    }

    /// Drop expired blobs and their payload files.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<String> = inner
            .index
            .values()
            .filter(|m| m.is_expired_at(now))
            .map(|m| m.id.clone())
            .collect();
        for id in &expired {
            inner.index.remove(id);
            let _ = std::fs::remove_file(inner.payload_dir.join(format!("{id}.bin")));
        }
        if !expired.is_empty() {
            persist_index(&inner)?;
        }
        Ok(expired.len())
    }
}

fn persist_index(inner: &Inner) -> Result<()> {
    let raw = serde_json::to_string_pretty(&inner.index)?;
    let tmp = inner.index_path.with_extension("json.tmp");
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, &inner.index_path)?;
    Ok(())
}

/// Hourly blob sweep loop.
pub async fn run_blob_sweep(
    files: Arc<FileStore>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!("blob sweep started (hourly)");
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match files.sweep_expired(Utc::now()).await {
                    Ok(n) if n > 0 => info!(dropped = n, "blob sweep removed expired files"),
                    Ok(_) => {}
                    Err(e) => warn!(err = %e, "blob sweep error"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> FileStore {
        let dir = tempfile::tempdir().unwrap().keep();
        FileStore::load(&dir).unwrap()
    }

    #[tokio::test]
    async fn upload_then_fetch_round_trips_payload() {
        let store = store();
        let meta = store
            .upload("main.rs", b"fn main() {}", FileType::Code, None)
            .await
            .unwrap();
        assert_eq!(meta.size, 12);

        let (meta2, payload) = store.get(&meta.id).await.unwrap();
        assert_eq!(meta2.name, "main.rs");
        assert_eq!(payload, b"fn main() {}");
    }

    #[tokio::test]
    async fn meta_read_does_not_require_payload() {
        let store = store();
        let meta = store
            .upload("notes.md", b"# notes", FileType::Doc, Some("text/markdown".into()))
            .await
            .unwrap();
        let found = store.get_meta(&meta.id).await.unwrap();
        assert_eq!(found.mime_type.as_deref(), Some("text/markdown"));
    }

    #[tokio::test]
    async fn sweep_drops_only_expired_blobs() {
        let store = store();
        let meta = store.upload("a.txt", b"a", FileType::Data, None).await.unwrap();

        assert_eq!(store.sweep_expired(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + Duration::hours(BLOB_TTL_HOURS) + Duration::seconds(1);
        assert_eq!(store.sweep_expired(later).await.unwrap(), 1);
        assert!(store.get_meta(&meta.id).await.is_err());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = store();
        let err = store.delete("nope").await.unwrap_err();
        assert!(err.to_string().starts_with("NOT_FOUND:"));
    }
}
