// SPDX-License-Identifier: MIT
//
// API keys. Keys look like `quack_<24 base64url chars>`; only the SHA-256
// of the full key is stored. Accepted as `Authorization: Bearer ...` or a
// `?token=` query parameter.

use anyhow::{bail, Result};
use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use rand::RngCore;
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use crate::crypto;
use crate::AppContext;

pub const KEY_PREFIX: &str = "quack_";
/// 18 random bytes encode to exactly 24 base64url characters.
const KEY_RANDOM_BYTES: usize = 18;

#[derive(Debug, Clone, sqlx::FromRow)]
struct ApiKeyRow {
    id: String,
    key_hash: String,
    owner: String,
    permissions: String,
    revoked: i64,
    created_at: String,
    last_used_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub id: String,
    pub owner: String,
    pub permissions: Vec<String>,
    pub revoked: bool,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<String>,
}

impl From<ApiKeyRow> for ApiKeyRecord {
    fn from(r: ApiKeyRow) -> ApiKeyRecord {
        ApiKeyRecord {
            id: r.id,
            owner: r.owner,
            permissions: serde_json::from_str(&r.permissions).unwrap_or_default(),
            revoked: r.revoked != 0,
            created_at: r.created_at,
            last_used_at: r.last_used_at,
        }
    }
}

#[derive(Clone)]
pub struct ApiKeyStore {
    pool: SqlitePool,
}

impl ApiKeyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Mint a key. The plaintext is returned exactly once; only its digest
    /// is stored.
    pub async fn create(
        &self,
        owner: &str,
        permissions: Vec<String>,
    ) -> Result<(ApiKeyRecord, String)> {
        if owner.trim().is_empty() {
            bail!("INVALID:key owner is required");
        }
        let mut random = [0u8; KEY_RANDOM_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut random);
        let plaintext = format!("{KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(random));

        let record = ApiKeyRecord {
            id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            permissions,
            revoked: false,
            created_at: Utc::now().to_rfc3339(),
            last_used_at: None,
        };
        sqlx::query(
            "INSERT INTO api_keys (id, key_hash, owner, permissions, revoked, created_at)
             VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(&record.id)
        .bind(crypto::sha256_hex(&plaintext))
        .bind(&record.owner)
        .bind(serde_json::to_string(&record.permissions)?)
        .bind(&record.created_at)
        .execute(&self.pool)
        .await?;

        Ok((record, plaintext))
    }

    /// Look up a presented key. Returns the record when the key exists and
    /// is not revoked; stamps `last_used_at`.
    pub async fn verify(&self, presented: &str) -> Result<Option<ApiKeyRecord>> {
        if !presented.starts_with(KEY_PREFIX) {
            return Ok(None);
        }
        let hash = crypto::sha256_hex(presented);
        let row: Option<ApiKeyRow> =
            sqlx::query_as("SELECT * FROM api_keys WHERE key_hash = ? AND revoked = 0")
                .bind(&hash)
                .fetch_optional(&self.pool)
                .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(&row.id)
            .execute(&self.pool)
            .await?;
        Ok(Some(row.into()))
    }

    pub async fn revoke(&self, id: &str) -> Result<()> {
        let n = sqlx::query("UPDATE api_keys SET revoked = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if n == 0 {
            bail!("NOT_FOUND:api key '{id}'");
        }
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ApiKeyRecord>> {
        let rows: Vec<ApiKeyRow> =
            sqlx::query_as("SELECT * FROM api_keys ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// ─── Middleware ───────────────────────────────────────────────────────────────

/// Extract a bearer token from the Authorization header or `?token=`.
fn extract_token(req: &Request<Body>) -> Option<String> {
    if let Some(header) = req.headers().get("authorization") {
        if let Ok(value) = header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }
    let query = req.uri().query()?;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == "token").then(|| v.to_string())
    })
}

/// Require a valid API key on `/api` routes. The dev-bypass flag grants
/// admin to every request.
pub async fn require_api_key(
    State(ctx): State<Arc<AppContext>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if ctx.config.dev_bypass {
        return next.run(req).await;
    }
    let Some(token) = extract_token(&req) else {
        return unauthorized("missing API key");
    };
    match ctx.keys.verify(&token).await {
        Ok(Some(_)) => next.run(req).await,
        Ok(None) => unauthorized("invalid or revoked API key"),
        Err(e) => {
            tracing::error!(err = %e, "api key lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            )
                .into_response()
        }
    }
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": message}))).into_response()
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    async fn store() -> ApiKeyStore {
        let storage = Storage::in_memory().await.unwrap();
        ApiKeyStore::new(storage.pool())
    }

    #[tokio::test]
    async fn minted_key_has_expected_shape() {
        let store = store().await;
        let (record, plaintext) = store.create("ops", vec!["admin".into()]).await.unwrap();
        assert!(plaintext.starts_with(KEY_PREFIX));
        assert_eq!(plaintext.len(), KEY_PREFIX.len() + 24);
        assert!(!record.revoked);
    }

    #[tokio::test]
    async fn verify_accepts_live_key_and_rejects_revoked() {
        let store = store().await;
        let (record, plaintext) = store.create("ops", vec![]).await.unwrap();

        let found = store.verify(&plaintext).await.unwrap().unwrap();
        assert_eq!(found.id, record.id);
        assert!(found.last_used_at.is_none());
        // last_used_at is stamped by verification.
        let again = store.verify(&plaintext).await.unwrap().unwrap();
        assert!(again.last_used_at.is_some() || {
            // Stamp lands after the row was read; re-read to confirm.
            store.list().await.unwrap()[0].last_used_at.is_some()
        });

        store.revoke(&record.id).await.unwrap();
        assert!(store.verify(&plaintext).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn verify_rejects_foreign_tokens() {
        let store = store().await;
        assert!(store.verify("not-a-key").await.unwrap().is_none());
        assert!(store.verify("quack_000000000000000000000000").await.unwrap().is_none());
    }
}
