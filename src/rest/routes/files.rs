// SPDX-License-Identifier: MIT

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::audit::actions;
use crate::files::FileType;
use crate::rest::map_err;
use crate::AppContext;

type HandlerError = (StatusCode, Json<Value>);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadBody {
    pub name: String,
    pub content: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    #[serde(default)]
    pub mime_type: Option<String>,
}

pub async fn upload(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<UploadBody>,
) -> Result<Json<Value>, HandlerError> {
    let meta = ctx
        .files
        .upload(&body.name, body.content.as_bytes(), body.file_type, body.mime_type)
        .await
        .map_err(map_err)?;
    ctx.audit
        .emit(
            actions::FILE_UPLOAD,
            "uploader",
            "file",
            &meta.id,
            json!({"name": meta.name, "size": meta.size}),
            None,
        )
        .await;
    Ok(Json(json!({"success": true, "file": meta})))
}

pub async fn download(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HandlerError> {
    let (meta, payload) = ctx.files.get(&id).await.map_err(map_err)?;
    Ok(Json(json!({
        "file": meta,
        "content": String::from_utf8_lossy(&payload),
    })))
}

pub async fn meta(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HandlerError> {
    let meta = ctx.files.get_meta(&id).await.map_err(map_err)?;
    Ok(Json(json!({"file": meta})))
}

pub async fn delete(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HandlerError> {
    ctx.files.delete(&id).await.map_err(map_err)?;
    ctx.audit
        .emit(actions::FILE_DELETE, "uploader", "file", &id, Value::Null, None)
        .await;
    Ok(Json(json!({"success": true, "deleted": id})))
}
