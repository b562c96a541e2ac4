//! Files API facade. Uploads are measured and recorded; content is discarded.

use std::collections::HashMap;
use std::sync::RwLock;

use axum::Json;
use axum::extract::{Multipart, Path, Query, State};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::logging::new_request_id;
use crate::openai::unix_now;

use super::SharedService;

const PURPOSES: &[&str] = &["assistants", "batch", "fine-tune", "vision", "user_data", "evals"];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileObject {
    pub id: String,
    pub object: &'static str,
    pub bytes: u64,
    pub created_at: i64,
    pub filename: String,
    pub purpose: String,
}

#[derive(Debug, Serialize)]
pub struct FileList {
    pub object: &'static str,
    pub data: Vec<FileObject>,
}

#[derive(Debug, Serialize)]
pub struct FileDeleted {
    pub id: String,
    pub object: &'static str,
    pub deleted: bool,
}

/// Metadata of uploaded files, kept for the life of the process.
#[derive(Debug, Default)]
pub struct FileRegistry {
    files: RwLock<HashMap<String, FileObject>>,
}

impl FileRegistry {
    pub fn insert(&self, file: FileObject) {
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files.insert(file.id.clone(), file);
    }

    pub fn get(&self, id: &str) -> Option<FileObject> {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files.get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<FileObject> {
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files.remove(id)
    }

    /// Oldest first; `purpose` filters when given.
    pub fn list(&self, purpose: Option<&str>) -> Vec<FileObject> {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<FileObject> = files
            .values()
            .filter(|f| purpose.is_none_or(|p| f.purpose == p))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }
}

fn not_found(id: &str) -> ApiError {
    ApiError::NotFound(format!("No file with id '{id}' found"))
}

pub(super) async fn upload(
    State(svc): State<SharedService>,
    mut multipart: Multipart,
) -> ApiResult<Json<FileObject>> {
    let request_id = new_request_id();
    let mut purpose: Option<String> = None;
    let mut file: Option<(String, u64)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::invalid("Failed to parse multipart form"))?
    {
        match field.name() {
            Some("purpose") => {
                let text = field
                    .text()
                    .await
                    .map_err(|_| ApiError::invalid("Failed to parse multipart form"))?;
                purpose = Some(text);
            }
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|_| ApiError::Internal("Failed to read file".to_string()))?;
                file = Some((filename, bytes.len() as u64));
            }
            _ => {}
        }
    }

    let purpose = purpose
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::missing("purpose"))?;
    if !PURPOSES.contains(&purpose.as_str()) {
        return Err(ApiError::invalid(format!("Invalid purpose: {purpose}")));
    }
    let (filename, bytes) = file.ok_or_else(|| ApiError::missing("file"))?;

    let object = FileObject {
        id: format!("file-{}", uuid::Uuid::new_v4().simple()),
        object: "file",
        bytes,
        created_at: unix_now(),
        filename,
        purpose,
    };
    info!(
        "[{}] ⇣ FILE UPLOAD filename={} size={} purpose={} file_id={}",
        request_id, object.filename, object.bytes, object.purpose, object.id
    );
    svc.files.insert(object.clone());
    Ok(Json(object))
}

#[derive(Debug, Deserialize)]
pub(super) struct ListQuery {
    purpose: Option<String>,
}

pub(super) async fn list(State(svc): State<SharedService>, Query(q): Query<ListQuery>) -> Json<FileList> {
    let purpose = q.purpose.as_deref().filter(|p| !p.is_empty());
    Json(FileList {
        object: "list",
        data: svc.files.list(purpose),
    })
}

pub(super) async fn get(State(svc): State<SharedService>, Path(id): Path<String>) -> ApiResult<Json<FileObject>> {
    svc.files.get(&id).map(Json).ok_or_else(|| not_found(&id))
}

pub(super) async fn delete(
    State(svc): State<SharedService>,
    Path(id): Path<String>,
) -> ApiResult<Json<FileDeleted>> {
    let removed = svc.files.remove(&id).ok_or_else(|| not_found(&id))?;
    info!("file deleted id={} filename={}", removed.id, removed.filename);
    Ok(Json(FileDeleted {
        id: removed.id,
        object: "file",
        deleted: true,
    }))
}

pub(super) async fn content(State(svc): State<SharedService>, Path(id): Path<String>) -> ApiResult<()> {
    if svc.files.get(&id).is_none() {
        return Err(not_found(&id));
    }
    Err(ApiError::NotImplemented(
        "File content is not available. This proxy does not persist uploaded files.".to_string(),
    ))
}
