use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::info;

use super::blocking;
use super::guards::BackupAccess;
use crate::backup::{self, BackupInfo};
use crate::error::{ApiError, ApiResult};
use crate::AppState;

pub async fn create(State(state): State<AppState>, access: BackupAccess) -> ApiResult<Json<BackupInfo>> {
    let db = state.db.clone();
    let dir = state.config.backup_dir.clone();
    let info = blocking(move || {
        backup::create_backup(&db, &dir).map_err(|e| ApiError::internal("Backup failed", e))
    })
    .await?;
    info!(filename = %info.filename, via = ?access, "Backup requested");
    Ok(Json(info))
}

pub async fn download(State(state): State<AppState>, _access: BackupAccess) -> ApiResult<Response> {
    let path = backup::latest_backup(&state.config.backup_dir)
        .ok_or_else(|| ApiError::not_found("No backup available"))?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("backup.zip")
        .to_string();
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::internal("Failed to read backup", e))?;

    Ok((
        [
            (CONTENT_TYPE, "application/zip".to_string()),
            (CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ],
        Body::from(bytes),
    )
        .into_response())
}
