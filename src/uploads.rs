//! Multipart uploads written under the uploads directory.
//!
//! The server picks every filename (`<prefix>-<millis><ext>`); only the
//! extension comes from the client, and only if it looks like one. Files are
//! streamed to disk and removed again if they cross the size limit.

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::Multipart;
use axum::http::StatusCode;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::error::{ApiError, ApiResult};

pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_EXTENSION: &str = ".png";
const MAX_EXTENSION_CHARS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    EsewaQr,
    ProductImage,
}

impl UploadKind {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::EsewaQr => "esewa-qr",
            Self::ProductImage => "product",
        }
    }

    /// Multipart field carrying the file.
    pub fn field(self) -> &'static str {
        match self {
            Self::EsewaQr => "qr",
            Self::ProductImage => "image",
        }
    }

    fn missing_message(self) -> &'static str {
        match self {
            Self::EsewaQr => "Missing file",
            Self::ProductImage => "Missing image",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub filename: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl StoredUpload {
    /// Path under which the static file service exposes this upload.
    pub fn url_path(&self) -> String {
        format!("/uploads/{}", self.filename)
    }
}

/// Lowercased extension of the client filename, or `.png` when it is
/// missing, too long or not purely alphanumeric.
pub fn extension_for(original: Option<&str>) -> String {
    original
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .filter(|ext| {
            !ext.is_empty()
                && ext.chars().count() <= MAX_EXTENSION_CHARS
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map(|ext| format!(".{ext}"))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

/// `attempt` 0 is the plain name; later attempts add `-<attempt + 1>`.
pub fn stored_filename(kind: UploadKind, millis: i64, ext: &str, attempt: u32) -> String {
    if attempt == 0 {
        format!("{}-{millis}{ext}", kind.prefix())
    } else {
        format!("{}-{millis}-{}{ext}", kind.prefix(), attempt + 1)
    }
}

/// Create a new file without ever replacing an existing upload.
async fn create_unique(dir: &Path, kind: UploadKind, ext: &str) -> ApiResult<(String, PathBuf, File)> {
    let millis = Utc::now().timestamp_millis();
    for attempt in 0..100 {
        let filename = stored_filename(kind, millis, ext, attempt);
        let path = dir.join(&filename);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((filename, path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(ApiError::internal("Failed to save upload", e)),
        }
    }
    Err(ApiError::internal(
        "Failed to save upload",
        "no free filename after 100 attempts",
    ))
}

fn multipart_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge("File too large".into())
    } else {
        warn!("Rejected multipart body: {}", e.body_text());
        ApiError::bad_request("Invalid multipart body")
    }
}

async fn write_field(mut field: Field<'_>, file: &mut File, path: &Path) -> ApiResult<u64> {
    let mut written: usize = 0;
    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => return Err(multipart_error(e)),
        };
        written += chunk.len();
        if written > MAX_UPLOAD_BYTES {
            warn!(path = %path.display(), "Upload exceeded {MAX_UPLOAD_BYTES} bytes");
            return Err(ApiError::PayloadTooLarge("File too large (max 5 MB)".into()));
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| ApiError::internal("Failed to save upload", e))?;
    }
    file.flush()
        .await
        .map_err(|e| ApiError::internal("Failed to save upload", e))?;
    Ok(written as u64)
}

/// Find the kind's field in the form and stream it into `dir`.
pub async fn save_upload(
    dir: &Path,
    kind: UploadKind,
    multipart: &mut Multipart,
) -> ApiResult<StoredUpload> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| ApiError::internal("Failed to save upload", e))?;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(kind.field()) {
            continue;
        }
        let ext = extension_for(field.file_name());
        let (filename, path, mut file) = create_unique(dir, kind, &ext).await?;

        match write_field(field, &mut file, &path).await {
            Ok(size_bytes) => {
                info!(filename = %filename, size_bytes, "Upload stored");
                return Ok(StoredUpload {
                    filename,
                    path,
                    size_bytes,
                });
            }
            Err(err) => {
                drop(file);
                if let Err(e) = fs::remove_file(&path).await {
                    error!(path = %path.display(), "Failed to remove partial upload: {e}");
                }
                return Err(err);
            }
        }
    }

    Err(ApiError::bad_request(kind.missing_message()))
}
