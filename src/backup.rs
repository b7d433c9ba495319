//! Database snapshots.
//!
//! `VACUUM INTO` produces a consistent copy of the live database without
//! stopping writers for longer than the copy itself. The copy is zipped with
//! a small manifest; only the newest `MAX_BACKUPS` archives are kept.

use serde::Serialize;
use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::db::{self, DbState};

pub const BACKUP_PREFIX: &str = "softupakaran-db-";
pub const MAX_BACKUPS: usize = 10;
const SNAPSHOT_ENTRY: &str = "softupakaran.db";
const COUNTED_TABLES: &[&str] = &["categories", "products", "orders", "users", "feedback", "blog_posts"];

#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub ok: bool,
    pub filename: String,
    pub size_bytes: u64,
    pub created_at: String,
}

/// Snapshot the database into `backup_dir` and prune old archives.
pub fn create_backup(db: &DbState, backup_dir: &Path) -> Result<BackupInfo, String> {
    fs::create_dir_all(backup_dir).map_err(|e| format!("Failed to create backup dir: {e}"))?;

    let now = chrono::Utc::now();
    let timestamp = now.format("%Y%m%d-%H%M%S-%3f").to_string();
    let zip_name = format!("{BACKUP_PREFIX}{timestamp}.zip");
    let zip_path = backup_dir.join(&zip_name);
    let snapshot_path = backup_dir.join(format!(".snapshot-{}.db", uuid::Uuid::new_v4()));

    let manifest = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let target = snapshot_path.to_string_lossy().to_string();
        conn.execute("VACUUM INTO ?1", [&target])
            .map_err(|e| format!("Snapshot failed: {e}"))?;

        let mut counts = serde_json::Map::new();
        for table in COUNTED_TABLES {
            let n: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap_or(-1);
            counts.insert(table.to_string(), json!(n));
        }
        json!({
            "app": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "created_at": now.to_rfc3339(),
            "schema_version": db::schema_version(&conn),
            "source": db.db_path.to_string_lossy(),
            "row_counts": counts,
        })
    };

    let result = write_archive(&zip_path, &snapshot_path, &manifest);
    if let Err(e) = fs::remove_file(&snapshot_path) {
        warn!("Failed to remove snapshot temp file: {e}");
    }
    if let Err(e) = result {
        let _ = fs::remove_file(&zip_path);
        return Err(e);
    }

    let size_bytes = fs::metadata(&zip_path).map(|m| m.len()).unwrap_or(0);
    info!(filename = %zip_name, size_bytes, "Database backup created");
    prune_backups(backup_dir, MAX_BACKUPS);

    Ok(BackupInfo {
        ok: true,
        filename: zip_name,
        size_bytes,
        created_at: now.to_rfc3339(),
    })
}

fn write_archive(zip_path: &Path, snapshot: &Path, manifest: &serde_json::Value) -> Result<(), String> {
    let file =
        fs::File::create(zip_path).map_err(|e| format!("Failed to create backup zip: {e}"))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let manifest_text = serde_json::to_string_pretty(manifest).map_err(|e| e.to_string())?;
    zip.start_file("manifest.json", options)
        .map_err(|e| format!("zip manifest: {e}"))?;
    zip.write_all(manifest_text.as_bytes())
        .map_err(|e| format!("zip manifest: {e}"))?;

    let mut source =
        fs::File::open(snapshot).map_err(|e| format!("Failed to open snapshot: {e}"))?;
    zip.start_file(SNAPSHOT_ENTRY, options)
        .map_err(|e| format!("zip snapshot: {e}"))?;
    std::io::copy(&mut source, &mut zip).map_err(|e| format!("zip snapshot: {e}"))?;

    zip.finish().map_err(|e| format!("zip finish: {e}"))?;
    Ok(())
}

/// Backup archives in `dir`, newest first. Names embed a sortable timestamp.
pub fn list_backups(dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(BACKUP_PREFIX) && n.ends_with(".zip"))
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    found.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    found
}

pub fn latest_backup(dir: &Path) -> Option<PathBuf> {
    list_backups(dir).into_iter().next()
}

fn prune_backups(dir: &Path, keep: usize) {
    for path in list_backups(dir).iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => info!("Pruned old backup: {}", path.display()),
            Err(e) => warn!("Failed to prune backup {}: {e}", path.display()),
        }
    }
}
