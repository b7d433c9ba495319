//! SoftUpakaran storefront API.
//!
//! An axum server over a single SQLite file: public catalog and checkout
//! log, customer accounts and feedback, and an admin console surface with
//! optional TOTP second factor. Domain modules take `&DbState`; `routes`
//! adapts them to HTTP.

pub mod auth;
pub mod backup;
pub mod blog;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod feedback;
pub mod google;
pub mod orders;
pub mod routes;
pub mod settings;
pub mod totp;
pub mod uploads;
pub mod users;

use anyhow::Context;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::auth::TokenKeys;
use crate::config::Config;
use crate::db::DbState;
use crate::google::{CredentialVerifier, GoogleTokenInfo};
use crate::settings::SettingsState;

const LOG_FILE_PREFIX: &str = "softupakaran-api";
const MAX_LOG_FILES: usize = 10;

/// Shared handles passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbState>,
    pub settings: Arc<SettingsState>,
    pub tokens: Arc<TokenKeys>,
    pub config: Arc<Config>,
    pub google: Arc<dyn CredentialVerifier>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: DbState,
        google: Arc<dyn CredentialVerifier>,
    ) -> Result<Self, String> {
        let settings = SettingsState::load(&db).map_err(|e| e.to_string())?;
        let tokens = TokenKeys::new(&config.jwt_secret, config.token_ttl);
        Ok(Self {
            db: Arc::new(db),
            settings: Arc::new(settings),
            tokens: Arc::new(tokens),
            config: Arc::new(config),
            google,
        })
    }
}

// ---------------------------------------------------------------------------
// JSON payload helpers
// ---------------------------------------------------------------------------

/// First non-blank string under any of `keys`, trimmed.
pub(crate) fn value_str(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// First integer under any of `keys`. Numeric strings count; fractions truncate.
pub(crate) fn value_i64(v: &Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        let parsed = match v.get(*key) {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
            Some(Value::String(s)) => parse_int(s),
            _ => None,
        };
        if parsed.is_some() {
            return parsed;
        }
    }
    None
}

/// First value under any of `keys` that is present and not `null`.
pub(crate) fn present_value<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| v.get(*key))
        .find(|x| !x.is_null())
}

/// Lenient integer parse for query strings: `"12"`, `" 12 "`, `"12.9"`.
pub(crate) fn parse_int(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse::<i64>().ok().or_else(|| {
        raw.parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|f| f.trunc() as i64)
    })
}

/// Lowercase ASCII slug: runs of anything else collapse to one `-`.
pub(crate) fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Delete rolled log files beyond the newest `MAX_LOG_FILES`.
fn prune_old_logs(log_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return;
    };
    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX))
        })
        .map(|e| {
            let modified = e
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            (e.path(), modified)
        })
        .collect();

    log_files.sort_by(|a, b| b.1.cmp(&a.1));
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = std::fs::remove_file(path) {
            eprintln!("Failed to prune log {}: {e}", path.display());
        }
    }
}

/// Console + daily rolling file output, filtered by `RUST_LOG`. The file
/// gets JSON lines when `json` is set.
fn init_logging(log_dir: &Path, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,softupakaran_api_lib=debug"));

    prune_old_logs(log_dir);
    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let (text_file, json_file) = if json {
        (None, Some(fmt::layer().json().with_writer(non_blocking).with_target(true)))
    } else {
        let layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true);
        (Some(layer), None)
    };
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(text_file)
        .with(json_file)
        .init();

    // The guard flushes on drop; the server runs until the process exits.
    std::mem::forget(guard);
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env();
    init_logging(&config.log_dir, config.log_json);
    info!("Starting SoftUpakaran API v{}", env!("CARGO_PKG_VERSION"));
    config.log_warnings();

    let db = db::init(&config.database_file)
        .map_err(anyhow::Error::msg)
        .context("Failed to open database")?;
    if let Err(e) = users::ensure_admin_user(&db, &config) {
        error!("Failed to ensure admin user: {e}");
    }

    std::fs::create_dir_all(&config.uploads_dir)
        .with_context(|| format!("Failed to create {}", config.uploads_dir.display()))?;

    let google = GoogleTokenInfo::new(config.google_client_id.clone()).map_err(anyhow::Error::msg)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = AppState::new(config, db, Arc::new(google)).map_err(anyhow::Error::msg)?;
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("SoftUpakaran API listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}
