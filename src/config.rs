//! Runtime configuration for the storefront API.
//!
//! Everything is read from the process environment once at startup. A `.env`
//! file in the working directory is honoured (see `lib::run`). Bad values
//! fall back to their defaults with a warning instead of aborting. The
//! config is read before logging exists, so warnings are kept on the
//! `Config` and emitted by `log_warnings` once the subscriber is up.

use chrono::Duration;
use std::path::PathBuf;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_JWT_SECRET: &str = "dev_secret_change_me";
pub const DEFAULT_BCRYPT_COST: u32 = 10;
pub const DEFAULT_ADMIN_PASSWORD: &str = "admin12345";
const DEFAULT_TOKEN_TTL: &str = "7d";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_file: PathBuf,
    pub uploads_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub log_dir: PathBuf,
    /// `LOG_FORMAT=json` writes the log file as JSON lines.
    pub log_json: bool,
    pub jwt_secret: String,
    pub token_ttl: Duration,
    /// Legacy pre-shared admin secret (`X-Admin-Token` / `?token=`).
    pub admin_token: Option<String>,
    /// Secret that only unlocks the backup endpoints.
    pub backup_token: Option<String>,
    pub admin_email: String,
    pub admin_password: String,
    pub google_client_id: Option<String>,
    pub bcrypt_cost: u32,
    pub totp_issuer: String,
    pub public_base_url: Option<String>,
    pub warnings: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_file: PathBuf::from("data").join("softupakaran.db"),
            uploads_dir: PathBuf::from("uploads"),
            backup_dir: PathBuf::from("backups"),
            log_dir: PathBuf::from("logs"),
            log_json: false,
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            token_ttl: Duration::days(7),
            admin_token: None,
            backup_token: None,
            admin_email: "admin@softupakaran.local".to_string(),
            admin_password: DEFAULT_ADMIN_PASSWORD.to_string(),
            google_client_id: None,
            bcrypt_cost: DEFAULT_BCRYPT_COST,
            totp_issuer: "SoftUpakaran".to_string(),
            public_base_url: None,
            warnings: Vec::new(),
        }
    }
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();
        let mut warnings = Vec::new();

        let port = match get("PORT") {
            Some(raw) => raw.parse::<u16>().unwrap_or_else(|_| {
                warnings.push(format!("PORT {raw:?} is not a valid port, using {DEFAULT_PORT}"));
                DEFAULT_PORT
            }),
            None => DEFAULT_PORT,
        };

        let token_ttl = match get("JWT_EXPIRES_IN") {
            Some(raw) => parse_duration(&raw).unwrap_or_else(|| {
                warnings.push(format!(
                    "JWT_EXPIRES_IN {raw:?} is not a valid duration, using {DEFAULT_TOKEN_TTL}"
                ));
                defaults.token_ttl
            }),
            None => defaults.token_ttl,
        };

        let bcrypt_cost = match get("BCRYPT_COST") {
            Some(raw) => match raw.parse::<u32>() {
                Ok(cost) => cost.clamp(4, 31),
                Err(_) => {
                    warnings.push(format!(
                        "BCRYPT_COST {raw:?} is not a number, using {DEFAULT_BCRYPT_COST}"
                    ));
                    DEFAULT_BCRYPT_COST
                }
            },
            None => DEFAULT_BCRYPT_COST,
        };

        let log_json = match get("LOG_FORMAT").map(|f| f.to_ascii_lowercase()).as_deref() {
            None | Some("text") => false,
            Some("json") => true,
            Some(other) => {
                warnings.push(format!("LOG_FORMAT {other:?} is not text or json, using text"));
                false
            }
        };

        let jwt_secret = get("JWT_SECRET").unwrap_or(defaults.jwt_secret);
        if jwt_secret == DEFAULT_JWT_SECRET {
            warnings.push("JWT_SECRET is not set; using the development secret".to_string());
        }

        Self {
            port,
            database_file: get("DATABASE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_file),
            uploads_dir: get("UPLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.uploads_dir),
            backup_dir: get("BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.backup_dir),
            log_dir: get("LOG_DIR").map(PathBuf::from).unwrap_or(defaults.log_dir),
            log_json,
            jwt_secret,
            token_ttl,
            admin_token: get("ADMIN_TOKEN"),
            backup_token: get("BACKUP_TOKEN"),
            admin_email: get("ADMIN_EMAIL")
                .map(|e| e.to_lowercase())
                .unwrap_or(defaults.admin_email),
            admin_password: get("ADMIN_PASSWORD").unwrap_or(defaults.admin_password),
            google_client_id: get("GOOGLE_CLIENT_ID"),
            bcrypt_cost,
            totp_issuer: get("TOTP_ISSUER").unwrap_or(defaults.totp_issuer),
            public_base_url: get("PUBLIC_BASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            warnings,
        }
    }

    pub fn log_warnings(&self) {
        for warning in &self.warnings {
            warn!("{warning}");
        }
    }
}

/// Parse `7d`, `12h`, `30m`, `45s` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (digits, unit) = match raw.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&raw[..idx], Some(c.to_ascii_lowercase())),
        _ => (raw, None),
    };
    let n: i64 = digits.trim().parse().ok().filter(|n| *n > 0)?;
    match unit {
        None | Some('s') => Some(Duration::seconds(n)),
        Some('m') => Some(Duration::minutes(n)),
        Some('h') => Some(Duration::hours(n)),
        Some('d') => Some(Duration::days(n)),
        _ => None,
    }
}
