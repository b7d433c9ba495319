//! Store-wide settings aggregate.
//!
//! The `settings` key/value rows are loaded once into `StoreSettings` and
//! served from memory. All writes go through `SettingsState::update`, which
//! persists the changed keys and only then publishes the new value.

use serde::Serialize;
use std::sync::RwLock;
use tracing::{debug, info};

use crate::db::{self, DbState};
use crate::error::{ApiError, ApiResult};

pub const KEY_WHATSAPP_NUMBER: &str = "whatsapp_number";
pub const KEY_ESEWA_QR_FILENAME: &str = "esewa_qr_filename";
pub const KEY_ADMIN_TOTP_SECRET: &str = "admin_totp_secret";
pub const KEY_ADMIN_TOTP_PENDING: &str = "admin_totp_pending";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreSettings {
    pub whatsapp_number: String,
    pub esewa_qr_filename: String,
    #[serde(skip)]
    pub admin_totp_secret: Option<String>,
    #[serde(skip)]
    pub admin_totp_pending: Option<String>,
}

impl StoreSettings {
    fn read(conn: &rusqlite::Connection) -> Self {
        let text = |key: &str| db::get_setting(conn, key).unwrap_or_default();
        let secret = |key: &str| db::get_setting(conn, key).filter(|v| !v.trim().is_empty());
        Self {
            whatsapp_number: text(KEY_WHATSAPP_NUMBER),
            esewa_qr_filename: text(KEY_ESEWA_QR_FILENAME),
            admin_totp_secret: secret(KEY_ADMIN_TOTP_SECRET),
            admin_totp_pending: secret(KEY_ADMIN_TOTP_PENDING),
        }
    }

    /// Rows as stored. An absent secret is persisted as an empty value.
    fn rows(&self) -> [(&'static str, &str); 4] {
        [
            (KEY_WHATSAPP_NUMBER, self.whatsapp_number.as_str()),
            (KEY_ESEWA_QR_FILENAME, self.esewa_qr_filename.as_str()),
            (
                KEY_ADMIN_TOTP_SECRET,
                self.admin_totp_secret.as_deref().unwrap_or(""),
            ),
            (
                KEY_ADMIN_TOTP_PENDING,
                self.admin_totp_pending.as_deref().unwrap_or(""),
            ),
        ]
    }

    /// Admin second factor is active once a secret has been promoted.
    pub fn totp_enabled(&self) -> bool {
        self.admin_totp_secret.is_some()
    }

    /// Server-relative path of the payment QR, if one was uploaded.
    pub fn esewa_qr_path(&self) -> Option<String> {
        let name = self.esewa_qr_filename.trim();
        (!name.is_empty()).then(|| format!("/uploads/{name}"))
    }
}

/// Guarded, process-wide settings.
pub struct SettingsState {
    inner: RwLock<StoreSettings>,
}

impl SettingsState {
    pub fn load(db: &DbState) -> ApiResult<Self> {
        let conn = db.lock()?;
        let settings = StoreSettings::read(&conn);
        info!(
            totp_enabled = settings.totp_enabled(),
            "Store settings loaded"
        );
        Ok(Self {
            inner: RwLock::new(settings),
        })
    }

    pub fn snapshot(&self) -> StoreSettings {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Apply `change` to a copy, persist every key it touched in one
    /// transaction, then publish the copy. Returns the new settings.
    pub fn update<F>(&self, db: &DbState, change: F) -> ApiResult<StoreSettings>
    where
        F: FnOnce(&mut StoreSettings) -> ApiResult<()>,
    {
        let mut guard = self
            .inner
            .write()
            .map_err(|e| ApiError::internal("Failed to update settings", e))?;

        let mut next = guard.clone();
        change(&mut next)?;
        if next == *guard {
            return Ok(next);
        }

        let conn = db.lock()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(ApiError::storage("Failed to update settings"))?;
        for ((key, value), (_, old)) in next.rows().iter().zip(guard.rows().iter()) {
            if value != old {
                debug!(key, "Persisting setting");
                db::set_setting(&tx, key, value)
                    .map_err(ApiError::storage("Failed to update settings"))?;
            }
        }
        tx.commit()
            .map_err(ApiError::storage("Failed to update settings"))?;

        *guard = next.clone();
        Ok(next)
    }
}
