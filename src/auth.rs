//! Password + session-token authentication with an optional admin TOTP factor.
//!
//! Passwords are bcrypt hashes in `users.password_hash`. Sessions are
//! stateless HS256 JWTs. Admin endpoints additionally accept a static legacy
//! token until a TOTP secret is activated, after which only sessions that
//! completed the second factor (`totp: true`) pass.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::db::DbState;
use crate::error::{ApiError, ApiResult};
use crate::google::GoogleIdentity;
use crate::settings::{SettingsState, StoreSettings};
use crate::totp::{self, Provisioning};
use crate::users::{self, NewUser, User, ROLE_ADMIN, ROLE_USER};
use crate::value_str;

// ---------------------------------------------------------------------------
// Passwords
// ---------------------------------------------------------------------------

pub fn hash_password(password: &str, cost: u32) -> ApiResult<String> {
    bcrypt::hash(password, cost).map_err(|e| ApiError::internal("Failed to hash password", e))
}

/// Compare against a stored hash. A malformed hash counts as a mismatch.
pub fn verify_password(password: &str, hash: &str) -> bool {
    match bcrypt::verify(password, hash) {
        Ok(ok) => ok,
        Err(e) => {
            warn!("bcrypt verify failed: {e}");
            false
        }
    }
}

/// Emails are compared trimmed and lowercased everywhere.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Passwords are taken verbatim; only a missing or empty value is rejected.
fn password_field(payload: &Value) -> Option<&str> {
    payload
        .get("password")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
}

// ---------------------------------------------------------------------------
// Session tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userId")]
    pub user_id: i64,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Admin sessions only: whether the second factor was checked at login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totp: Option<bool>,
    pub iat: i64,
    pub exp: i64,
}

pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenKeys {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            ttl,
        }
    }

    pub fn issue(&self, user: &User, totp: Option<bool>) -> ApiResult<String> {
        let now = Utc::now();
        let claims = Claims {
            user_id: user.id,
            role: user.role.clone(),
            email: Some(user.email.clone()).filter(|e| !e.is_empty()),
            name: user.name.clone().filter(|n| !n.is_empty()),
            totp: if user.role == ROLE_ADMIN { totp } else { None },
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ApiError::internal("Failed to issue token", e))
    }

    /// Any decode failure (signature, expiry, shape) is a plain 401.
    pub fn verify(&self, token: &str) -> ApiResult<Claims> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|_| ApiError::unauthorized())
    }
}

// ---------------------------------------------------------------------------
// Admin gating
// ---------------------------------------------------------------------------

/// How a caller proved admin access.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// Pre-shared `ADMIN_TOKEN` (operational scripts).
    LegacyToken,
    SessionToken(Claims),
}

impl AuthMethod {
    pub fn claims(&self) -> Option<&Claims> {
        match self {
            Self::LegacyToken => None,
            Self::SessionToken(c) => Some(c),
        }
    }
}

/// The one rule for admin endpoints. Once a TOTP secret is active the legacy
/// token stops working and sessions must carry `totp: true`.
pub fn admin_access_allowed(method: &AuthMethod, totp_enabled: bool) -> ApiResult<()> {
    match method {
        AuthMethod::LegacyToken if totp_enabled => Err(ApiError::unauthorized()),
        AuthMethod::LegacyToken => Ok(()),
        AuthMethod::SessionToken(c) if c.role != ROLE_ADMIN => {
            Err(ApiError::Forbidden("Admin only".into()))
        }
        AuthMethod::SessionToken(c) if totp_enabled && c.totp != Some(true) => Err(
            ApiError::Unauthorized("Two-factor authentication required".into()),
        ),
        AuthMethod::SessionToken(_) => Ok(()),
    }
}

/// Compare a supplied static token with the configured one. Unset means the
/// path is disabled.
pub fn static_token_matches(expected: Option<&str>, supplied: Option<&str>) -> bool {
    match (expected, supplied) {
        (Some(expected), Some(supplied)) => {
            let (a, b) = (expected.as_bytes(), supplied.trim().as_bytes());
            a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Sign-up / sign-in
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: User,
}

/// Second factor for a sign-in. Returns the `totp` claim to embed.
fn check_second_factor(
    user: &User,
    settings: &StoreSettings,
    otp: Option<&str>,
) -> ApiResult<Option<bool>> {
    if user.role != ROLE_ADMIN {
        return Ok(None);
    }
    let Some(secret) = settings.admin_totp_secret.as_deref() else {
        return Ok(Some(false));
    };
    let otp = otp
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("OTP required".into()))?;
    if !totp::verify(secret, otp) {
        warn!(user_id = user.id, "Admin login rejected: invalid OTP");
        return Err(ApiError::Unauthorized("Invalid OTP".into()));
    }
    Ok(Some(true))
}

/// Self-registration. New accounts always get the `user` role.
pub fn register(db: &DbState, keys: &TokenKeys, cost: u32, payload: &Value) -> ApiResult<AuthResponse> {
    let email = value_str(payload, &["email"]).map(|e| normalize_email(&e));
    let (Some(email), Some(password)) = (email, password_field(payload)) else {
        return Err(ApiError::bad_request("Email and password are required"));
    };

    let password_hash = hash_password(password, cost)?;
    let conn = db.lock()?;
    let user = users::insert_user(
        &conn,
        &NewUser {
            name: value_str(payload, &["name"]).unwrap_or_default(),
            email,
            password_hash,
            phone: value_str(payload, &["phone"]).unwrap_or_default(),
            whatsapp: value_str(payload, &["whatsapp"]).unwrap_or_default(),
            role: ROLE_USER.to_string(),
        },
    )?;
    drop(conn);

    info!(user_id = user.id, "User registered");
    let token = keys.issue(&user, None)?;
    Ok(AuthResponse { token, user })
}

/// Email + password sign-in. Admins with active 2FA must include `otp`.
pub fn login(
    db: &DbState,
    keys: &TokenKeys,
    settings: &StoreSettings,
    payload: &Value,
) -> ApiResult<AuthResponse> {
    let email = value_str(payload, &["email"]).map(|e| normalize_email(&e));
    let (Some(email), Some(password)) = (email, password_field(payload)) else {
        return Err(ApiError::bad_request("Email and password are required"));
    };

    let found = {
        let conn = db.lock()?;
        users::find_with_hash(&conn, &email)?
    };
    let invalid = || ApiError::Unauthorized("Invalid credentials".into());
    let (user, hash) = found.ok_or_else(invalid)?;
    if !verify_password(password, &hash) {
        return Err(invalid());
    }

    let otp = value_str(payload, &["otp", "code"]);
    let totp = check_second_factor(&user, settings, otp.as_deref())?;
    let token = keys.issue(&user, totp)?;
    info!(user_id = user.id, role = %user.role, "User logged in");
    Ok(AuthResponse { token, user })
}

/// Sign in with a verified Google identity, creating the account on first use.
pub fn google_login(
    db: &DbState,
    keys: &TokenKeys,
    settings: &StoreSettings,
    cost: u32,
    identity: &GoogleIdentity,
    otp: Option<&str>,
) -> ApiResult<AuthResponse> {
    let email = normalize_email(&identity.email);
    let existing = {
        let conn = db.lock()?;
        users::find_with_hash(&conn, &email)?
    };

    let user = match existing {
        Some((user, _)) => user,
        None => {
            // Google accounts never sign in with a password; store an unusable one.
            let password_hash = hash_password(&uuid::Uuid::new_v4().to_string(), cost)?;
            let conn = db.lock()?;
            let user = users::insert_user(
                &conn,
                &NewUser {
                    name: identity.name.clone().unwrap_or_default(),
                    email,
                    password_hash,
                    phone: String::new(),
                    whatsapp: String::new(),
                    role: ROLE_USER.to_string(),
                },
            )?;
            info!(user_id = user.id, "User created from Google sign-in");
            user
        }
    };

    let totp = check_second_factor(&user, settings, otp)?;
    let token = keys.issue(&user, totp)?;
    Ok(AuthResponse { token, user })
}

// ---------------------------------------------------------------------------
// Admin TOTP enrollment
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TotpStatus {
    pub enabled: bool,
    pub pending: bool,
}

pub fn totp_status(settings: &StoreSettings) -> TotpStatus {
    TotpStatus {
        enabled: settings.admin_totp_secret.is_some(),
        pending: settings.admin_totp_pending.is_some(),
    }
}

/// Phase one: stash a new pending secret. The active secret, if any, stays in
/// force until `confirm_totp_enrollment` succeeds.
pub fn start_totp_enrollment(
    db: &DbState,
    settings: &SettingsState,
    issuer: &str,
    account: &str,
) -> ApiResult<Provisioning> {
    let secret = totp::generate_secret().map_err(|e| ApiError::internal("Failed to start 2FA", e))?;
    let provisioning = totp::provisioning(&secret, issuer, account)
        .map_err(|e| ApiError::internal("Failed to start 2FA", e))?;

    settings.update(db, |s| {
        s.admin_totp_pending = Some(secret);
        Ok(())
    })?;
    info!("Admin 2FA enrollment started");
    Ok(provisioning)
}

/// Phase two: promote the pending secret if `otp` matches it.
pub fn confirm_totp_enrollment(db: &DbState, settings: &SettingsState, otp: &str) -> ApiResult<()> {
    settings.update(db, |s| {
        let pending = s
            .admin_totp_pending
            .clone()
            .ok_or_else(|| ApiError::bad_request("No pending 2FA enrollment"))?;
        if !totp::verify(&pending, otp) {
            return Err(ApiError::bad_request("Invalid OTP"));
        }
        s.admin_totp_secret = Some(pending);
        s.admin_totp_pending = None;
        Ok(())
    })?;
    info!("Admin 2FA enabled");
    Ok(())
}

/// Turn the second factor off. Requires a current code for the active secret.
pub fn disable_totp(db: &DbState, settings: &SettingsState, otp: &str) -> ApiResult<()> {
    settings.update(db, |s| {
        let active = s
            .admin_totp_secret
            .as_deref()
            .ok_or_else(|| ApiError::bad_request("Two-factor authentication is not enabled"))?;
        if !totp::verify(active, otp) {
            return Err(ApiError::bad_request("Invalid OTP"));
        }
        s.admin_totp_secret = None;
        s.admin_totp_pending = None;
        Ok(())
    })?;
    warn!("Admin 2FA disabled");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    const COST: u32 = 4;

    fn keys() -> TokenKeys {
        TokenKeys::new("test-secret", Duration::hours(1))
    }

    fn setup() -> (DbState, SettingsState) {
        let db = db::open_in_memory().unwrap();
        let settings = SettingsState::load(&db).unwrap();
        (db, settings)
    }

    fn make_admin(db: &DbState, email: &str, password: &str) -> User {
        let conn = db.lock().unwrap();
        users::insert_user(
            &conn,
            &NewUser {
                name: "Admin".into(),
                email: email.into(),
                password_hash: hash_password(password, COST).unwrap(),
                phone: String::new(),
                whatsapp: String::new(),
                role: ROLE_ADMIN.into(),
            },
        )
        .unwrap()
    }

    fn session(role: &str, totp: Option<bool>) -> AuthMethod {
        AuthMethod::SessionToken(Claims {
            user_id: 1,
            role: role.into(),
            email: None,
            name: None,
            totp,
            iat: 0,
            exp: i64::MAX,
        })
    }

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("hunter22", COST).unwrap();
        assert!(verify_password("hunter22", &hash));
        assert!(!verify_password("hunter23", &hash));
        assert!(!verify_password("hunter22", "not-a-bcrypt-hash"));
    }

    #[test]
    fn test_token_round_trip_and_tamper() {
        let keys = keys();
        let user = User {
            id: 7,
            name: Some("Sita".into()),
            email: "sita@example.com".into(),
            phone: None,
            whatsapp: None,
            role: ROLE_USER.into(),
            created_at: None,
            updated_at: None,
        };
        let token = keys.issue(&user, Some(true)).unwrap();
        let claims = keys.verify(&token).unwrap();
        assert_eq!(claims.user_id, 7);
        assert_eq!(claims.role, ROLE_USER);
        // Non-admin tokens never carry the totp flag.
        assert_eq!(claims.totp, None);

        let other = TokenKeys::new("different-secret", Duration::hours(1));
        assert!(other.verify(&token).is_err());
        assert!(keys.verify("garbage").is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let keys = TokenKeys::new("test-secret", Duration::hours(-2));
        let user = User {
            id: 1,
            name: None,
            email: "a@b.c".into(),
            phone: None,
            whatsapp: None,
            role: ROLE_USER.into(),
            created_at: None,
            updated_at: None,
        };
        let token = keys.issue(&user, None).unwrap();
        assert!(matches!(keys.verify(&token), Err(ApiError::Unauthorized(_))));
    }

    #[test]
    fn test_admin_gate_without_totp() {
        assert!(admin_access_allowed(&AuthMethod::LegacyToken, false).is_ok());
        assert!(admin_access_allowed(&session(ROLE_ADMIN, Some(false)), false).is_ok());
        assert!(matches!(
            admin_access_allowed(&session(ROLE_USER, None), false),
            Err(ApiError::Forbidden(_))
        ));
    }

    #[test]
    fn test_admin_gate_with_totp() {
        assert!(matches!(
            admin_access_allowed(&AuthMethod::LegacyToken, true),
            Err(ApiError::Unauthorized(_))
        ));
        assert!(matches!(
            admin_access_allowed(&session(ROLE_ADMIN, Some(false)), true),
            Err(ApiError::Unauthorized(_))
        ));
        assert!(matches!(
            admin_access_allowed(&session(ROLE_ADMIN, None), true),
            Err(ApiError::Unauthorized(_))
        ));
        assert!(admin_access_allowed(&session(ROLE_ADMIN, Some(true)), true).is_ok());
    }

    #[test]
    fn test_static_token_matching() {
        assert!(static_token_matches(Some("s3cret"), Some("s3cret")));
        assert!(!static_token_matches(Some("s3cret"), Some("s3cre")));
        assert!(!static_token_matches(Some("s3cret"), None));
        assert!(!static_token_matches(None, Some("s3cret")));
    }

    #[test]
    fn test_register_then_login_role_matches() {
        let (db, settings) = setup();
        let keys = keys();
        let reg = register(
            &db,
            &keys,
            COST,
            &json!({ "email": " New@Example.com ", "password": "pass1234", "name": "New" }),
        )
        .unwrap();
        assert_eq!(reg.user.email, "new@example.com");

        let out = login(
            &db,
            &keys,
            &settings.snapshot(),
            &json!({ "email": "NEW@example.com", "password": "pass1234" }),
        )
        .unwrap();
        let claims = keys.verify(&out.token).unwrap();
        assert_eq!(claims.role, out.user.role);
        assert_eq!(claims.role, ROLE_USER);
    }

    #[test]
    fn test_register_duplicate_email_conflict() {
        let (db, _) = setup();
        let keys = keys();
        register(&db, &keys, COST, &json!({ "email": "dup@example.com", "password": "x1" })).unwrap();
        let err = register(&db, &keys, COST, &json!({ "email": "DUP@Example.com", "password": "x2" }))
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[test]
    fn test_login_failures_are_uniform() {
        let (db, settings) = setup();
        let keys = keys();
        make_admin(&db, "boss@example.com", "right-pass");

        let missing = login(&db, &keys, &settings.snapshot(), &json!({ "email": "boss@example.com" }));
        assert!(matches!(missing, Err(ApiError::BadRequest(_))));

        let wrong = login(
            &db,
            &keys,
            &settings.snapshot(),
            &json!({ "email": "boss@example.com", "password": "nope" }),
        )
        .unwrap_err();
        let unknown = login(
            &db,
            &keys,
            &settings.snapshot(),
            &json!({ "email": "ghost@example.com", "password": "nope" }),
        )
        .unwrap_err();
        assert_eq!(wrong.to_string(), unknown.to_string());
        assert_eq!(wrong.to_string(), "Invalid credentials");
    }

    #[test]
    fn test_totp_enrollment_and_login() {
        let (db, settings) = setup();
        let keys = keys();
        make_admin(&db, "boss@example.com", "right-pass");

        // Before enrollment an admin gets totp:false.
        let before = login(
            &db,
            &keys,
            &settings.snapshot(),
            &json!({ "email": "boss@example.com", "password": "right-pass" }),
        )
        .unwrap();
        let old_claims = keys.verify(&before.token).unwrap();
        assert_eq!(old_claims.totp, Some(false));

        start_totp_enrollment(&db, &settings, "SoftUpakaran", "boss@example.com").unwrap();
        assert!(!settings.snapshot().totp_enabled(), "pending secret is not active");

        let pending = settings.snapshot().admin_totp_pending.unwrap();
        assert!(confirm_totp_enrollment(&db, &settings, "000000x").is_err());
        let code = totp::current_code(&pending).unwrap();
        confirm_totp_enrollment(&db, &settings, &code).unwrap();
        let snap = settings.snapshot();
        assert!(snap.totp_enabled());
        assert!(snap.admin_totp_pending.is_none());

        // The pre-2FA session no longer passes the admin gate.
        assert!(admin_access_allowed(&AuthMethod::SessionToken(old_claims), true).is_err());

        let no_otp = login(
            &db,
            &keys,
            &snap,
            &json!({ "email": "boss@example.com", "password": "right-pass" }),
        );
        assert!(matches!(no_otp, Err(ApiError::Unauthorized(m)) if m == "OTP required"));

        let code = totp::current_code(&pending).unwrap();
        let ok = login(
            &db,
            &keys,
            &snap,
            &json!({ "email": "boss@example.com", "password": "right-pass", "otp": code }),
        )
        .unwrap();
        let claims = keys.verify(&ok.token).unwrap();
        assert_eq!(claims.totp, Some(true));
        assert!(admin_access_allowed(&AuthMethod::SessionToken(claims), true).is_ok());

        let code = totp::current_code(&pending).unwrap();
        disable_totp(&db, &settings, &code).unwrap();
        assert!(!settings.snapshot().totp_enabled());
    }

    #[test]
    fn test_google_login_creates_then_reuses_user() {
        let (db, settings) = setup();
        let keys = keys();
        let identity = GoogleIdentity {
            email: "Gamer@Gmail.com".into(),
            name: Some("Gamer".into()),
            subject: "sub-1".into(),
        };
        let first = google_login(&db, &keys, &settings.snapshot(), COST, &identity, None).unwrap();
        let second = google_login(&db, &keys, &settings.snapshot(), COST, &identity, None).unwrap();
        assert_eq!(first.user.id, second.user.id);
        assert_eq!(first.user.email, "gamer@gmail.com");
        assert_eq!(first.user.role, ROLE_USER);
    }
}
