//! Time-based one-time passwords for the admin second factor.
//!
//! RFC 6238 defaults: SHA-1, 6 digits, 30 second step. Verification accepts
//! the adjacent step on either side to absorb clock drift.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use qrcode::render::svg::Color;
use qrcode::QrCode;
use totp_rs::{Algorithm, Secret, TOTP};

const DIGITS: usize = 6;
const SKEW: u8 = 1;
const STEP_SECONDS: u64 = 30;

/// What the admin console needs to enroll an authenticator app.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Provisioning {
    /// Base32 secret, also embedded in the URI.
    pub secret: String,
    pub otpauth_url: String,
    /// `data:image/svg+xml;base64,...` rendering of `otpauth_url`.
    pub qr: String,
}

fn build(secret_b32: &str, issuer: &str, account: &str) -> Result<TOTP, String> {
    let bytes = Secret::Encoded(secret_b32.trim().to_string())
        .to_bytes()
        .map_err(|e| format!("Invalid TOTP secret: {e:?}"))?;
    // Authenticator labels are `issuer:account`; a colon in either breaks parsing.
    TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        SKEW,
        STEP_SECONDS,
        bytes,
        Some(issuer.replace(':', "")),
        account.replace(':', ""),
    )
    .map_err(|e| format!("TOTP setup failed: {e}"))
}

/// Generate a fresh 160-bit secret, base32 encoded.
pub fn generate_secret() -> Result<String, String> {
    let bytes = Secret::generate_secret()
        .to_bytes()
        .map_err(|e| format!("Secret generation failed: {e:?}"))?;
    let totp = TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        SKEW,
        STEP_SECONDS,
        bytes,
        None,
        String::new(),
    )
    .map_err(|e| format!("TOTP setup failed: {e}"))?;
    Ok(totp.get_secret_base32())
}

/// Provisioning URI and QR for an already-generated secret.
pub fn provisioning(secret_b32: &str, issuer: &str, account: &str) -> Result<Provisioning, String> {
    let totp = build(secret_b32, issuer, account)?;
    let otpauth_url = totp.get_url();
    let svg = QrCode::new(otpauth_url.as_bytes())
        .map_err(|e| format!("QR encode failed: {e}"))?
        .render::<Color>()
        .min_dimensions(220, 220)
        .quiet_zone(true)
        .dark_color(Color("#000000"))
        .light_color(Color("#ffffff"))
        .build();

    Ok(Provisioning {
        secret: secret_b32.to_string(),
        otpauth_url,
        qr: format!("data:image/svg+xml;base64,{}", STANDARD.encode(svg)),
    })
}

/// Check a user-supplied code against the secret at the current time.
///
/// Anything that is not exactly six digits is rejected without touching the
/// secret.
pub fn verify(secret_b32: &str, code: &str) -> bool {
    let code = code.trim().replace(' ', "");
    if code.len() != DIGITS || !code.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    match build(secret_b32, "", "admin") {
        Ok(totp) => totp.check_current(&code).unwrap_or(false),
        Err(e) => {
            tracing::warn!("TOTP verify with unusable secret: {e}");
            false
        }
    }
}

/// Code for the current step. Used by tests and diagnostics.
pub fn current_code(secret_b32: &str) -> Result<String, String> {
    build(secret_b32, "", "admin")?
        .generate_current()
        .map_err(|e| format!("Clock error: {e}"))
}
