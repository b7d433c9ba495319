//! Google Sign-In credential verification.
//!
//! The browser hands us the ID token from Google Identity Services. We ask
//! Google's `tokeninfo` endpoint to validate it and then check the audience
//! and verified-email claims ourselves.

use axum::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity extracted from a verified credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoogleIdentity {
    pub email: String,
    pub name: Option<String>,
    pub subject: String,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Google sign-in is not configured")]
    NotConfigured,
    #[error("credential rejected: {0}")]
    Rejected(String),
    #[error("verification unavailable: {0}")]
    Unavailable(String),
}

/// Verifies an opaque sign-in credential. Swapped for a stub in tests.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<GoogleIdentity, VerifyError>;
}

/// Production verifier backed by Google's `tokeninfo` endpoint.
pub struct GoogleTokenInfo {
    client: Client,
    client_id: Option<String>,
}

impl GoogleTokenInfo {
    pub fn new(client_id: Option<String>) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        if client_id.is_none() {
            warn!("GOOGLE_CLIENT_ID not set; Google sign-in disabled");
        }
        Ok(Self { client, client_id })
    }
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    aud: Option<String>,
    sub: Option<String>,
    email: Option<String>,
    /// tokeninfo reports this as the string `"true"`; accept a bool too.
    email_verified: Option<Value>,
    name: Option<String>,
}

fn is_truthy(v: &Option<Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Validate the claims Google returned for our client id.
fn identity_from_claims(info: TokenInfo, client_id: &str) -> Result<GoogleIdentity, VerifyError> {
    if info.aud.as_deref() != Some(client_id) {
        return Err(VerifyError::Rejected("audience mismatch".into()));
    }
    if !is_truthy(&info.email_verified) {
        return Err(VerifyError::Rejected("email not verified".into()));
    }
    let email = info
        .email
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .ok_or_else(|| VerifyError::Rejected("no email claim".into()))?;
    Ok(GoogleIdentity {
        email,
        name: info.name.filter(|n| !n.trim().is_empty()),
        subject: info.sub.unwrap_or_default(),
    })
}

#[async_trait]
impl CredentialVerifier for GoogleTokenInfo {
    async fn verify(&self, credential: &str) -> Result<GoogleIdentity, VerifyError> {
        let client_id = self.client_id.as_deref().ok_or(VerifyError::NotConfigured)?;

        let resp = self
            .client
            .get(TOKENINFO_URL)
            .query(&[("id_token", credential)])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VerifyError::Unavailable("Google tokeninfo timed out".into())
                } else {
                    VerifyError::Unavailable(format!("Cannot reach Google tokeninfo: {e}"))
                }
            })?;

        let status = resp.status();
        if status == StatusCode::BAD_REQUEST {
            return Err(VerifyError::Rejected("invalid or expired token".into()));
        }
        if !status.is_success() {
            return Err(VerifyError::Unavailable(format!(
                "Google tokeninfo returned HTTP {}",
                status.as_u16()
            )));
        }

        let info: TokenInfo = resp
            .json()
            .await
            .map_err(|e| VerifyError::Unavailable(format!("Bad tokeninfo response: {e}")))?;
        let identity = identity_from_claims(info, client_id)?;
        debug!(email = %identity.email, "Google credential verified");
        Ok(identity)
    }
}
