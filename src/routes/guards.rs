//! Request extractors for caller identity.

use axum::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use serde::Deserialize;
use tracing::debug;

use crate::auth::{self, AuthMethod, Claims};
use crate::error::ApiError;
use crate::AppState;

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
const BACKUP_TOKEN_HEADER: &str = "x-backup-token";

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// `Authorization: Bearer <token>`, scheme matched case-insensitively.
fn bearer_token(parts: &Parts) -> Option<String> {
    let raw = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = raw.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

/// A static token from `header`, falling back to `?token=`.
fn static_token(parts: &Parts, header: &str) -> Option<String> {
    parts
        .headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            Query::<TokenQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(q)| q.token)
        })
}

/// Any signed-in caller.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or_else(ApiError::unauthorized)?;
        state.tokens.verify(&token).map(AuthUser)
    }
}

/// Signed-in caller if a valid token was sent. A bad token is ignored.
#[derive(Debug, Clone)]
pub struct OptionalAuthUser(pub Option<Claims>);

#[async_trait]
impl FromRequestParts<AppState> for OptionalAuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let claims = bearer_token(parts).and_then(|t| match state.tokens.verify(&t) {
            Ok(claims) => Some(claims),
            Err(_) => {
                debug!("Ignoring invalid bearer token on optional-auth route");
                None
            }
        });
        Ok(OptionalAuthUser(claims))
    }
}

/// Admin caller, by session token or the legacy static token.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthMethod);

impl AdminUser {
    /// Account id for session callers; legacy token callers have none.
    pub fn user_id(&self) -> Option<i64> {
        self.0.claims().map(|c| c.user_id)
    }
}

fn admin_method(parts: &Parts, state: &AppState) -> Result<AuthMethod, ApiError> {
    let method = if let Some(token) = bearer_token(parts) {
        AuthMethod::SessionToken(state.tokens.verify(&token)?)
    } else if auth::static_token_matches(
        state.config.admin_token.as_deref(),
        static_token(parts, ADMIN_TOKEN_HEADER).as_deref(),
    ) {
        AuthMethod::LegacyToken
    } else {
        return Err(ApiError::unauthorized());
    };
    auth::admin_access_allowed(&method, state.settings.snapshot().totp_enabled())?;
    Ok(method)
}

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        admin_method(parts, state).map(AdminUser)
    }
}

/// Backup endpoints: `BACKUP_TOKEN` or anything that passes as admin.
#[derive(Debug, Clone)]
pub enum BackupAccess {
    BackupToken,
    Admin(AuthMethod),
}

#[async_trait]
impl FromRequestParts<AppState> for BackupAccess {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if auth::static_token_matches(
            state.config.backup_token.as_deref(),
            static_token(parts, BACKUP_TOKEN_HEADER).as_deref(),
        ) {
            return Ok(BackupAccess::BackupToken);
        }
        admin_method(parts, state).map(BackupAccess::Admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(req: Request<()>) -> Parts {
        req.into_parts().0
    }

    #[test]
    fn test_bearer_token_parsing() {
        let p = parts(Request::builder().header("Authorization", "bearer abc.def").body(()).unwrap());
        assert_eq!(bearer_token(&p).as_deref(), Some("abc.def"));

        let p = parts(Request::builder().header("Authorization", "Basic abc").body(()).unwrap());
        assert!(bearer_token(&p).is_none());

        let p = parts(Request::builder().header("Authorization", "Bearer ").body(()).unwrap());
        assert!(bearer_token(&p).is_none());
    }

    #[test]
    fn test_static_token_header_then_query() {
        let p = parts(
            Request::builder()
                .uri("/api/admin/orders?token=from-query")
                .header("X-Admin-Token", "from-header")
                .body(())
                .unwrap(),
        );
        assert_eq!(static_token(&p, ADMIN_TOKEN_HEADER).as_deref(), Some("from-header"));

        let p = parts(Request::builder().uri("/api/admin/orders?token=from-query").body(()).unwrap());
        assert_eq!(static_token(&p, ADMIN_TOKEN_HEADER).as_deref(), Some("from-query"));

        let p = parts(Request::builder().uri("/api/admin/orders").body(()).unwrap());
        assert!(static_token(&p, ADMIN_TOKEN_HEADER).is_none());
    }
}
