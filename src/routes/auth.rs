use axum::extract::State;
use axum::Json;
use tracing::warn;

use super::{blocking, JsonBody};
use crate::auth::{self, AuthResponse};
use crate::error::{ApiError, ApiResult};
use crate::google::VerifyError;
use crate::{value_str, AppState};

pub async fn register(
    State(state): State<AppState>,
    JsonBody(body): JsonBody,
) -> ApiResult<Json<AuthResponse>> {
    let cost = state.config.bcrypt_cost;
    blocking(move || auth::register(&state.db, &state.tokens, cost, &body))
        .await
        .map(Json)
}

pub async fn login(
    State(state): State<AppState>,
    JsonBody(body): JsonBody,
) -> ApiResult<Json<AuthResponse>> {
    let settings = state.settings.snapshot();
    blocking(move || auth::login(&state.db, &state.tokens, &settings, &body))
        .await
        .map(Json)
}

fn google_error(e: VerifyError) -> ApiError {
    match e {
        VerifyError::NotConfigured => ApiError::internal("Google sign-in is not configured", e),
        VerifyError::Rejected(ref reason) => {
            warn!("Google credential rejected: {reason}");
            ApiError::Unauthorized("Invalid Google credential".into())
        }
        VerifyError::Unavailable(_) => ApiError::internal("Google sign-in failed", e),
    }
}

pub async fn google(
    State(state): State<AppState>,
    JsonBody(body): JsonBody,
) -> ApiResult<Json<AuthResponse>> {
    let credential = value_str(&body, &["credential", "id_token", "idToken"])
        .ok_or_else(|| ApiError::bad_request("Missing credential"))?;
    let identity = state.google.verify(&credential).await.map_err(google_error)?;

    let settings = state.settings.snapshot();
    let otp = value_str(&body, &["otp", "code"]);
    let cost = state.config.bcrypt_cost;
    blocking(move || {
        auth::google_login(&state.db, &state.tokens, &settings, cost, &identity, otp.as_deref())
    })
    .await
    .map(Json)
}
