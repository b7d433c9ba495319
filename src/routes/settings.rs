use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use tracing::{error, info};

use super::guards::AdminUser;
use super::{absolute_url, JsonBody, Upload};
use crate::auth::{self, TotpStatus};
use crate::error::{ApiError, ApiResult};
use crate::totp::Provisioning;
use crate::uploads::{self, UploadKind};
use crate::{users, value_str, AppState};

fn qr_url(state: &AppState, headers: &HeaderMap, path: Option<String>) -> String {
    path.map(|p| absolute_url(&state.config, headers, &p))
        .unwrap_or_default()
}

pub async fn public_settings(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let settings = state.settings.snapshot();
    Json(json!({
        "whatsapp_number": settings.whatsapp_number,
        "esewa_qr_url": qr_url(&state, &headers, settings.esewa_qr_path()),
    }))
}

pub async fn admin_settings(
    State(state): State<AppState>,
    _admin: AdminUser,
    headers: HeaderMap,
) -> Json<Value> {
    let settings = state.settings.snapshot();
    let totp = auth::totp_status(&settings);
    Json(json!({
        "whatsapp_number": settings.whatsapp_number,
        "esewa_qr_filename": settings.esewa_qr_filename,
        "esewa_qr_url": qr_url(&state, &headers, settings.esewa_qr_path()),
        "totp_enabled": totp.enabled,
        "totp_pending": totp.pending,
    }))
}

pub async fn update_whatsapp(
    State(state): State<AppState>,
    _admin: AdminUser,
    JsonBody(body): JsonBody,
) -> ApiResult<Json<Value>> {
    let whatsapp = value_str(&body, &["whatsapp", "whatsapp_number"]).unwrap_or_default();
    state.settings.update(&state.db, |s| {
        s.whatsapp_number = whatsapp;
        Ok(())
    })?;
    info!("WhatsApp number updated");
    Ok(Json(json!({ "ok": true })))
}

pub async fn upload_esewa_qr(
    State(state): State<AppState>,
    _admin: AdminUser,
    headers: HeaderMap,
    Upload(mut multipart): Upload,
) -> ApiResult<Json<Value>> {
    let stored = uploads::save_upload(&state.config.uploads_dir, UploadKind::EsewaQr, &mut multipart).await?;

    let filename = stored.filename.clone();
    if let Err(e) = state.settings.update(&state.db, |s| {
        s.esewa_qr_filename = filename;
        Ok(())
    }) {
        if let Err(rm) = tokio::fs::remove_file(&stored.path).await {
            error!(path = %stored.path.display(), "Failed to remove orphaned QR upload: {rm}");
        }
        return Err(e);
    }

    let url = absolute_url(&state.config, &headers, &stored.url_path());
    Ok(Json(json!({
        "ok": true,
        "filename": stored.filename,
        "esewa_qr_url": url,
    })))
}

// ---------------------------------------------------------------------------
// Two-factor enrollment
// ---------------------------------------------------------------------------

fn otp_field(body: &Value) -> ApiResult<String> {
    value_str(body, &["otp", "code"]).ok_or_else(|| ApiError::bad_request("OTP is required"))
}

pub async fn totp_status(State(state): State<AppState>, _admin: AdminUser) -> Json<TotpStatus> {
    Json(auth::totp_status(&state.settings.snapshot()))
}

pub async fn totp_start(State(state): State<AppState>, admin: AdminUser) -> ApiResult<Json<Provisioning>> {
    let account = admin
        .0
        .claims()
        .and_then(|c| c.email.clone())
        .unwrap_or_else(|| state.config.admin_email.clone());
    auth::start_totp_enrollment(&state.db, &state.settings, &state.config.totp_issuer, &account).map(Json)
}

/// Session callers get a replacement token with `totp: true`, since their
/// current one stops passing the admin check once 2FA is active.
pub async fn totp_verify(
    State(state): State<AppState>,
    admin: AdminUser,
    JsonBody(body): JsonBody,
) -> ApiResult<Json<Value>> {
    let otp = otp_field(&body)?;
    auth::confirm_totp_enrollment(&state.db, &state.settings, &otp)?;

    match admin.user_id() {
        Some(user_id) => {
            let user = users::get_profile(&state.db, user_id)?;
            let token = state.tokens.issue(&user, Some(true))?;
            Ok(Json(json!({ "ok": true, "token": token })))
        }
        None => Ok(Json(json!({ "ok": true }))),
    }
}

pub async fn totp_disable(
    State(state): State<AppState>,
    _admin: AdminUser,
    JsonBody(body): JsonBody,
) -> ApiResult<Json<Value>> {
    let otp = otp_field(&body)?;
    auth::disable_totp(&state.db, &state.settings, &otp)?;
    Ok(Json(json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::totp;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn test_public_settings_and_whatsapp_update() {
        let state = test_state();
        let (status, body) = send(&state, Method::GET, "/api/public/settings", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "whatsapp_number": "", "esewa_qr_url": "" }));

        let admin = admin_token(&state).await;
        let (status, _) = send(
            &state,
            Method::PUT,
            "/api/admin/settings/whatsapp",
            Some(&admin),
            Some(json!({ "whatsapp": "+9779800000000" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&state, Method::GET, "/api/public/settings", None, None).await;
        assert_eq!(body["whatsapp_number"], json!("+9779800000000"));
    }

    #[tokio::test]
    async fn test_esewa_qr_upload_sets_public_url() {
        let state = test_state();
        let admin = admin_token(&state).await;

        let mut req = multipart_request("/api/admin/settings/esewa-qr", &admin, "qr", "qr.png", b"\x89PNGdata");
        req.headers_mut().insert("host", "shop.example.com".parse().unwrap());
        let (status, body) = send_request(&state, req).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let filename = body["filename"].as_str().unwrap().to_string();
        assert!(filename.starts_with("esewa-qr-") && filename.ends_with(".png"));
        assert_eq!(
            body["esewa_qr_url"],
            json!(format!("http://shop.example.com/uploads/{filename}"))
        );
        assert_eq!(state.settings.snapshot().esewa_qr_filename, filename);

        let req = multipart_request("/api/admin/settings/esewa-qr", &admin, "file", "qr.png", b"x");
        let (status, body) = send_request(&state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("Missing file"));

        let _ = std::fs::remove_dir_all(state.config.uploads_dir.parent().unwrap());
    }

    #[tokio::test]
    async fn test_two_factor_enrollment_gates_admin_access() {
        let state = test_state();
        let old_token = admin_token(&state).await;

        let (status, started) = send(&state, Method::POST, "/api/admin/2fa/start", Some(&old_token), None).await;
        assert_eq!(status, StatusCode::OK, "{started}");
        let secret = started["secret"].as_str().unwrap().to_string();
        assert!(started["qr"].as_str().unwrap().starts_with("data:image/svg+xml"));

        // Pending enrollment changes nothing yet.
        let (status, _) = send(&state, Method::GET, "/api/admin/orders", Some(&old_token), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &state,
            Method::POST,
            "/api/admin/2fa/verify",
            Some(&old_token),
            Some(json!({ "otp": "000000x" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let code = totp::current_code(&secret).unwrap();
        let (status, verified) = send(
            &state,
            Method::POST,
            "/api/admin/2fa/verify",
            Some(&old_token),
            Some(json!({ "otp": code })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{verified}");
        let fresh = verified["token"].as_str().unwrap().to_string();
        assert_eq!(state.tokens.verify(&fresh).unwrap().totp, Some(true));

        // The pre-2FA session and the legacy token no longer pass.
        let (status, _) = send(&state, Method::GET, "/api/admin/orders", Some(&old_token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let req = Request::builder()
            .uri("/api/admin/orders")
            .header("X-Admin-Token", LEGACY_TOKEN)
            .body(Body::empty())
            .unwrap();
        let (status, _) = send_request(&state, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(&state, Method::GET, "/api/admin/orders", Some(&fresh), None).await;
        assert_eq!(status, StatusCode::OK);

        // Login now needs the code.
        let (status, body) = login(&state, ADMIN_EMAIL, ADMIN_PASSWORD, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], json!("OTP required"));
        let (status, _) = login(&state, ADMIN_EMAIL, ADMIN_PASSWORD, Some("123")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let code = totp::current_code(&secret).unwrap();
        let (status, body) = login(&state, ADMIN_EMAIL, ADMIN_PASSWORD, Some(&code)).await;
        assert_eq!(status, StatusCode::OK);
        let claims = state.tokens.verify(body["token"].as_str().unwrap()).unwrap();
        assert_eq!(claims.totp, Some(true));

        let (_, status_body) = send(&state, Method::GET, "/api/admin/2fa/status", Some(&fresh), None).await;
        assert_eq!(status_body, json!({ "enabled": true, "pending": false }));

        let code = totp::current_code(&secret).unwrap();
        let (status, _) = send(
            &state,
            Method::POST,
            "/api/admin/2fa/disable",
            Some(&fresh),
            Some(json!({ "otp": code })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&state, Method::GET, "/api/admin/orders", Some(&old_token), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_non_admin_session_forbidden() {
        let state = test_state();
        let token = user_token(&state, "nosy@example.com").await;
        let (status, body) = send(&state, Method::GET, "/api/admin/settings", Some(&token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], json!("Admin only"));
    }
}
