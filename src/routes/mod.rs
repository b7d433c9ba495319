//! HTTP surface: router assembly, shared extractors and middleware.
//!
//! Handlers are thin. They pull identity and input out of the request, call
//! the matching domain function with `&state.db`, and shape the JSON reply.

mod auth;
mod backup;
mod blog;
mod catalog;
mod feedback;
pub mod guards;
mod orders;
mod settings;
mod users;

use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, FromRequestParts, Multipart, Path, Request};
use axum::http::request::Parts;
use axum::http::header::HOST;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post, put};
use axum::{Extension, Json, Router};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::any::Any;
use std::time::Instant;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::uploads::MAX_UPLOAD_BYTES;
use crate::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

// ---------------------------------------------------------------------------
// Extractors
// ---------------------------------------------------------------------------

/// JSON request body as a loose `Value`. An empty body reads as `{}`.
#[derive(Debug)]
pub struct JsonBody(pub Value);

#[async_trait]
impl<S> FromRequest<S> for JsonBody
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state).await.map_err(|e| {
            if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                ApiError::PayloadTooLarge("Request body too large".into())
            } else {
                ApiError::bad_request("Invalid JSON body")
            }
        })?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(JsonBody(json!({})));
        }
        serde_json::from_slice(&bytes)
            .map(JsonBody)
            .map_err(|_| ApiError::bad_request("Invalid JSON body"))
    }
}

/// Record id from the URL. Malformed ids get a JSON 400 like every other error.
#[derive(Debug)]
pub struct Id<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for Id<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Path::<T>::from_request_parts(parts, state).await {
            Ok(Path(id)) => Ok(Id(id)),
            Err(e) if e.status().is_server_error() => Err(ApiError::internal("Internal server error", e)),
            Err(_) => Err(ApiError::bad_request("Invalid id")),
        }
    }
}

/// `multipart/form-data` body.
pub struct Upload(pub Multipart);

#[async_trait]
impl<S> FromRequest<S> for Upload
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        Multipart::from_request(req, state)
            .await
            .map(Upload)
            .map_err(|_| ApiError::bad_request("Expected a multipart/form-data upload"))
    }
}

/// Run CPU-bound work (bcrypt, SQLite snapshots) on the blocking pool.
pub(crate) async fn blocking<T, F>(work: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::internal("Internal server error", e))?
}

/// Per-request id set by `log_requests`.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Absolute URL for a server path: `PUBLIC_BASE_URL` when configured, else
/// the scheme and host the request came in on.
pub(crate) fn absolute_url(config: &Config, headers: &HeaderMap, path: &str) -> String {
    if let Some(base) = config.public_base_url.as_deref() {
        return format!("{base}{path}");
    }
    let Some(host) = header_str(headers, HOST.as_str()) else {
        return path.to_string();
    };
    let proto = header_str(headers, "x-forwarded-proto")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("http");
    format!("{proto}://{host}{path}")
}

// ---------------------------------------------------------------------------
// Middleware & fallbacks
// ---------------------------------------------------------------------------

async fn log_requests(mut req: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let started = Instant::now();
    let mut res = next.run(req).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        res.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    let status = res.status().as_u16();
    if res.status().is_server_error() {
        warn!(%method, %path, status, elapsed_ms, request_id = %request_id, "Request failed");
    } else {
        info!(%method, %path, status, elapsed_ms, request_id = %request_id, "Request handled");
    }
    res
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    ApiError::internal("Internal server error", format!("handler panicked: {detail}")).into_response()
}

async fn not_found() -> ApiError {
    ApiError::not_found("Not found")
}

async fn health(request_id: Option<Extension<RequestId>>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "time": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "request_id": request_id.map(|Extension(RequestId(id))| id),
    }))
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let uploads_dir = state.config.uploads_dir.clone();

    let public = Router::new()
        .route("/api/health", get(health))
        .route("/healthz", get(healthz))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/google", post(auth::google))
        .route("/api/me", get(users::me))
        .route("/api/me/whatsapp", patch(users::update_own_whatsapp))
        .route("/api/categories", get(catalog::categories))
        .route("/api/products", get(catalog::products))
        .route("/api/products/:id", get(catalog::product))
        .route("/api/orders", post(orders::create).get(orders::list))
        .route("/api/public/settings", get(settings::public_settings))
        .route("/api/feedback", post(feedback::submit))
        .route("/api/public/feedback", get(feedback::public_list))
        .route("/api/public/blog-posts", get(blog::list_published))
        .route("/api/public/blog-posts/:slug", get(blog::get_published));

    let admin = Router::new()
        .route(
            "/api/admin/products",
            get(catalog::admin_products).post(catalog::create_product),
        )
        .route(
            "/api/admin/products/:id",
            get(catalog::admin_product)
                .patch(catalog::update_product)
                .put(catalog::update_product)
                .delete(catalog::delete_product),
        )
        .route(
            "/api/admin/categories",
            get(catalog::admin_categories).post(catalog::create_category),
        )
        .route(
            "/api/admin/categories/:id",
            patch(catalog::update_category).delete(catalog::delete_category),
        )
        .route("/api/admin/orders", get(orders::list))
        .route("/api/admin/users", get(users::list).post(users::create))
        .route(
            "/api/admin/users/:id",
            patch(users::update).delete(users::delete),
        )
        .route("/api/admin/feedback", get(feedback::admin_list))
        .route(
            "/api/admin/feedback/:id",
            patch(feedback::set_status).delete(feedback::delete),
        )
        .route("/api/admin/settings", get(settings::admin_settings))
        .route("/api/admin/settings/whatsapp", put(settings::update_whatsapp))
        .route("/api/admin/2fa/status", get(settings::totp_status))
        .route("/api/admin/2fa/start", post(settings::totp_start))
        .route("/api/admin/2fa/verify", post(settings::totp_verify))
        .route("/api/admin/2fa/disable", post(settings::totp_disable))
        .route(
            "/api/admin/blog-posts",
            get(blog::admin_list).post(blog::create),
        )
        .route(
            "/api/admin/blog-posts/:id",
            patch(blog::update).delete(blog::delete),
        )
        .route("/api/admin/backup", post(backup::create))
        .route("/api/admin/backup/download", get(backup::download));

    // The handler enforces MAX_UPLOAD_BYTES itself and cleans up; the framework
    // limit only has to stay out of its way.
    let uploads = Router::new()
        .route("/api/admin/settings/esewa-qr", post(settings::upload_esewa_qr))
        .route(
            "/api/admin/uploads/product-image",
            post(catalog::upload_product_image),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES * 2));

    let cors = CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods(AnyOrigin)
        .allow_headers(AnyOrigin);

    public
        .merge(admin)
        .merge(uploads)
        .nest_service("/uploads", ServeDir::new(uploads_dir))
        .fallback(not_found)
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(cors)
        .layer(middleware::from_fn(log_requests))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::db;
    use crate::google::{CredentialVerifier, GoogleIdentity, VerifyError};
    use axum::body::Body;
    use axum::http::{Method, Request as HttpRequest};
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    pub const ADMIN_EMAIL: &str = "admin@test.local";
    pub const ADMIN_PASSWORD: &str = "admin-pass";
    pub const LEGACY_TOKEN: &str = "legacy-admin-token";
    pub const BACKUP_TOKEN: &str = "backup-only-token";

    /// Accepts `good:<email>` and rejects everything else.
    pub struct StubVerifier;

    #[async_trait]
    impl CredentialVerifier for StubVerifier {
        async fn verify(&self, credential: &str) -> Result<GoogleIdentity, VerifyError> {
            match credential.strip_prefix("good:") {
                Some(email) => Ok(GoogleIdentity {
                    email: email.to_string(),
                    name: Some("Google User".to_string()),
                    subject: format!("sub-{email}"),
                }),
                None => Err(VerifyError::Rejected("bad credential".into())),
            }
        }
    }

    pub fn test_config() -> Config {
        let root = std::env::temp_dir().join(format!("spk_http_{}", uuid::Uuid::new_v4()));
        Config {
            uploads_dir: root.join("uploads"),
            backup_dir: root.join("backups"),
            log_dir: root.join("logs"),
            jwt_secret: "http-test-secret".to_string(),
            admin_token: Some(LEGACY_TOKEN.to_string()),
            backup_token: Some(BACKUP_TOKEN.to_string()),
            admin_email: ADMIN_EMAIL.to_string(),
            admin_password: ADMIN_PASSWORD.to_string(),
            bcrypt_cost: 4,
            ..Config::default()
        }
    }

    pub fn test_state() -> AppState {
        let config = test_config();
        let db = db::open_in_memory().unwrap();
        crate::users::ensure_admin_user(&db, &config).unwrap();
        AppState::new(config, db, Arc::new(StubVerifier)).unwrap()
    }

    pub async fn send(
        state: &AppState,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = HttpRequest::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        let body = match body {
            Some(v) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        send_request(state, builder.body(body).unwrap()).await
    }

    pub async fn send_request(state: &AppState, req: Request) -> (StatusCode, Value) {
        let res = router(state.clone()).oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(
                String::from_utf8_lossy(&bytes).to_string(),
            ))
        };
        (status, value)
    }

    pub async fn login(state: &AppState, email: &str, password: &str, otp: Option<&str>) -> (StatusCode, Value) {
        let mut body = json!({ "email": email, "password": password });
        if let Some(otp) = otp {
            body["otp"] = json!(otp);
        }
        send(state, Method::POST, "/api/auth/login", None, Some(body)).await
    }

    pub async fn admin_token(state: &AppState) -> String {
        let (status, body) = login(state, ADMIN_EMAIL, ADMIN_PASSWORD, None).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["token"].as_str().unwrap().to_string()
    }

    pub async fn user_token(state: &AppState, email: &str) -> String {
        let (status, body) = send(
            state,
            Method::POST,
            "/api/auth/register",
            None,
            Some(json!({ "email": email, "password": "secret123", "name": "Customer" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["token"].as_str().unwrap().to_string()
    }

    /// Single-file multipart body.
    pub fn multipart_request(uri: &str, token: &str, field: &str, filename: &str, bytes: &[u8]) -> Request {
        let boundary = "spk-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        HttpRequest::builder()
            .method(Method::POST)
            .uri(uri)
            .header("Authorization", format!("Bearer {token}"))
            .header("Content-Type", format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request as HttpRequest};

    #[tokio::test(flavor = "current_thread")]
    async fn test_blocking_runs_off_the_runtime_thread() {
        let caller = std::thread::current().id();
        let worker = blocking(|| Ok(std::thread::current().id())).await.unwrap();
        assert_ne!(worker, caller);

        let err = blocking::<(), _>(|| Err(ApiError::bad_request("nope"))).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "nope"));
    }

    #[tokio::test]
    async fn test_health_reports_request_id() {
        let state = test_state();
        let res = tower::ServiceExt::oneshot(
            router(state.clone()),
            HttpRequest::builder().uri("/api/health").body(Body::empty()).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let header = res.headers().get(REQUEST_ID_HEADER).unwrap().to_str().unwrap().to_string();

        let bytes = http_body_util::BodyExt::collect(res.into_body()).await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["ok"], json!(true));
        assert_eq!(body["request_id"], json!(header));

        let (status, body) = send(&state, Method::GET, "/healthz", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let state = test_state();
        let (status, body) = send(&state, Method::GET, "/api/nope", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "error": "Not found" }));
    }

    #[tokio::test]
    async fn test_invalid_json_body() {
        let state = test_state();
        let req = HttpRequest::builder()
            .method(Method::POST)
            .uri("/api/auth/login")
            .header("Content-Type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send_request(&state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "Invalid JSON body" }));
    }

    #[tokio::test]
    async fn test_empty_body_reads_as_empty_object() {
        let state = test_state();
        let (status, body) = send(&state, Method::POST, "/api/auth/login", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("Email and password are required"));
    }

    #[test]
    fn test_absolute_url() {
        let mut config = test_config();
        let mut headers = HeaderMap::new();
        assert_eq!(absolute_url(&config, &headers, "/uploads/a.png"), "/uploads/a.png");

        headers.insert(HOST, HeaderValue::from_static("shop.example.com"));
        assert_eq!(
            absolute_url(&config, &headers, "/uploads/a.png"),
            "http://shop.example.com/uploads/a.png"
        );
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https, http"));
        assert_eq!(
            absolute_url(&config, &headers, "/uploads/a.png"),
            "https://shop.example.com/uploads/a.png"
        );

        config.public_base_url = Some("https://cdn.example.com".to_string());
        assert_eq!(
            absolute_url(&config, &headers, "/uploads/a.png"),
            "https://cdn.example.com/uploads/a.png"
        );
    }

    #[test]
    fn test_panic_response_is_generic_500() {
        let res = panic_response(Box::new("boom"));
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
