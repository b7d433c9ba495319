use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::guards::{AdminUser, OptionalAuthUser};
use super::{Id, JsonBody};
use crate::error::ApiResult;
use crate::feedback::{self, FeedbackPage, FeedbackQuery, Submitted, Testimonial};
use crate::AppState;

/// Signed-in authors are published straight away; anonymous ones wait.
pub async fn submit(
    State(state): State<AppState>,
    OptionalAuthUser(claims): OptionalAuthUser,
    JsonBody(body): JsonBody,
) -> ApiResult<Json<Submitted>> {
    let user_id = claims.map(|c| c.user_id);
    feedback::submit(&state.db, user_id, &body).map(Json)
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    limit: Option<String>,
}

impl LimitQuery {
    pub fn limit(&self) -> Option<&str> {
        self.limit.as_deref()
    }
}

pub async fn public_list(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<Testimonial>>> {
    feedback::list_public(&state.db, query.limit()).map(Json)
}

pub async fn admin_list(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<FeedbackQuery>,
) -> ApiResult<Json<FeedbackPage>> {
    feedback::admin_list(&state.db, &query).map(Json)
}

pub async fn set_status(
    State(state): State<AppState>,
    _admin: AdminUser,
    Id(id): Id<i64>,
    JsonBody(body): JsonBody,
) -> ApiResult<Json<Value>> {
    let status = feedback::set_status(&state.db, id, &body)?;
    Ok(Json(json!({ "ok": true, "status": status })))
}

pub async fn delete(
    State(state): State<AppState>,
    _admin: AdminUser,
    Id(id): Id<i64>,
) -> ApiResult<Json<Value>> {
    feedback::delete(&state.db, id)?;
    Ok(Json(json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn test_anonymous_is_new_signed_in_is_published() {
        let state = test_state();
        let body = json!({ "rating": 5, "message": "Great" });

        let (status, anon) = send(&state, Method::POST, "/api/feedback", None, Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK, "{anon}");
        assert_eq!(anon["status"], json!("new"));

        let token = user_token(&state, "fan@example.com").await;
        let (status, signed) = send(&state, Method::POST, "/api/feedback", Some(&token), Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(signed["status"], json!("published"));

        // A bad token does not block submission; it just counts as anonymous.
        let (status, bad) = send(&state, Method::POST, "/api/feedback", Some("junk"), Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bad["status"], json!("new"));

        let (_, public) = send(&state, Method::GET, "/api/public/feedback", None, None).await;
        let ids: Vec<_> = public.as_array().unwrap().iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![signed["id"].clone()]);
    }

    #[tokio::test]
    async fn test_missing_message_rejected() {
        let state = test_state();
        let (status, body) = send(&state, Method::POST, "/api/feedback", None, Some(json!({ "rating": 4 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("Message is required"));
    }

    #[tokio::test]
    async fn test_moderation_flow() {
        let state = test_state();
        let admin = admin_token(&state).await;
        let (_, submitted) = send(
            &state,
            Method::POST,
            "/api/feedback",
            None,
            Some(json!({ "name": "Ram", "message": "Fast delivery of UC" })),
        )
        .await;
        let id = submitted["id"].as_i64().unwrap();

        let (status, page) = send(
            &state,
            Method::GET,
            "/api/admin/feedback?status=new&q=DELIVERY",
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], json!(1));
        assert_eq!(page["feedback"][0]["id"], json!(id));

        let (status, body) = send(
            &state,
            Method::PATCH,
            &format!("/api/admin/feedback/{id}"),
            Some(&admin),
            Some(json!({ "status": "approved" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("published"));

        let (_, public) = send(&state, Method::GET, "/api/public/feedback", None, None).await;
        assert_eq!(public.as_array().unwrap().len(), 1);

        let (status, _) = send(&state, Method::DELETE, &format!("/api/admin/feedback/{id}"), Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&state, Method::DELETE, &format!("/api/admin/feedback/{id}"), Some(&admin), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_non_numeric_id_gets_json_error() {
        let state = test_state();
        let admin = admin_token(&state).await;
        let (status, body) = send(
            &state,
            Method::PATCH,
            "/api/admin/feedback/abc",
            Some(&admin),
            Some(json!({ "status": "published" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("Invalid id"));

        let (status, body) = send(&state, Method::DELETE, "/api/admin/users/abc", Some(&admin), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("Invalid id"));
    }
}
