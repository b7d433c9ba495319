use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use super::guards::AdminUser;
use super::JsonBody;
use crate::error::ApiResult;
use crate::orders::{self, Order};
use crate::AppState;

/// Records checkout intent. No stock, payment or idempotency checks.
pub async fn create(State(state): State<AppState>, JsonBody(body): JsonBody) -> ApiResult<Json<Value>> {
    let id = orders::create_order(&state.db, &body)?;
    Ok(Json(json!({ "ok": true, "id": id })))
}

pub async fn list(State(state): State<AppState>, _admin: AdminUser) -> ApiResult<Json<Vec<Order>>> {
    orders::list_orders(&state.db).map(Json)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn test_order_round_trip_with_legacy_token() {
        let state = test_state();
        let (status, body) = send(
            &state,
            Method::POST,
            "/api/orders",
            None,
            Some(json!({
                "customerName": "Sita",
                "gameUid": "5123456789",
                "items": [{ "id": "p1", "qty": 2 }, { "id": "p7", "qty": 1 }],
                "totalNpr": 2648,
                "paymentMethod": "esewa",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let id = body["id"].as_i64().unwrap();

        let (status, _) = send(&state, Method::GET, "/api/orders", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .uri("/api/orders")
            .header("X-Admin-Token", LEGACY_TOKEN)
            .body(Body::empty())
            .unwrap();
        let (status, body) = send_request(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        let order = &body.as_array().unwrap()[0];
        assert_eq!(order["id"], json!(id));
        assert_eq!(order["product_id"], json!("p1"));
        assert_eq!(order["quantity"], json!(3));
        assert_eq!(order["status"], json!("created"));

        let admin = admin_token(&state).await;
        let (status, body) = send(&state, Method::GET, "/api/admin/orders", Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_legacy_token_rejected() {
        let state = test_state();
        let req = Request::builder()
            .uri("/api/admin/orders?token=not-the-token")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send_request(&state, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
