use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::guards::{AdminUser, AuthUser};
use super::{blocking, Id, JsonBody};
use crate::error::ApiResult;
use crate::users::{self, User};
use crate::AppState;

pub async fn me(State(state): State<AppState>, AuthUser(claims): AuthUser) -> ApiResult<Json<User>> {
    users::get_profile(&state.db, claims.user_id).map(Json)
}

pub async fn update_own_whatsapp(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    JsonBody(body): JsonBody,
) -> ApiResult<Json<Value>> {
    users::update_own_whatsapp(&state.db, claims.user_id, &body)?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn list(State(state): State<AppState>, _admin: AdminUser) -> ApiResult<Json<Vec<User>>> {
    users::list_users(&state.db).map(Json)
}

pub async fn create(
    State(state): State<AppState>,
    _admin: AdminUser,
    JsonBody(body): JsonBody,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let cost = state.config.bcrypt_cost;
    let user = blocking(move || users::admin_create_user(&state.db, cost, &body)).await?;
    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "user": user }))))
}

pub async fn update(
    State(state): State<AppState>,
    _admin: AdminUser,
    Id(id): Id<i64>,
    JsonBody(body): JsonBody,
) -> ApiResult<Json<Value>> {
    let user = users::admin_update_user(&state.db, id, &body)?;
    Ok(Json(json!({ "ok": true, "user": user })))
}

pub async fn delete(
    State(state): State<AppState>,
    admin: AdminUser,
    Id(id): Id<i64>,
) -> ApiResult<Json<Value>> {
    users::admin_delete_user(&state.db, id, admin.user_id())?;
    Ok(Json(json!({ "ok": true })))
}
