use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::feedback::LimitQuery;
use super::guards::AdminUser;
use super::{Id, JsonBody};
use crate::blog::{self, BlogPost};
use crate::error::ApiResult;
use crate::AppState;

pub async fn list_published(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<BlogPost>>> {
    blog::list_published(&state.db, query.limit()).map(Json)
}

pub async fn get_published(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<BlogPost>> {
    blog::get_published(&state.db, &slug).map(Json)
}

pub async fn admin_list(State(state): State<AppState>, _admin: AdminUser) -> ApiResult<Json<Vec<BlogPost>>> {
    blog::admin_list(&state.db).map(Json)
}

pub async fn create(
    State(state): State<AppState>,
    _admin: AdminUser,
    JsonBody(body): JsonBody,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let post = blog::create(&state.db, &body)?;
    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "post": post }))))
}

pub async fn update(
    State(state): State<AppState>,
    _admin: AdminUser,
    Id(id): Id<i64>,
    JsonBody(body): JsonBody,
) -> ApiResult<Json<Value>> {
    let post = blog::update(&state.db, id, &body)?;
    Ok(Json(json!({ "ok": true, "post": post })))
}

pub async fn delete(
    State(state): State<AppState>,
    _admin: AdminUser,
    Id(id): Id<i64>,
) -> ApiResult<Json<Value>> {
    blog::delete(&state.db, id)?;
    Ok(Json(json!({ "ok": true })))
}
