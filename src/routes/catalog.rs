use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};

use super::guards::AdminUser;
use super::{absolute_url, Id, JsonBody, Upload};
use crate::catalog::{self, Category, Product, ProductPage, ProductQuery};
use crate::error::ApiResult;
use crate::uploads::{self, UploadKind};
use crate::AppState;

// ---------------------------------------------------------------------------
// Public reads
// ---------------------------------------------------------------------------

pub async fn categories(State(state): State<AppState>) -> ApiResult<Json<Vec<Category>>> {
    catalog::list_categories(&state.db).map(Json)
}

pub async fn products(
    State(state): State<AppState>,
    Query(query): Query<ProductQuery>,
) -> ApiResult<Json<Vec<Product>>> {
    catalog::list_products(&state.db, &query).map(Json)
}

pub async fn product(State(state): State<AppState>, Id(id): Id<String>) -> ApiResult<Json<Product>> {
    catalog::get_product(&state.db, &id).map(Json)
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

pub async fn admin_products(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<ProductQuery>,
) -> ApiResult<Json<ProductPage>> {
    catalog::admin_list_products(&state.db, &query).map(Json)
}

pub async fn admin_product(
    State(state): State<AppState>,
    _admin: AdminUser,
    Id(id): Id<String>,
) -> ApiResult<Json<Product>> {
    catalog::get_product(&state.db, &id).map(Json)
}

pub async fn create_product(
    State(state): State<AppState>,
    _admin: AdminUser,
    JsonBody(body): JsonBody,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let product = catalog::create_product(&state.db, &body)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "ok": true, "id": product.id, "product": product })),
    ))
}

pub async fn update_product(
    State(state): State<AppState>,
    _admin: AdminUser,
    Id(id): Id<String>,
    JsonBody(body): JsonBody,
) -> ApiResult<Json<Value>> {
    let product = catalog::update_product(&state.db, &id, &body)?;
    Ok(Json(json!({ "ok": true, "product": product })))
}

pub async fn delete_product(
    State(state): State<AppState>,
    _admin: AdminUser,
    Id(id): Id<String>,
) -> ApiResult<Json<Value>> {
    catalog::delete_product(&state.db, &id)?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn admin_categories(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Json<Vec<Category>>> {
    catalog::list_categories(&state.db).map(Json)
}

pub async fn create_category(
    State(state): State<AppState>,
    _admin: AdminUser,
    JsonBody(body): JsonBody,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let category = catalog::create_category(&state.db, &body)?;
    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "category": category }))))
}

pub async fn update_category(
    State(state): State<AppState>,
    _admin: AdminUser,
    Id(id): Id<String>,
    JsonBody(body): JsonBody,
) -> ApiResult<Json<Value>> {
    let category = catalog::update_category(&state.db, &id, &body)?;
    Ok(Json(json!({ "ok": true, "category": category })))
}

pub async fn delete_category(
    State(state): State<AppState>,
    _admin: AdminUser,
    Id(id): Id<String>,
) -> ApiResult<Json<Value>> {
    catalog::delete_category(&state.db, &id)?;
    Ok(Json(json!({ "ok": true })))
}

/// Stores the file and returns its URL; attaching it to a product is a
/// separate create/update call.
pub async fn upload_product_image(
    State(state): State<AppState>,
    _admin: AdminUser,
    headers: HeaderMap,
    Upload(mut multipart): Upload,
) -> ApiResult<Json<Value>> {
    let stored =
        uploads::save_upload(&state.config.uploads_dir, UploadKind::ProductImage, &mut multipart).await?;
    let url = stored.url_path();
    let absolute = absolute_url(&state.config, &headers, &url);
    Ok(Json(json!({ "ok": true, "url": url, "absoluteUrl": absolute })))
}
