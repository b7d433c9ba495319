//! Categories and products.
//!
//! Public listing supports category/search/price filters, an allow-listed
//! sort key and bounded pagination. Admin CRUD validates before writing and
//! keeps categories from being deleted while products still point at them.

use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::db::{Assignments, DbState};
use crate::error::{ApiError, ApiResult};
use crate::{parse_int, present_value, slugify, value_str};

const PUBLIC_DEFAULT_LIMIT: i64 = 200;
const PUBLIC_MAX_LIMIT: i64 = 500;
const ADMIN_DEFAULT_LIMIT: i64 = 20;
const ADMIN_MAX_LIMIT: i64 = 200;

const PRODUCT_COLUMNS: &str =
    "id, name, category_id, price_npr, price_usd, tier, availability, image, note, note_ne";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub tag: Option<String>,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub category_id: String,
    pub price_npr: i64,
    pub price_usd: Option<f64>,
    pub tier: Option<String>,
    pub availability: Option<String>,
    pub image: Option<String>,
    pub note: Option<String>,
    pub note_ne: Option<String>,
}

fn row_to_product(row: &Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        name: row.get(1)?,
        category_id: row.get(2)?,
        price_npr: row.get(3)?,
        price_usd: row.get(4)?,
        tier: row.get(5)?,
        availability: row.get(6)?,
        image: row.get(7)?,
        note: row.get(8)?,
        note_ne: row.get(9)?,
    })
}

fn row_to_category(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        name: row.get(1)?,
        tag: row.get(2)?,
        icon: row.get(3)?,
    })
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Raw query-string parameters. Everything is text so a malformed number
/// can be ignored instead of failing the request.
#[derive(Debug, Default, Deserialize)]
pub struct ProductQuery {
    pub category: Option<String>,
    pub q: Option<String>,
    #[serde(rename = "minPrice", alias = "min_price")]
    pub min_price: Option<String>,
    #[serde(rename = "maxPrice", alias = "max_price")]
    pub max_price: Option<String>,
    pub sort: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    NameAsc,
    NameDesc,
    PriceAsc,
    PriceDesc,
    Newest,
}

impl SortKey {
    /// Unknown keys fall back to name ascending.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("name_desc") => Self::NameDesc,
            Some("price_asc") => Self::PriceAsc,
            Some("price_desc") => Self::PriceDesc,
            Some("newest") => Self::Newest,
            _ => Self::NameAsc,
        }
    }

    fn order_by(self) -> &'static str {
        match self {
            Self::NameAsc => "name ASC",
            Self::NameDesc => "name DESC",
            Self::PriceAsc => "price_npr ASC",
            Self::PriceDesc => "price_npr DESC",
            Self::Newest => "rowid DESC",
        }
    }
}

/// `(limit, offset)` with the limit in `1..=max` and a non-negative offset.
pub(crate) fn page_bounds(
    limit: Option<&str>,
    offset: Option<&str>,
    default: i64,
    max: i64,
) -> (i64, i64) {
    let limit = limit
        .and_then(parse_int)
        .filter(|n| *n > 0)
        .unwrap_or(default)
        .min(max);
    let offset = offset.and_then(parse_int).unwrap_or(0).max(0);
    (limit, offset)
}

fn product_filter(query: &ProductQuery) -> (String, Vec<SqlValue>) {
    let mut clauses: Vec<&'static str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();
    let non_empty = |v: &Option<String>| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    if let Some(category) = non_empty(&query.category) {
        clauses.push("category_id = ?");
        values.push(category.into());
    }
    if let Some(q) = non_empty(&query.q) {
        clauses.push("(name LIKE ? OR note LIKE ?)");
        let like = format!("%{q}%");
        values.push(like.clone().into());
        values.push(like.into());
    }
    if let Some(min) = query.min_price.as_deref().and_then(parse_int) {
        clauses.push("price_npr >= ?");
        values.push(min.into());
    }
    if let Some(max) = query.max_price.as_deref().and_then(parse_int) {
        clauses.push("price_npr <= ?");
        values.push(max.into());
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    (where_sql, values)
}

fn select_products(
    conn: &Connection,
    query: &ProductQuery,
    limit: i64,
    offset: i64,
) -> ApiResult<Vec<Product>> {
    let (where_sql, mut values) = product_filter(query);
    let order_by = SortKey::parse(query.sort.as_deref()).order_by();
    let sql = format!(
        "SELECT {PRODUCT_COLUMNS} FROM products{where_sql} ORDER BY {order_by} LIMIT ? OFFSET ?"
    );
    values.push(limit.into());
    values.push(offset.into());

    let mut stmt = conn
        .prepare(&sql)
        .map_err(ApiError::storage("Failed to load products"))?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), row_to_product)
        .map_err(ApiError::storage("Failed to load products"))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(ApiError::storage("Failed to load products"))
}

/// Public product list.
pub fn list_products(db: &DbState, query: &ProductQuery) -> ApiResult<Vec<Product>> {
    let (limit, offset) = page_bounds(
        query.limit.as_deref(),
        query.offset.as_deref(),
        PUBLIC_DEFAULT_LIMIT,
        PUBLIC_MAX_LIMIT,
    );
    let conn = db.lock()?;
    select_products(&conn, query, limit, offset)
}

#[derive(Debug, Serialize)]
pub struct ProductPage {
    pub items: Vec<Product>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Admin product list with a total for paging.
pub fn admin_list_products(db: &DbState, query: &ProductQuery) -> ApiResult<ProductPage> {
    let (limit, offset) = page_bounds(
        query.limit.as_deref(),
        query.offset.as_deref(),
        ADMIN_DEFAULT_LIMIT,
        ADMIN_MAX_LIMIT,
    );
    let conn = db.lock()?;
    let (where_sql, values) = product_filter(query);
    let total: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM products{where_sql}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )
        .map_err(ApiError::storage("Failed to load products"))?;
    let items = select_products(&conn, query, limit, offset)?;
    Ok(ProductPage {
        items,
        total,
        limit,
        offset,
    })
}

pub fn get_product(db: &DbState, id: &str) -> ApiResult<Product> {
    let conn = db.lock()?;
    find_product(&conn, id)?.ok_or_else(|| ApiError::not_found("Product not found"))
}

fn find_product(conn: &Connection, id: &str) -> ApiResult<Option<Product>> {
    conn.query_row(
        &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1"),
        params![id],
        row_to_product,
    )
    .optional()
    .map_err(ApiError::storage("Failed to load product"))
}

// ---------------------------------------------------------------------------
// Product writes
// ---------------------------------------------------------------------------

/// Parse a price-like field: a JSON number or numeric string. `None` when
/// none of `keys` is present.
fn price_field(payload: &Value, keys: &[&str], field: &str) -> ApiResult<Option<f64>> {
    let Some(raw) = present_value(payload, keys) else {
        return Ok(None);
    };
    let parsed = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() && v >= 0.0 => Ok(Some(v)),
        _ => Err(ApiError::bad_request(format!(
            "{field} must be a non-negative number"
        ))),
    }
}

/// Optional display text: present-but-blank clears the column.
fn optional_text(payload: &Value, keys: &[&str]) -> Option<Option<String>> {
    keys.iter().find_map(|key| payload.get(*key)).map(|v| {
        v.as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn category_exists(conn: &Connection, id: &str) -> ApiResult<bool> {
    conn.query_row("SELECT 1 FROM categories WHERE id = ?1", params![id], |_| Ok(()))
        .optional()
        .map(|r| r.is_some())
        .map_err(ApiError::storage("Failed to load category"))
}

fn product_exists(conn: &Connection, id: &str) -> ApiResult<bool> {
    Ok(find_product(conn, id)?.is_some())
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// `p<base36 millis>`, suffixed `-n` if that id is already taken.
fn generate_product_id(conn: &Connection) -> ApiResult<String> {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let base = format!("p{}", to_base36(millis));
    if !product_exists(conn, &base)? {
        return Ok(base);
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}-{n}");
        if !product_exists(conn, &candidate)? {
            return Ok(candidate);
        }
        n += 1;
    }
}

pub fn create_product(db: &DbState, payload: &Value) -> ApiResult<Product> {
    let name = value_str(payload, &["name"])
        .ok_or_else(|| ApiError::bad_request("Product name is required"))?;
    let category_id = value_str(payload, &["category_id", "category"])
        .ok_or_else(|| ApiError::bad_request("category_id is required"))?;
    let price_npr = price_field(payload, &["price_npr", "price"], "price_npr")?
        .unwrap_or(0.0)
        .trunc() as i64;
    let price_usd = price_field(payload, &["price_usd"], "price_usd")?;
    let text = |keys: &[&str]| optional_text(payload, keys).flatten();

    let conn = db.lock()?;
    if !category_exists(&conn, &category_id)? {
        return Err(ApiError::bad_request("Unknown category"));
    }
    let id = match value_str(payload, &["id"]) {
        Some(id) => {
            if product_exists(&conn, &id)? {
                return Err(ApiError::conflict("Product id already exists"));
            }
            id
        }
        None => generate_product_id(&conn)?,
    };

    let product = Product {
        id,
        name,
        category_id,
        price_npr,
        price_usd,
        tier: text(&["tier"]),
        availability: text(&["availability"]),
        image: text(&["image", "img"]),
        note: text(&["note"]),
        note_ne: text(&["note_ne"]),
    };
    conn.execute(
        &format!("INSERT INTO products ({PRODUCT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
        params![
            product.id,
            product.name,
            product.category_id,
            product.price_npr,
            product.price_usd,
            product.tier,
            product.availability,
            product.image,
            product.note,
            product.note_ne
        ],
    )
    .map_err(ApiError::storage("Failed to create product"))?;

    info!(product_id = %product.id, "Product created");
    Ok(product)
}

/// Partial update: only fields present in the body are written.
pub fn update_product(db: &DbState, id: &str, payload: &Value) -> ApiResult<Product> {
    let mut changes = Assignments::default();

    if payload.get("name").is_some() {
        let name = value_str(payload, &["name"])
            .ok_or_else(|| ApiError::bad_request("Product name is required"))?;
        changes.set("name", name);
    }
    let category = if present_value(payload, &["category_id", "category"]).is_some() {
        let category = value_str(payload, &["category_id", "category"])
            .ok_or_else(|| ApiError::bad_request("category_id is required"))?;
        Some(category)
    } else {
        None
    };
    if let Some(price) = price_field(payload, &["price_npr", "price"], "price_npr")? {
        changes.set("price_npr", price.trunc() as i64);
    }
    if payload.get("price_usd").is_some() {
        changes.set("price_usd", price_field(payload, &["price_usd"], "price_usd")?);
    }
    for (column, keys) in [
        ("image", &["image", "img"][..]),
        ("note", &["note"][..]),
        ("note_ne", &["note_ne"][..]),
        ("tier", &["tier"][..]),
        ("availability", &["availability"][..]),
    ] {
        if let Some(value) = optional_text(payload, keys) {
            changes.set(column, value);
        }
    }

    let conn = db.lock()?;
    if let Some(category) = category {
        if !category_exists(&conn, &category)? {
            return Err(ApiError::bad_request("Unknown category"));
        }
        changes.set("category_id", category);
    }
    if changes.is_empty() {
        return Err(ApiError::bad_request("No changes provided"));
    }

    let changed = changes
        .apply(&conn, "products", "id", id.to_string())
        .map_err(ApiError::storage("Failed to update product"))?;
    if changed == 0 {
        return Err(ApiError::not_found("Product not found"));
    }
    info!(product_id = %id, "Product updated");
    find_product(&conn, id)?.ok_or_else(|| ApiError::not_found("Product not found"))
}

pub fn delete_product(db: &DbState, id: &str) -> ApiResult<()> {
    let conn = db.lock()?;
    let changed = conn
        .execute("DELETE FROM products WHERE id = ?1", params![id])
        .map_err(ApiError::storage("Failed to delete product"))?;
    if changed == 0 {
        return Err(ApiError::not_found("Product not found"));
    }
    info!(product_id = %id, "Product deleted");
    Ok(())
}

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

pub fn list_categories(db: &DbState) -> ApiResult<Vec<Category>> {
    let conn = db.lock()?;
    let mut stmt = conn
        .prepare("SELECT id, name, tag, icon FROM categories ORDER BY rowid")
        .map_err(ApiError::storage("Failed to load categories"))?;
    let rows = stmt
        .query_map([], row_to_category)
        .map_err(ApiError::storage("Failed to load categories"))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(ApiError::storage("Failed to load categories"))
}

fn find_category(conn: &Connection, id: &str) -> ApiResult<Option<Category>> {
    conn.query_row(
        "SELECT id, name, tag, icon FROM categories WHERE id = ?1",
        params![id],
        row_to_category,
    )
    .optional()
    .map_err(ApiError::storage("Failed to load category"))
}

/// The id defaults to a slug of the name and never changes afterwards.
pub fn create_category(db: &DbState, payload: &Value) -> ApiResult<Category> {
    let name = value_str(payload, &["name"])
        .ok_or_else(|| ApiError::bad_request("Category name is required"))?;
    let id = slugify(&value_str(payload, &["id"]).unwrap_or_else(|| name.clone()));
    if id.is_empty() {
        return Err(ApiError::bad_request("Category id is required"));
    }

    let category = Category {
        id,
        name,
        tag: optional_text(payload, &["tag"]).flatten(),
        icon: optional_text(payload, &["icon"]).flatten(),
    };

    let conn = db.lock()?;
    if category_exists(&conn, &category.id)? {
        return Err(ApiError::conflict("Category already exists"));
    }
    conn.execute(
        "INSERT INTO categories (id, name, tag, icon) VALUES (?1, ?2, ?3, ?4)",
        params![category.id, category.name, category.tag, category.icon],
    )
    .map_err(ApiError::storage("Failed to create category"))?;

    info!(category_id = %category.id, "Category created");
    Ok(category)
}

pub fn update_category(db: &DbState, id: &str, payload: &Value) -> ApiResult<Category> {
    let mut changes = Assignments::default();
    if payload.get("name").is_some() {
        let name = value_str(payload, &["name"])
            .ok_or_else(|| ApiError::bad_request("Category name is required"))?;
        changes.set("name", name);
    }
    for column in ["tag", "icon"] {
        if let Some(value) = optional_text(payload, &[column]) {
            changes.set(column, value);
        }
    }
    if changes.is_empty() {
        return Err(ApiError::bad_request("No changes provided"));
    }

    let conn = db.lock()?;
    let changed = changes
        .apply(&conn, "categories", "id", id.to_string())
        .map_err(ApiError::storage("Failed to update category"))?;
    if changed == 0 {
        return Err(ApiError::not_found("Category not found"));
    }
    find_category(&conn, id)?.ok_or_else(|| ApiError::not_found("Category not found"))
}

/// Refuses with 409 while any product references the category.
pub fn delete_category(db: &DbState, id: &str) -> ApiResult<()> {
    let conn = db.lock()?;
    if find_category(&conn, id)?.is_none() {
        return Err(ApiError::not_found("Category not found"));
    }
    let in_use: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM products WHERE category_id = ?1",
            params![id],
            |row| row.get(0),
        )
        .map_err(ApiError::storage("Failed to delete category"))?;
    if in_use > 0 {
        return Err(ApiError::conflict(format!(
            "Category is in use by {in_use} product(s)"
        )));
    }
    conn.execute("DELETE FROM categories WHERE id = ?1", params![id])
        .map_err(ApiError::storage("Failed to delete category"))?;
    info!(category_id = %id, "Category deleted");
    Ok(())
}
