//! Checkout log.
//!
//! An order row records that a customer reached the WhatsApp/eSewa step. It
//! is append-only: nothing here updates or deletes orders. The full request
//! body is kept in `raw_cart_json`; the normalised columns hold the first
//! cart line's product and the summed quantity.

use rusqlite::{params, Row};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::db::DbState;
use crate::error::{ApiError, ApiResult};
use crate::{value_i64, value_str};

const LIST_LIMIT: i64 = 200;
const DEFAULT_STATUS: &str = "created";

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: i64,
    pub created_at: Option<String>,
    pub customer_name: Option<String>,
    pub game_uid: Option<String>,
    pub product_id: Option<String>,
    pub quantity: Option<i64>,
    pub total_npr: Option<i64>,
    pub payment_method: Option<String>,
    pub status: Option<String>,
    pub whatsapp: Option<String>,
    pub raw_cart_json: Option<String>,
    pub source: Option<String>,
}

fn row_to_order(row: &Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        id: row.get(0)?,
        created_at: row.get(1)?,
        customer_name: row.get(2)?,
        game_uid: row.get(3)?,
        product_id: row.get(4)?,
        quantity: row.get(5)?,
        total_npr: row.get(6)?,
        payment_method: row.get(7)?,
        status: row.get(8)?,
        whatsapp: row.get(9)?,
        raw_cart_json: row.get(10)?,
        source: row.get(11)?,
    })
}

/// Normalised columns derived from a checkout body.
#[derive(Debug, PartialEq)]
struct OrderDraft {
    customer_name: Option<String>,
    game_uid: Option<String>,
    product_id: Option<String>,
    quantity: Option<i64>,
    total_npr: Option<i64>,
    payment_method: Option<String>,
    status: String,
    whatsapp: Option<String>,
    source: Option<String>,
}

/// Cart line ids may arrive as strings or numbers.
fn line_id(line: &Value) -> Option<String> {
    match line.get("id")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn draft_from_body(body: &Value) -> OrderDraft {
    let lines: &[Value] = body
        .get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let quantity: i64 = lines
        .iter()
        .filter_map(|line| value_i64(line, &["qty", "quantity"]))
        .fold(0i64, |total, qty| total.saturating_add(qty));

    OrderDraft {
        customer_name: value_str(body, &["customerName", "customer_name"]),
        game_uid: value_str(body, &["gameUid", "game_uid"]),
        product_id: lines
            .first()
            .and_then(line_id)
            .or_else(|| value_str(body, &["productId", "product_id"])),
        quantity: (quantity != 0).then_some(quantity),
        total_npr: value_i64(body, &["totalNpr", "total_npr"]),
        payment_method: value_str(body, &["paymentMethod", "method"]),
        status: value_str(body, &["status"]).unwrap_or_else(|| DEFAULT_STATUS.to_string()),
        whatsapp: value_str(body, &["whatsapp"]),
        source: value_str(body, &["source"]),
    }
}

/// Record a checkout attempt. No stock, payment or duplicate checks.
pub fn create_order(db: &DbState, body: &Value) -> ApiResult<i64> {
    let draft = draft_from_body(body);
    let raw = serde_json::to_string(body)
        .map_err(|e| ApiError::internal("Failed to create order", e))?;

    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO orders (
            customer_name, game_uid, product_id, quantity, total_npr,
            payment_method, status, whatsapp, raw_cart_json, source
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            draft.customer_name,
            draft.game_uid,
            draft.product_id,
            draft.quantity,
            draft.total_npr,
            draft.payment_method,
            draft.status,
            draft.whatsapp,
            raw,
            draft.source,
        ],
    )
    .map_err(ApiError::storage("Failed to create order"))?;

    let id = conn.last_insert_rowid();
    info!(
        order_id = id,
        product_id = ?draft.product_id,
        total_npr = ?draft.total_npr,
        "Order recorded"
    );
    Ok(id)
}

/// Newest orders first.
pub fn list_orders(db: &DbState) -> ApiResult<Vec<Order>> {
    let conn = db.lock()?;
    let mut stmt = conn
        .prepare(
            "SELECT id, created_at, customer_name, game_uid, product_id, quantity, total_npr,
                    payment_method, status, whatsapp, raw_cart_json, source
             FROM orders
             ORDER BY created_at DESC, id DESC
             LIMIT ?1",
        )
        .map_err(ApiError::storage("Failed to load orders"))?;
    let rows = stmt
        .query_map(params![LIST_LIMIT], row_to_order)
        .map_err(ApiError::storage("Failed to load orders"))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(ApiError::storage("Failed to load orders"))
}
