//! Customer feedback and testimonials.
//!
//! Anonymous submissions wait for moderation (`new`). Submissions from a
//! signed-in customer are published immediately.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::catalog::page_bounds;
use crate::db::DbState;
use crate::error::{ApiError, ApiResult};
use crate::users;
use crate::{parse_int, value_str};

const PUBLIC_DEFAULT_LIMIT: i64 = 6;
const PUBLIC_MAX_LIMIT: i64 = 20;
const ADMIN_DEFAULT_LIMIT: i64 = 20;
const ADMIN_MAX_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackStatus {
    New,
    Published,
    Rejected,
}

impl FeedbackStatus {
    /// Accepts the stored names plus the console's `approved`/`pending`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "new" | "pending" => Some(Self::New),
            "published" | "approved" => Some(Self::Published),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Published => "published",
            Self::Rejected => "rejected",
        }
    }
}

/// Admin view of a feedback row.
#[derive(Debug, Clone, Serialize)]
pub struct Feedback {
    pub id: i64,
    pub created_at: Option<String>,
    pub user_id: Option<i64>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub rating: Option<i64>,
    pub message: String,
    pub status: String,
    pub user_email: Option<String>,
}

/// What the homepage shows.
#[derive(Debug, Clone, Serialize)]
pub struct Testimonial {
    pub id: i64,
    pub created_at: Option<String>,
    pub name: Option<String>,
    pub rating: Option<i64>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct Submitted {
    pub ok: bool,
    pub id: i64,
    pub status: FeedbackStatus,
}

/// Ratings are best-effort: unparseable becomes null, numbers are clamped.
pub fn parse_rating(raw: Option<&Value>) -> Option<i64> {
    let n = match raw? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => parse_int(s),
        _ => None,
    }?;
    Some(n.clamp(1, 5))
}

pub fn submit(db: &DbState, user_id: Option<i64>, payload: &Value) -> ApiResult<Submitted> {
    let message = value_str(payload, &["message"])
        .ok_or_else(|| ApiError::bad_request("Message is required"))?;
    let rating = parse_rating(payload.get("rating"));

    let conn = db.lock()?;
    // A token for an account that has since been deleted counts as anonymous.
    let author = match user_id {
        Some(id) => users::get_user(&conn, id)?,
        None => None,
    };
    let status = if author.is_some() {
        FeedbackStatus::Published
    } else {
        FeedbackStatus::New
    };
    let name = value_str(payload, &["name"])
        .or_else(|| author.as_ref().and_then(|u| u.name.clone()))
        .unwrap_or_default();
    let email = value_str(payload, &["email"])
        .or_else(|| author.as_ref().map(|u| u.email.clone()))
        .unwrap_or_default();

    conn.execute(
        "INSERT INTO feedback (user_id, name, email, rating, message, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            author.as_ref().map(|u| u.id),
            name,
            email,
            rating,
            message,
            status.as_str()
        ],
    )
    .map_err(ApiError::storage("Failed to submit feedback"))?;

    let id = conn.last_insert_rowid();
    info!(feedback_id = id, status = status.as_str(), "Feedback received");
    Ok(Submitted {
        ok: true,
        id,
        status,
    })
}

/// Published testimonials with a non-blank message, newest first.
pub fn list_public(db: &DbState, limit: Option<&str>) -> ApiResult<Vec<Testimonial>> {
    let (limit, _) = page_bounds(limit, None, PUBLIC_DEFAULT_LIMIT, PUBLIC_MAX_LIMIT);
    let conn = db.lock()?;
    let mut stmt = conn
        .prepare(
            "SELECT id, created_at, name, rating, message
             FROM feedback
             WHERE status = 'published'
               AND message IS NOT NULL
               AND TRIM(message) <> ''
             ORDER BY created_at DESC, id DESC
             LIMIT ?1",
        )
        .map_err(ApiError::storage("Failed to load feedback"))?;
    let rows = stmt
        .query_map(params![limit], |row| {
            Ok(Testimonial {
                id: row.get(0)?,
                created_at: row.get(1)?,
                name: row.get(2)?,
                rating: row.get(3)?,
                message: row.get(4)?,
            })
        })
        .map_err(ApiError::storage("Failed to load feedback"))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(ApiError::storage("Failed to load feedback"))
}

// ---------------------------------------------------------------------------
// Moderation
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct FeedbackQuery {
    pub status: Option<String>,
    pub q: Option<String>,
    pub page: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FeedbackPage {
    pub feedback: Vec<Feedback>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

fn row_to_feedback(row: &Row<'_>) -> rusqlite::Result<Feedback> {
    Ok(Feedback {
        id: row.get(0)?,
        created_at: row.get(1)?,
        user_id: row.get(2)?,
        name: row.get(3)?,
        email: row.get(4)?,
        rating: row.get(5)?,
        message: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        status: row
            .get::<_, Option<String>>(7)?
            .unwrap_or_else(|| FeedbackStatus::New.as_str().to_string()),
        user_email: row.get(8)?,
    })
}

pub fn admin_list(db: &DbState, query: &FeedbackQuery) -> ApiResult<FeedbackPage> {
    let mut clauses: Vec<&'static str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();

    match query.status.as_deref().map(str::trim) {
        None | Some("") | Some("all") => {}
        Some(raw) => {
            let status = FeedbackStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request("Invalid status filter"))?;
            clauses.push("f.status = ?");
            values.push(status.as_str().to_string().into());
        }
    }
    if let Some(q) = query.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        clauses.push(
            "(lower(COALESCE(f.name, '')) LIKE ?
              OR lower(COALESCE(f.email, '')) LIKE ?
              OR lower(COALESCE(f.message, '')) LIKE ?
              OR lower(COALESCE(u.email, '')) LIKE ?)",
        );
        let like = format!("%{}%", q.to_lowercase());
        for _ in 0..4 {
            values.push(like.clone().into());
        }
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let page = query
        .page
        .as_deref()
        .and_then(parse_int)
        .unwrap_or(1)
        .max(1);
    let (limit, _) = page_bounds(query.limit.as_deref(), None, ADMIN_DEFAULT_LIMIT, ADMIN_MAX_LIMIT);
    let offset = (page - 1).saturating_mul(limit);

    let conn = db.lock()?;
    let total: i64 = conn
        .query_row(
            &format!(
                "SELECT COUNT(*) FROM feedback f LEFT JOIN users u ON u.id = f.user_id{where_sql}"
            ),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )
        .map_err(ApiError::storage("Failed to load feedback"))?;

    values.push(limit.into());
    values.push(offset.into());
    let mut stmt = conn
        .prepare(&format!(
            "SELECT f.id, f.created_at, f.user_id, f.name, f.email, f.rating, f.message, f.status,
                    u.email AS user_email
             FROM feedback f
             LEFT JOIN users u ON u.id = f.user_id{where_sql}
             ORDER BY f.created_at DESC, f.id DESC
             LIMIT ? OFFSET ?"
        ))
        .map_err(ApiError::storage("Failed to load feedback"))?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), row_to_feedback)
        .map_err(ApiError::storage("Failed to load feedback"))?;
    let feedback = rows
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(ApiError::storage("Failed to load feedback"))?;

    Ok(FeedbackPage {
        feedback,
        total,
        page,
        limit,
    })
}

pub fn set_status(db: &DbState, id: i64, payload: &Value) -> ApiResult<FeedbackStatus> {
    let status = value_str(payload, &["status"])
        .as_deref()
        .and_then(FeedbackStatus::parse)
        .ok_or_else(|| ApiError::bad_request("status must be new, published or rejected"))?;

    let conn = db.lock()?;
    let changed = conn
        .execute(
            "UPDATE feedback SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )
        .map_err(ApiError::storage("Failed to update feedback"))?;
    if changed == 0 {
        return Err(ApiError::not_found("Feedback not found"));
    }
    info!(feedback_id = id, status = status.as_str(), "Feedback moderated");
    Ok(status)
}

pub fn delete(db: &DbState, id: i64) -> ApiResult<()> {
    let conn = db.lock()?;
    let existed = conn
        .query_row("SELECT 1 FROM feedback WHERE id = ?1", params![id], |_| Ok(()))
        .optional()
        .map_err(ApiError::storage("Failed to delete feedback"))?
        .is_some();
    if !existed {
        return Err(ApiError::not_found("Feedback not found"));
    }
    conn.execute("DELETE FROM feedback WHERE id = ?1", params![id])
        .map_err(ApiError::storage("Failed to delete feedback"))?;
    info!(feedback_id = id, "Feedback deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_password;
    use crate::db;
    use crate::users::{insert_user, NewUser, ROLE_USER};
    use serde_json::json;

    fn setup() -> DbState {
        db::open_in_memory().unwrap()
    }

    fn customer(db: &DbState, email: &str) -> i64 {
        let conn = db.lock().unwrap();
        insert_user(
            &conn,
            &NewUser {
                name: "Customer".into(),
                email: email.into(),
                password_hash: hash_password("pw", 4).unwrap(),
                phone: String::new(),
                whatsapp: String::new(),
                role: ROLE_USER.into(),
            },
        )
        .unwrap()
        .id
    }

    #[test]
    fn test_parse_rating() {
        assert_eq!(parse_rating(Some(&json!(5))), Some(5));
        assert_eq!(parse_rating(Some(&json!("4"))), Some(4));
        assert_eq!(parse_rating(Some(&json!(9))), Some(5));
        assert_eq!(parse_rating(Some(&json!(0))), Some(1));
        assert_eq!(parse_rating(Some(&json!(3.7))), Some(3));
        assert_eq!(parse_rating(Some(&json!("great"))), None);
        assert_eq!(parse_rating(Some(&json!(null))), None);
        assert_eq!(parse_rating(None), None);
    }

    #[test]
    fn test_status_aliases() {
        assert_eq!(FeedbackStatus::parse("approved"), Some(FeedbackStatus::Published));
        assert_eq!(FeedbackStatus::parse(" Pending "), Some(FeedbackStatus::New));
        assert_eq!(FeedbackStatus::parse("spam"), None);
    }

    #[test]
    fn test_anonymous_is_new_and_signed_in_is_published() {
        let db = setup();
        let body = json!({ "rating": 5, "message": "Great" });

        let anon = submit(&db, None, &body).unwrap();
        assert_eq!(anon.status, FeedbackStatus::New);

        let uid = customer(&db, "fan@example.com");
        let signed = submit(&db, Some(uid), &body).unwrap();
        assert_eq!(signed.status, FeedbackStatus::Published);

        let public = list_public(&db, None).unwrap();
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].id, signed.id);
        assert_eq!(public[0].name.as_deref(), Some("Customer"));
    }

    #[test]
    fn test_message_required() {
        let db = setup();
        let result = submit(&db, None, &json!({ "rating": 5, "message": "   " }));
        assert!(matches!(result, Err(ApiError::BadRequest(m)) if m == "Message is required"));
    }

    #[test]
    fn test_moderation_and_search() {
        let db = setup();
        let uid = customer(&db, "linked@example.com");
        let a = submit(&db, None, &json!({ "name": "Bikash", "message": "Fast delivery" })).unwrap();
        submit(&db, None, &json!({ "name": "Sunita", "message": "Slow reply" })).unwrap();
        submit(&db, Some(uid), &json!({ "message": "Good prices" })).unwrap();

        let by_user_email = admin_list(
            &db,
            &FeedbackQuery {
                q: Some("LINKED@".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(by_user_email.total, 1);
        assert_eq!(by_user_email.feedback[0].user_email.as_deref(), Some("linked@example.com"));

        set_status(&db, a.id, &json!({ "status": "approved" })).unwrap();
        let published = admin_list(
            &db,
            &FeedbackQuery {
                status: Some("published".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(published.total, 2);

        let paged = admin_list(
            &db,
            &FeedbackQuery {
                status: Some("all".into()),
                page: Some("2".into()),
                limit: Some("2".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(paged.total, 3);
        assert_eq!(paged.feedback.len(), 1);
        assert_eq!(paged.page, 2);

        assert!(matches!(
            set_status(&db, a.id, &json!({ "status": "deleted" })),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            set_status(&db, 999, &json!({ "status": "rejected" })),
            Err(ApiError::NotFound(_))
        ));

        delete(&db, a.id).unwrap();
        assert!(matches!(delete(&db, a.id), Err(ApiError::NotFound(_))));
    }
}
