//! Customer and admin accounts.
//!
//! Emails are stored lowercased; lookups compare `lower(email)` so rows
//! written before normalisation still match.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::auth::{hash_password, normalize_email};
use crate::config::Config;
use crate::db::{Assignments, DbState};
use crate::error::{ApiError, ApiResult};
use crate::value_str;

pub const ROLE_USER: &str = "user";
pub const ROLE_ADMIN: &str = "admin";

const USER_COLUMNS: &str = "id, name, email, phone, whatsapp, role, created_at, updated_at";
const ADMIN_LIST_LIMIT: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub name: Option<String>,
    pub email: String,
    pub phone: Option<String>,
    pub whatsapp: Option<String>,
    pub role: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub phone: String,
    pub whatsapp: String,
    pub role: String,
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        whatsapp: row.get(4)?,
        role: row
            .get::<_, Option<String>>(5)?
            .unwrap_or_else(|| ROLE_USER.to_string()),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn parse_role(raw: Option<String>) -> ApiResult<Option<&'static str>> {
    match raw.as_deref().map(str::to_lowercase).as_deref() {
        None => Ok(None),
        Some(ROLE_USER) => Ok(Some(ROLE_USER)),
        Some(ROLE_ADMIN) => Ok(Some(ROLE_ADMIN)),
        Some(_) => Err(ApiError::bad_request("role must be user or admin")),
    }
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

pub fn get_user(conn: &Connection, id: i64) -> ApiResult<Option<User>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        params![id],
        row_to_user,
    )
    .optional()
    .map_err(ApiError::storage("Failed to load user"))
}

/// User plus password hash, for sign-in.
pub fn find_with_hash(conn: &Connection, email: &str) -> ApiResult<Option<(User, String)>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS}, password_hash FROM users WHERE lower(email) = ?1"),
        params![normalize_email(email)],
        |row| Ok((row_to_user(row)?, row.get::<_, String>(8)?)),
    )
    .optional()
    .map_err(ApiError::storage("Failed to load user"))
}

fn email_taken(conn: &Connection, email: &str) -> ApiResult<bool> {
    conn.query_row(
        "SELECT 1 FROM users WHERE lower(email) = ?1",
        params![normalize_email(email)],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(ApiError::storage("Failed to check email"))
}

fn admin_count(conn: &Connection) -> ApiResult<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM users WHERE role = ?1",
        params![ROLE_ADMIN],
        |row| row.get(0),
    )
    .map_err(ApiError::storage("Failed to count admins"))
}

/// Insert a user. The email is normalised here; 409 if it is taken.
pub fn insert_user(conn: &Connection, new: &NewUser) -> ApiResult<User> {
    let email = normalize_email(&new.email);
    if email_taken(conn, &email)? {
        return Err(ApiError::conflict("Email already registered"));
    }
    conn.execute(
        "INSERT INTO users (name, email, password_hash, phone, whatsapp, role)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![new.name, email, new.password_hash, new.phone, new.whatsapp, new.role],
    )
    .map_err(ApiError::storage("Failed to create user"))?;

    let id = conn.last_insert_rowid();
    get_user(conn, id)?.ok_or_else(|| ApiError::internal("Failed to create user", "row vanished"))
}

// ---------------------------------------------------------------------------
// Own profile
// ---------------------------------------------------------------------------

pub fn get_profile(db: &DbState, user_id: i64) -> ApiResult<User> {
    let conn = db.lock()?;
    get_user(&conn, user_id)?.ok_or_else(|| ApiError::not_found("User not found"))
}

pub fn update_own_whatsapp(db: &DbState, user_id: i64, payload: &Value) -> ApiResult<()> {
    let whatsapp = value_str(payload, &["whatsapp"]).unwrap_or_default();
    let conn = db.lock()?;
    let changed = conn
        .execute(
            "UPDATE users SET whatsapp = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![whatsapp, user_id],
        )
        .map_err(ApiError::storage("Failed to update WhatsApp"))?;
    if changed == 0 {
        return Err(ApiError::not_found("User not found"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Admin management
// ---------------------------------------------------------------------------

pub fn list_users(db: &DbState) -> ApiResult<Vec<User>> {
    let conn = db.lock()?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY created_at DESC, id DESC LIMIT ?1"
        ))
        .map_err(ApiError::storage("Failed to load users"))?;
    let rows = stmt
        .query_map(params![ADMIN_LIST_LIMIT], row_to_user)
        .map_err(ApiError::storage("Failed to load users"))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(ApiError::storage("Failed to load users"))
}

pub fn admin_create_user(db: &DbState, cost: u32, payload: &Value) -> ApiResult<User> {
    let email = value_str(payload, &["email"]).map(|e| normalize_email(&e));
    let password = payload
        .get("password")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty());
    let (Some(email), Some(password)) = (email, password) else {
        return Err(ApiError::bad_request("Email and password are required"));
    };
    let role = parse_role(value_str(payload, &["role"]))?.unwrap_or(ROLE_USER);

    let password_hash = hash_password(password, cost)?;
    let conn = db.lock()?;
    let user = insert_user(
        &conn,
        &NewUser {
            name: value_str(payload, &["name"]).unwrap_or_default(),
            email,
            password_hash,
            phone: value_str(payload, &["phone"]).unwrap_or_default(),
            whatsapp: value_str(payload, &["whatsapp"]).unwrap_or_default(),
            role: role.to_string(),
        },
    )?;
    info!(user_id = user.id, role = %user.role, "Admin created user");
    Ok(user)
}

pub fn admin_update_user(db: &DbState, id: i64, payload: &Value) -> ApiResult<User> {
    let role = parse_role(value_str(payload, &["role"]))?;
    let text = |key: &str| {
        payload
            .get(key)
            .map(|v| v.as_str().unwrap_or_default().trim().to_string())
    };

    let mut changes = Assignments::default();
    for column in ["name", "phone", "whatsapp"] {
        if let Some(value) = text(column) {
            changes.set(column, value);
        }
    }
    if let Some(role) = role {
        changes.set("role", role.to_string());
    }
    if changes.is_empty() {
        return Err(ApiError::bad_request("No changes provided"));
    }
    changes.also("updated_at = datetime('now')");

    let conn = db.lock()?;
    let current = get_user(&conn, id)?.ok_or_else(|| ApiError::not_found("User not found"))?;
    if role == Some(ROLE_USER) && current.role == ROLE_ADMIN && admin_count(&conn)? <= 1 {
        return Err(ApiError::conflict("Cannot demote the last admin"));
    }

    changes
        .apply(&conn, "users", "id", id)
        .map_err(ApiError::storage("Failed to update user"))?;
    get_user(&conn, id)?.ok_or_else(|| ApiError::not_found("User not found"))
}

/// Delete an account. Their feedback stays, detached from the user.
pub fn admin_delete_user(db: &DbState, id: i64, acting_user: Option<i64>) -> ApiResult<()> {
    if acting_user == Some(id) {
        return Err(ApiError::bad_request("You cannot delete your own account"));
    }

    let conn = db.lock()?;
    let target = get_user(&conn, id)?.ok_or_else(|| ApiError::not_found("User not found"))?;
    if target.role == ROLE_ADMIN && admin_count(&conn)? <= 1 {
        return Err(ApiError::conflict("Cannot delete the last admin"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(ApiError::storage("Failed to delete user"))?;
    tx.execute("UPDATE feedback SET user_id = NULL WHERE user_id = ?1", params![id])
        .map_err(ApiError::storage("Failed to delete user"))?;
    tx.execute("DELETE FROM users WHERE id = ?1", params![id])
        .map_err(ApiError::storage("Failed to delete user"))?;
    tx.commit().map_err(ApiError::storage("Failed to delete user"))?;

    info!(user_id = id, "User deleted");
    Ok(())
}

/// Create the configured bootstrap admin if no account has that email.
pub fn ensure_admin_user(db: &DbState, config: &Config) -> Result<(), String> {
    let conn = db.lock().map_err(|e| e.to_string())?;
    if email_taken(&conn, &config.admin_email).map_err(|e| e.to_string())? {
        return Ok(());
    }
    if config.admin_password == crate::config::DEFAULT_ADMIN_PASSWORD {
        warn!("ADMIN_PASSWORD is not set; bootstrap admin uses the default password");
    }
    let password_hash =
        hash_password(&config.admin_password, config.bcrypt_cost).map_err(|e| e.to_string())?;
    insert_user(
        &conn,
        &NewUser {
            name: "Admin".into(),
            email: config.admin_email.clone(),
            password_hash,
            phone: String::new(),
            whatsapp: String::new(),
            role: ROLE_ADMIN.into(),
        },
    )
    .map_err(|e| e.to_string())?;
    info!(email = %config.admin_email, "Admin user ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    const COST: u32 = 4;

    fn setup() -> DbState {
        db::open_in_memory().unwrap()
    }

    fn create(db: &DbState, email: &str, role: &str) -> User {
        admin_create_user(db, COST, &json!({ "email": email, "password": "pw", "role": role })).unwrap()
    }

    #[test]
    fn test_ensure_admin_user_is_idempotent() {
        let db = setup();
        let config = Config {
            bcrypt_cost: COST,
            ..Config::default()
        };
        ensure_admin_user(&db, &config).unwrap();
        ensure_admin_user(&db, &config).unwrap();
        let admins: Vec<_> = list_users(&db)
            .unwrap()
            .into_iter()
            .filter(|u| u.role == ROLE_ADMIN)
            .collect();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].email, config.admin_email);
    }

    #[test]
    fn test_admin_create_validates_role_and_email() {
        let db = setup();
        let bad_role = admin_create_user(&db, COST, &json!({ "email": "a@b.c", "password": "pw", "role": "owner" }));
        assert!(matches!(bad_role, Err(ApiError::BadRequest(_))));

        let user = create(&db, "Mixed@Case.com", "admin");
        assert_eq!(user.email, "mixed@case.com");
        assert_eq!(user.role, ROLE_ADMIN);

        let dup = admin_create_user(&db, COST, &json!({ "email": "MIXED@case.com", "password": "pw" }));
        assert!(matches!(dup, Err(ApiError::Conflict(_))));
    }

    #[test]
    fn test_update_user_partial() {
        let db = setup();
        let user = create(&db, "p@example.com", "user");
        let updated = admin_update_user(&db, user.id, &json!({ "phone": " 98000 " })).unwrap();
        assert_eq!(updated.phone.as_deref(), Some("98000"));
        assert_eq!(updated.email, "p@example.com");

        let none = admin_update_user(&db, user.id, &json!({ "email": "ignored@x.y" }));
        assert!(matches!(none, Err(ApiError::BadRequest(_))));

        let missing = admin_update_user(&db, 9999, &json!({ "name": "x" }));
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
    }

    #[test]
    fn test_last_admin_is_protected() {
        let db = setup();
        let admin = create(&db, "only@admin.com", "admin");

        let demote = admin_update_user(&db, admin.id, &json!({ "role": "user" }));
        assert!(matches!(demote, Err(ApiError::Conflict(_))));

        let delete = admin_delete_user(&db, admin.id, None);
        assert!(matches!(delete, Err(ApiError::Conflict(_))));

        let self_delete = admin_delete_user(&db, admin.id, Some(admin.id));
        assert!(matches!(self_delete, Err(ApiError::BadRequest(_))));

        let second = create(&db, "second@admin.com", "admin");
        admin_delete_user(&db, admin.id, Some(second.id)).unwrap();
        assert!(get_profile(&db, admin.id).is_err());
    }

    #[test]
    fn test_delete_user_detaches_feedback() {
        let db = setup();
        let user = create(&db, "fan@example.com", "user");
        {
            let conn = db.lock().unwrap();
            conn.execute(
                "INSERT INTO feedback (user_id, message, status) VALUES (?1, 'Nice', 'published')",
                params![user.id],
            )
            .unwrap();
        }
        admin_delete_user(&db, user.id, None).unwrap();

        let conn = db.lock().unwrap();
        let (count, linked): (i64, Option<i64>) = conn
            .query_row("SELECT COUNT(*), MAX(user_id) FROM feedback", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(linked, None);
    }

    #[test]
    fn test_update_own_whatsapp() {
        let db = setup();
        let user = create(&db, "wa@example.com", "user");
        update_own_whatsapp(&db, user.id, &json!({ "whatsapp": "9779812345678" })).unwrap();
        let profile = get_profile(&db, user.id).unwrap();
        assert_eq!(profile.whatsapp.as_deref(), Some("9779812345678"));
        assert!(matches!(
            update_own_whatsapp(&db, 4242, &json!({ "whatsapp": "1" })),
            Err(ApiError::NotFound(_))
        ));
    }
}
