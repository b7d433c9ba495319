//! Blog posts: public reading list plus admin CRUD.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::catalog::page_bounds;
use crate::db::{Assignments, DbState};
use crate::error::{ApiError, ApiResult};
use crate::{slugify, value_str};

const PUBLIC_DEFAULT_LIMIT: i64 = 10;
const PUBLIC_MAX_LIMIT: i64 = 50;
const ADMIN_LIST_LIMIT: i64 = 200;

const POST_COLUMNS: &str = "id, slug, title, summary, content, featured_image, published_at, status, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlogStatus {
    Draft,
    Published,
}

impl BlogStatus {
    fn parse(raw: &str) -> ApiResult<Self> {
        match raw.trim().to_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "published" => Ok(Self::Published),
            _ => Err(ApiError::bad_request("status must be draft or published")),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BlogPost {
    pub id: i64,
    pub slug: String,
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub featured_image: Option<String>,
    pub published_at: Option<String>,
    pub status: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

fn row_to_post(row: &Row<'_>) -> rusqlite::Result<BlogPost> {
    Ok(BlogPost {
        id: row.get(0)?,
        slug: row.get(1)?,
        title: row.get(2)?,
        summary: row.get(3)?,
        content: row.get(4)?,
        featured_image: row.get(5)?,
        published_at: row.get(6)?,
        status: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn query_posts(conn: &Connection, sql: &str, limit: i64) -> ApiResult<Vec<BlogPost>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(ApiError::storage("Failed to load blog posts"))?;
    let rows = stmt
        .query_map(params![limit], row_to_post)
        .map_err(ApiError::storage("Failed to load blog posts"))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(ApiError::storage("Failed to load blog posts"))
}

fn find_post(conn: &Connection, id: i64) -> ApiResult<Option<BlogPost>> {
    conn.query_row(
        &format!("SELECT {POST_COLUMNS} FROM blog_posts WHERE id = ?1"),
        params![id],
        row_to_post,
    )
    .optional()
    .map_err(ApiError::storage("Failed to load blog post"))
}

fn slug_owner(conn: &Connection, slug: &str) -> ApiResult<Option<i64>> {
    conn.query_row(
        "SELECT id FROM blog_posts WHERE slug = ?1",
        params![slug],
        |row| row.get(0),
    )
    .optional()
    .map_err(ApiError::storage("Failed to load blog post"))
}

// ---------------------------------------------------------------------------
// Public
// ---------------------------------------------------------------------------

pub fn list_published(db: &DbState, limit: Option<&str>) -> ApiResult<Vec<BlogPost>> {
    let (limit, _) = page_bounds(limit, None, PUBLIC_DEFAULT_LIMIT, PUBLIC_MAX_LIMIT);
    let conn = db.lock()?;
    query_posts(
        &conn,
        &format!(
            "SELECT {POST_COLUMNS} FROM blog_posts
             WHERE status = 'published'
             ORDER BY published_at DESC, id DESC
             LIMIT ?1"
        ),
        limit,
    )
}

/// Drafts are invisible here; they 404 like a missing slug.
pub fn get_published(db: &DbState, slug: &str) -> ApiResult<BlogPost> {
    let conn = db.lock()?;
    conn.query_row(
        &format!("SELECT {POST_COLUMNS} FROM blog_posts WHERE slug = ?1 AND status = 'published'"),
        params![slug],
        row_to_post,
    )
    .optional()
    .map_err(ApiError::storage("Failed to load blog post"))?
    .ok_or_else(|| ApiError::not_found("Post not found"))
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

pub fn admin_list(db: &DbState) -> ApiResult<Vec<BlogPost>> {
    let conn = db.lock()?;
    query_posts(
        &conn,
        &format!(
            "SELECT {POST_COLUMNS} FROM blog_posts ORDER BY created_at DESC, id DESC LIMIT ?1"
        ),
        ADMIN_LIST_LIMIT,
    )
}

fn text_field(payload: &Value, keys: &[&str]) -> Option<Option<String>> {
    keys.iter().find_map(|k| payload.get(*k)).map(|v| {
        v.as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

pub fn create(db: &DbState, payload: &Value) -> ApiResult<BlogPost> {
    let title =
        value_str(payload, &["title"]).ok_or_else(|| ApiError::bad_request("Title is required"))?;
    let slug = slugify(&value_str(payload, &["slug"]).unwrap_or_else(|| title.clone()));
    if slug.is_empty() {
        return Err(ApiError::bad_request("Slug is required"));
    }
    let status = match value_str(payload, &["status"]) {
        Some(raw) => BlogStatus::parse(&raw)?,
        None => BlogStatus::Draft,
    };
    let published_at = value_str(payload, &["published_at", "publishedAt"]);

    let conn = db.lock()?;
    if slug_owner(&conn, &slug)?.is_some() {
        return Err(ApiError::conflict("Slug already exists"));
    }
    conn.execute(
        "INSERT INTO blog_posts (slug, title, summary, content, featured_image, status, published_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6,
                 CASE WHEN ?6 = 'published' THEN COALESCE(?7, datetime('now')) ELSE ?7 END)",
        params![
            slug,
            title,
            text_field(payload, &["summary"]).flatten(),
            text_field(payload, &["content"]).flatten(),
            text_field(payload, &["featured_image", "image"]).flatten(),
            status.as_str(),
            published_at,
        ],
    )
    .map_err(ApiError::storage("Failed to create blog post"))?;

    let id = conn.last_insert_rowid();
    info!(post_id = id, slug = %slug, "Blog post created");
    find_post(&conn, id)?.ok_or_else(|| ApiError::internal("Failed to create blog post", "row vanished"))
}

pub fn update(db: &DbState, id: i64, payload: &Value) -> ApiResult<BlogPost> {
    let mut changes = Assignments::default();

    if payload.get("title").is_some() {
        let title = value_str(payload, &["title"])
            .ok_or_else(|| ApiError::bad_request("Title is required"))?;
        changes.set("title", title);
    }
    let slug = match payload.get("slug") {
        Some(_) => {
            let slug = slugify(&value_str(payload, &["slug"]).unwrap_or_default());
            if slug.is_empty() {
                return Err(ApiError::bad_request("Slug is required"));
            }
            Some(slug)
        }
        None => None,
    };
    for (column, keys) in [
        ("summary", &["summary"][..]),
        ("content", &["content"][..]),
        ("featured_image", &["featured_image", "image"][..]),
    ] {
        if let Some(value) = text_field(payload, keys) {
            changes.set(column, value);
        }
    }
    let status = value_str(payload, &["status"])
        .map(|raw| BlogStatus::parse(&raw))
        .transpose()?;
    if let Some(status) = status {
        changes.set("status", status.as_str().to_string());
    }
    let publishing = status == Some(BlogStatus::Published);
    match text_field(payload, &["published_at", "publishedAt"]) {
        Some(Some(at)) => changes.set("published_at", at),
        Some(None) if !publishing => changes.set("published_at", None::<String>),
        _ if publishing => changes.also("published_at = COALESCE(published_at, datetime('now'))"),
        _ => {}
    }

    let conn = db.lock()?;
    if let Some(slug) = slug {
        if matches!(slug_owner(&conn, &slug)?, Some(owner) if owner != id) {
            return Err(ApiError::conflict("Slug already exists"));
        }
        changes.set("slug", slug);
    }
    if changes.is_empty() {
        return Err(ApiError::bad_request("No changes provided"));
    }
    changes.also("updated_at = datetime('now')");

    let changed = changes
        .apply(&conn, "blog_posts", "id", id)
        .map_err(ApiError::storage("Failed to update blog post"))?;
    if changed == 0 {
        return Err(ApiError::not_found("Post not found"));
    }
    find_post(&conn, id)?.ok_or_else(|| ApiError::not_found("Post not found"))
}

pub fn delete(db: &DbState, id: i64) -> ApiResult<()> {
    let conn = db.lock()?;
    let changed = conn
        .execute("DELETE FROM blog_posts WHERE id = ?1", params![id])
        .map_err(ApiError::storage("Failed to delete blog post"))?;
    if changed == 0 {
        return Err(ApiError::not_found("Post not found"));
    }
    info!(post_id = id, "Blog post deleted");
    Ok(())
}
