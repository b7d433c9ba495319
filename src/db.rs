//! SQLite storage layer for the storefront.
//!
//! Uses rusqlite with WAL mode. Provides numbered forward-only migrations,
//! idempotent demo seeding, raw settings rows, and the shared `DbState`
//! handed to every route.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::error::{ApiError, ApiResult};

/// Shared database handle.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection for the duration of one handler operation.
    pub fn lock(&self) -> ApiResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ApiError::internal("Database unavailable", e))
    }
}

/// Current schema version. Bump when appending to `MIGRATIONS`.
pub const CURRENT_SCHEMA_VERSION: i32 = 4;

/// Settings rows that must always exist after initialization.
pub const DEFAULT_SETTINGS: &[(&str, &str)] = &[("whatsapp_number", ""), ("esewa_qr_filename", "")];

/// Open (or create) the database file, bring the schema up to date and seed
/// demo rows.
///
/// Only failing to open the file is fatal. Migration and seed failures are
/// logged and the server starts with whatever schema it has.
pub fn init(db_path: &Path) -> Result<DbState, String> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create data dir: {e}"))?;
    }

    info!("Opening database at {}", db_path.display());
    let conn = open_and_configure(db_path)?;
    prepare(&conn);

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: db_path.to_path_buf(),
    })
}

/// In-memory database with the full schema and seed data (tests, tooling).
pub fn open_in_memory() -> Result<DbState, String> {
    let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
    configure(&conn)?;
    prepare(&conn);
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn prepare(conn: &Connection) {
    match run_migrations(conn) {
        Ok(version) => info!("Database initialized (schema v{version})"),
        Err(e) => error!("Schema migration incomplete, continuing with partial schema: {e}"),
    }
    if let Err(e) = seed_demo_data(conn) {
        error!("Seeding failed: {e}");
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<(), String> {
    // Referential checks (category in use, feedback author) live in the
    // handlers; rows from older databases may not satisfy declared FKs.
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = OFF;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

struct Migration {
    version: i32,
    description: &'static str,
    apply: fn(&Connection) -> Result<(), String>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "core storefront tables",
        apply: migrate_v1,
    },
    Migration {
        version: 2,
        description: "order audit columns",
        apply: migrate_v2,
    },
    Migration {
        version: 3,
        description: "product display columns",
        apply: migrate_v3,
    },
    Migration {
        version: 4,
        description: "blog posts + lookup indexes",
        apply: migrate_v4,
    },
];

/// Highest applied migration, 0 for a fresh database.
pub fn schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

/// Apply every pending migration in order. Each migration commits together
/// with its `schema_version` row; the first failure stops the run.
pub fn run_migrations(conn: &Connection) -> Result<i32, String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current = schema_version(conn);
    if current >= CURRENT_SCHEMA_VERSION {
        debug!("Database schema up to date (v{current})");
        return Ok(current);
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply_migration(conn, migration).map_err(|e| {
            error!("Migration v{} failed: {e}", migration.version);
            format!("migration v{}: {e}", migration.version)
        })?;
        info!(
            "Applied migration v{} ({})",
            migration.version, migration.description
        );
    }

    Ok(schema_version(conn))
}

fn apply_migration(conn: &Connection, migration: &Migration) -> Result<(), String> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| format!("begin: {e}"))?;
    (migration.apply)(&tx)?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![migration.version],
    )
    .map_err(|e| format!("record version: {e}"))?;
    tx.commit().map_err(|e| format!("commit: {e}"))
}

/// Migration v1: core tables. `IF NOT EXISTS` adopts databases created before
/// version tracking existed.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            tag TEXT,
            icon TEXT
        );

        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            category_id TEXT NOT NULL,
            price_npr INTEGER NOT NULL,
            image TEXT,
            note TEXT,
            FOREIGN KEY (category_id) REFERENCES categories(id)
        );

        CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT DEFAULT (datetime('now')),
            customer_name TEXT,
            game_uid TEXT,
            product_id TEXT,
            quantity INTEGER,
            total_npr INTEGER,
            payment_method TEXT,
            status TEXT
        );

        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            name TEXT,
            email TEXT UNIQUE NOT NULL,
            password_hash TEXT NOT NULL,
            phone TEXT,
            whatsapp TEXT,
            role TEXT DEFAULT 'user'
        );

        CREATE TABLE IF NOT EXISTS feedback (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT DEFAULT (datetime('now')),
            user_id INTEGER,
            name TEXT,
            email TEXT,
            rating INTEGER,
            message TEXT NOT NULL,
            status TEXT DEFAULT 'new',
            FOREIGN KEY (user_id) REFERENCES users(id)
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT
        );
        ",
    )
    .map_err(|e| e.to_string())
}

/// Migration v2: order audit trail columns.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    add_column_if_missing(conn, "orders", "whatsapp", "TEXT")?;
    add_column_if_missing(conn, "orders", "raw_cart_json", "TEXT")?;
    add_column_if_missing(conn, "orders", "source", "TEXT")
}

/// Migration v3: product display columns (USD price, tier, stock label,
/// Nepali note).
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    add_column_if_missing(conn, "products", "price_usd", "REAL")?;
    add_column_if_missing(conn, "products", "tier", "TEXT")?;
    add_column_if_missing(conn, "products", "availability", "TEXT")?;
    add_column_if_missing(conn, "products", "note_ne", "TEXT")
}

/// Migration v4: blog posts and lookup indexes.
fn migrate_v4(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS blog_posts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            slug TEXT UNIQUE NOT NULL,
            title TEXT NOT NULL,
            summary TEXT,
            content TEXT,
            featured_image TEXT,
            published_at TEXT,
            status TEXT NOT NULL DEFAULT 'draft',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_blog_posts_status_published
            ON blog_posts(status, published_at);
        CREATE INDEX IF NOT EXISTS idx_products_category
            ON products(category_id);
        CREATE INDEX IF NOT EXISTS idx_feedback_status
            ON feedback(status);
        ",
    )
    .map_err(|e| e.to_string())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, String> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| format!("table_info {table}: {e}"))?;
    let mut rows = stmt
        .query([])
        .map_err(|e| format!("table_info query: {e}"))?;
    while let Some(row) = rows.next().map_err(|e| format!("table_info next: {e}"))? {
        let name: String = row.get(1).map_err(|e| format!("table_info name: {e}"))?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    sql_type: &str,
) -> Result<(), String> {
    if column_exists(conn, table, column)? {
        return Ok(());
    }
    conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {sql_type};"))
        .map_err(|e| format!("add {table}.{column}: {e}"))
}

// ---------------------------------------------------------------------------
// Seeding
// ---------------------------------------------------------------------------

struct SeedCategory {
    id: &'static str,
    name: &'static str,
    tag: &'static str,
    icon: &'static str,
}

struct SeedProduct {
    id: &'static str,
    name: &'static str,
    category: &'static str,
    price_npr: i64,
    price_usd: Option<f64>,
    tier: Option<&'static str>,
    availability: Option<&'static str>,
    image: &'static str,
    note: &'static str,
    note_ne: Option<&'static str>,
}

const SEED_CATEGORIES: &[SeedCategory] = &[
    SeedCategory { id: "freefire", name: "Free Fire Top Up", tag: "Top up diamonds instantly", icon: "FF" },
    SeedCategory { id: "pubg", name: "PUBG UC", tag: "UC pins & UID top-up", icon: "PG" },
    SeedCategory { id: "gift", name: "Gift Cards", tag: "Steam, Google Play & more", icon: "GC" },
    SeedCategory { id: "subscriptions", name: "Subscriptions", tag: "Premium tools and streaming", icon: "SUB" },
    SeedCategory { id: "spotify", name: "Spotify", tag: "Premium plans & top-ups", icon: "SP" },
    SeedCategory { id: "social", name: "Social Media Boost", tag: "Coins, credits & boosts", icon: "SM" },
    SeedCategory { id: "gears", name: "Gaming Gears", tag: "Mice, headsets, keyboards", icon: "GG" },
];

const SEED_PRODUCTS: &[SeedProduct] = &[
    SeedProduct {
        id: "p1",
        name: "Free Fire 530 Diamonds",
        category: "freefire",
        price_npr: 999,
        price_usd: None,
        tier: None,
        availability: Some("In stock"),
        image: "assets/product-2.svg",
        note: "Direct UID - Instant delivery",
        note_ne: None,
    },
    SeedProduct {
        id: "p2",
        name: "PUBG UC 600 (Global)",
        category: "pubg",
        price_npr: 1300,
        price_usd: None,
        tier: None,
        availability: Some("In stock"),
        image: "assets/product-1.svg",
        note: "UID top-up - 5-10 min",
        note_ne: None,
    },
    SeedProduct {
        id: "p3",
        name: "Google Play Gift Card $10",
        category: "gift",
        price_npr: 1550,
        price_usd: Some(10.0),
        tier: None,
        availability: Some("In stock"),
        image: "assets/product-5.svg",
        note: "US region - Digital code",
        note_ne: None,
    },
    SeedProduct {
        id: "p4",
        name: "Steam Wallet Code $20",
        category: "gift",
        price_npr: 3100,
        price_usd: Some(20.0),
        tier: None,
        availability: Some("In stock"),
        image: "assets/product-3.svg",
        note: "Global/US - Instant code",
        note_ne: None,
    },
    SeedProduct {
        id: "p5",
        name: "Netflix Premium (1 Month)",
        category: "subscriptions",
        price_npr: 1299,
        price_usd: Some(9.7),
        tier: Some("Premium Plan"),
        availability: Some("In stock"),
        image: "assets/product-4.svg",
        note: "Shared profile - 4K",
        note_ne: Some("शेयर प्रोफाइल - ४के"),
    },
    SeedProduct {
        id: "p6",
        name: "Spotify Premium (3 Months)",
        category: "spotify",
        price_npr: 1199,
        price_usd: None,
        tier: Some("Individual"),
        availability: Some("Limited"),
        image: "assets/product-3.svg",
        note: "Activation within 1 hour",
        note_ne: Some("१ घण्टाभित्र सक्रिय"),
    },
    SeedProduct {
        id: "p7",
        name: "TikTok Coins 350",
        category: "social",
        price_npr: 650,
        price_usd: None,
        tier: None,
        availability: Some("In stock"),
        image: "assets/product-7.svg",
        note: "Nepal payment - Quick delivery",
        note_ne: None,
    },
    SeedProduct {
        id: "p8",
        name: "Gaming Mouse RGB (Budget)",
        category: "gears",
        price_npr: 1499,
        price_usd: None,
        tier: None,
        availability: Some("In stock"),
        image: "assets/product-8.svg",
        note: "2-year warranty - DPI 6400",
        note_ne: None,
    },
];

const SEED_BLOG_POSTS: &[(&str, &str, &str, &str)] = &[
    (
        "how-to-top-up-free-fire",
        "How to top up Free Fire diamonds in Nepal",
        "Pay with eSewa, share your UID, and get diamonds in minutes.",
        "Pick a diamond pack, pay with eSewa or bank transfer, then send your player UID on WhatsApp. Most top-ups land within ten minutes.",
    ),
    (
        "gift-cards-explained",
        "Gift cards explained: regions and redemption",
        "Which Google Play or Steam card works for your account.",
        "Gift cards are tied to a store region. Check the region on your account before ordering; US cards work on US accounts only.",
    ),
];

/// Insert default settings and, on empty tables, demo catalog and blog rows.
pub fn seed_demo_data(conn: &Connection) -> Result<(), String> {
    for (key, value) in DEFAULT_SETTINGS {
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(|e| format!("default setting {key}: {e}"))?;
    }

    if table_is_empty(conn, "categories")? {
        info!("Seeding demo categories & products");
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| format!("seed begin: {e}"))?;
        for c in SEED_CATEGORIES {
            tx.execute(
                "INSERT INTO categories (id, name, tag, icon) VALUES (?1, ?2, ?3, ?4)",
                params![c.id, c.name, c.tag, c.icon],
            )
            .map_err(|e| format!("seed category {}: {e}", c.id))?;
        }
        for p in SEED_PRODUCTS {
            tx.execute(
                "INSERT OR IGNORE INTO products
                    (id, name, category_id, price_npr, price_usd, tier, availability, image, note, note_ne)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    p.id,
                    p.name,
                    p.category,
                    p.price_npr,
                    p.price_usd,
                    p.tier,
                    p.availability,
                    p.image,
                    p.note,
                    p.note_ne
                ],
            )
            .map_err(|e| format!("seed product {}: {e}", p.id))?;
        }
        tx.commit().map_err(|e| format!("seed commit: {e}"))?;
    } else {
        debug!("Categories already seeded");
    }

    if table_is_empty(conn, "blog_posts")? {
        info!("Seeding demo blog posts");
        for (slug, title, summary, content) in SEED_BLOG_POSTS {
            conn.execute(
                "INSERT OR IGNORE INTO blog_posts (slug, title, summary, content, status, published_at)
                 VALUES (?1, ?2, ?3, ?4, 'published', datetime('now'))",
                params![slug, title, summary, content],
            )
            .map_err(|e| format!("seed blog post {slug}: {e}"))?;
        }
    }

    Ok(())
}

fn table_is_empty(conn: &Connection, table: &str) -> Result<bool, String> {
    let count: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .map_err(|e| format!("count {table}: {e}"))?;
    Ok(count == 0)
}

// ---------------------------------------------------------------------------
// Settings rows
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT value FROM settings WHERE key = ?1",
        params![key],
        |row| row.get::<_, Option<String>>(0),
    )
    .optional()
    .unwrap_or_else(|e| {
        warn!("get_setting {key}: {e}");
        None
    })
    .flatten()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<(), String> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Partial updates
// ---------------------------------------------------------------------------

/// Column assignments for a PATCH-style `UPDATE`. Column names are always
/// static strings chosen by the caller, never request data.
#[derive(Default)]
pub struct Assignments {
    fragments: Vec<String>,
    values: Vec<SqlValue>,
    touched: bool,
}

impl Assignments {
    pub fn set(&mut self, column: &'static str, value: impl Into<SqlValue>) {
        self.values.push(value.into());
        self.fragments
            .push(format!("{column} = ?{}", self.values.len()));
        self.touched = true;
    }

    /// Raw SQL assignment that should ride along with real changes, e.g.
    /// `updated_at = datetime('now')`. Does not count as a change.
    pub fn also(&mut self, fragment: &'static str) {
        self.fragments.push(fragment.to_string());
    }

    pub fn is_empty(&self) -> bool {
        !self.touched
    }

    /// Run `UPDATE {table} SET ... WHERE {key_column} = ?`. Returns rows changed.
    pub fn apply(
        mut self,
        conn: &Connection,
        table: &str,
        key_column: &str,
        key: impl Into<SqlValue>,
    ) -> rusqlite::Result<usize> {
        self.values.push(key.into());
        let sql = format!(
            "UPDATE {table} SET {} WHERE {key_column} = ?{}",
            self.fragments.join(", "),
            self.values.len()
        );
        conn.execute(&sql, rusqlite::params_from_iter(self.values.iter()))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
