//! SQLite database layer for RepairDesk.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the per-tenant
//! settings store, and the shared connection state used by the HTTP
//! handlers and background workers.

use rusqlite::{params, Connection, ErrorCode};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult};

/// Shared state holding the database connection.
#[derive(Debug)]
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection for the duration of one unit of work.
    pub fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        Ok(self.conn.lock()?)
    }
}

pub const DB_FILE_NAME: &str = "repairdesk.db";

/// Current schema version. Bump when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: i32 = 8;

/// Initialize the database at `{data_dir}/repairdesk.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. A file that is not a database is moved
/// aside and a fresh one is created.
pub fn init(data_dir: &Path) -> AppResult<DbState> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) if is_not_a_database(&first_err) => {
            let aside = db_path.with_extension(format!(
                "corrupt-{}",
                chrono::Utc::now().format("%Y%m%d%H%M%S")
            ));
            warn!(
                "Database file unreadable ({first_err}), moving it to {} and starting fresh",
                aside.display()
            );
            fs::rename(&db_path, &aside)?;
            let _ = fs::remove_file(db_path.with_extension("db-wal"));
            let _ = fs::remove_file(db_path.with_extension("db-shm"));
            open_and_configure(&db_path)?
        }
        Err(e) => return Err(e.into()),
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

fn is_not_a_database(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt)
    )
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    // Forces a read of the header so a garbage file fails here.
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })?;

    Ok(conn)
}

/// Current applied schema version.
pub fn schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
pub fn run_migrations(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current = schema_version(conn);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    let migrations: [(i32, &str, &str); 8] = [
        (1, "tenants and users", MIGRATION_V1),
        (2, "customers and recipients", MIGRATION_V2),
        (3, "devices", MIGRATION_V3),
        (4, "inventory", MIGRATION_V4),
        (5, "appointments", MIGRATION_V5),
        (6, "sms", MIGRATION_V6),
        (7, "notifications", MIGRATION_V7),
        (8, "sales and feedback", MIGRATION_V8),
    ];

    for (version, label, sql) in migrations {
        if current >= version {
            continue;
        }
        apply_migration(conn, version, sql).map_err(|e| {
            error!("Migration v{version} failed: {e}");
            AppError::internal(format!("migration v{version}: {e}"))
        })?;
        info!("Applied migration v{version} ({label})");
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: i32, sql: &str) -> Result<(), rusqlite::Error> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(sql)?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![version],
    )?;
    tx.commit()
}

/// Migration v1: tenants, per-tenant settings, staff users.
const MIGRATION_V1: &str = "
    CREATE TABLE IF NOT EXISTS tenants (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        slug TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tenant_settings (
        id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
        tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
        setting_category TEXT NOT NULL,
        setting_key TEXT NOT NULL,
        setting_value TEXT NOT NULL,
        updated_at TEXT DEFAULT (datetime('now')),
        UNIQUE(tenant_id, setting_category, setting_key)
    );

    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
        email TEXT NOT NULL,
        full_name TEXT NOT NULL,
        phone TEXT,
        role TEXT NOT NULL CHECK (role IN ('admin', 'manager', 'technician', 'receptionist')),
        password_hash TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        failed_attempts INTEGER NOT NULL DEFAULT 0,
        last_failed_at TEXT,
        last_login_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(tenant_id, email)
    );

    CREATE INDEX IF NOT EXISTS idx_users_tenant ON users(tenant_id);
";

/// Migration v2: customers, categories, recipient groups.
const MIGRATION_V2: &str = "
    CREATE TABLE IF NOT EXISTS customers (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
        full_name TEXT NOT NULL,
        phone TEXT NOT NULL,
        email TEXT,
        address TEXT,
        city TEXT,
        preferred_language TEXT NOT NULL DEFAULT 'am'
            CHECK (preferred_language IN ('am', 'en', 'mixed')),
        notes TEXT,
        version INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(tenant_id, phone)
    );

    CREATE TABLE IF NOT EXISTS customer_categories (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        description TEXT,
        filter TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(tenant_id, name)
    );

    CREATE TABLE IF NOT EXISTS recipient_groups (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        description TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(tenant_id, name)
    );

    CREATE TABLE IF NOT EXISTS recipient_group_members (
        group_id TEXT NOT NULL REFERENCES recipient_groups(id) ON DELETE CASCADE,
        customer_id TEXT NOT NULL REFERENCES customers(id) ON DELETE CASCADE,
        added_at TEXT NOT NULL,
        PRIMARY KEY (group_id, customer_id)
    );

    CREATE INDEX IF NOT EXISTS idx_customers_tenant ON customers(tenant_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_customers_name ON customers(tenant_id, full_name);
";

/// Migration v3: devices and their status history.
const MIGRATION_V3: &str = "
    CREATE TABLE IF NOT EXISTS devices (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
        customer_id TEXT NOT NULL REFERENCES customers(id),
        tracking_code TEXT NOT NULL,
        device_type TEXT NOT NULL
            CHECK (device_type IN ('phone', 'tablet', 'laptop', 'desktop', 'smartwatch', 'console', 'other')),
        brand TEXT,
        model TEXT,
        serial_number TEXT,
        issue_description TEXT NOT NULL,
        condition_notes TEXT,
        accessories TEXT,
        status TEXT NOT NULL DEFAULT 'registered'
            CHECK (status IN ('registered', 'diagnosed', 'awaiting_parts', 'in_progress',
                              'ready_for_pickup', 'delivered', 'unrepairable', 'cancelled')),
        priority TEXT NOT NULL DEFAULT 'normal'
            CHECK (priority IN ('low', 'normal', 'high', 'urgent')),
        technician_id TEXT REFERENCES users(id) ON DELETE SET NULL,
        location TEXT,
        estimated_cost REAL,
        final_cost REAL,
        deposit_paid REAL NOT NULL DEFAULT 0,
        expected_ready_at TEXT,
        delivered_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(tenant_id, tracking_code)
    );

    CREATE TABLE IF NOT EXISTS device_status_history (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        device_id TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
        from_status TEXT,
        to_status TEXT NOT NULL,
        note TEXT,
        changed_by TEXT,
        changed_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_devices_tenant_status ON devices(tenant_id, status);
    CREATE INDEX IF NOT EXISTS idx_devices_customer ON devices(customer_id);
    CREATE INDEX IF NOT EXISTS idx_devices_created ON devices(tenant_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_device_history_device ON device_status_history(device_id, changed_at);
    CREATE INDEX IF NOT EXISTS idx_device_history_tenant ON device_status_history(tenant_id, to_status, changed_at);
";

/// Migration v4: inventory, stock movements, parts used on devices.
const MIGRATION_V4: &str = "
    CREATE TABLE IF NOT EXISTS inventory_items (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
        sku TEXT NOT NULL,
        name TEXT NOT NULL,
        category TEXT,
        compatible_models TEXT,
        quantity INTEGER NOT NULL DEFAULT 0 CHECK (quantity >= 0),
        reorder_level INTEGER NOT NULL DEFAULT 0,
        unit_cost REAL NOT NULL DEFAULT 0,
        unit_price REAL NOT NULL DEFAULT 0,
        location TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(tenant_id, sku)
    );

    CREATE TABLE IF NOT EXISTS stock_movements (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        item_id TEXT NOT NULL REFERENCES inventory_items(id),
        change INTEGER NOT NULL,
        quantity_after INTEGER NOT NULL,
        reason TEXT NOT NULL
            CHECK (reason IN ('purchase', 'sale', 'repair_use', 'adjustment', 'return')),
        reference TEXT,
        note TEXT,
        created_by TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS device_parts (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        device_id TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
        item_id TEXT NOT NULL REFERENCES inventory_items(id),
        quantity INTEGER NOT NULL CHECK (quantity > 0),
        unit_price REAL NOT NULL,
        movement_id TEXT,
        created_by TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_inventory_tenant ON inventory_items(tenant_id, name);
    CREATE INDEX IF NOT EXISTS idx_stock_movements_item ON stock_movements(item_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_device_parts_device ON device_parts(device_id);
";

/// Migration v5: appointments.
const MIGRATION_V5: &str = "
    CREATE TABLE IF NOT EXISTS appointments (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
        customer_id TEXT NOT NULL REFERENCES customers(id),
        device_id TEXT REFERENCES devices(id) ON DELETE SET NULL,
        technician_id TEXT REFERENCES users(id) ON DELETE SET NULL,
        purpose TEXT NOT NULL,
        starts_at TEXT NOT NULL,
        ends_at TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'scheduled'
            CHECK (status IN ('scheduled', 'confirmed', 'completed', 'cancelled', 'no_show')),
        notes TEXT,
        reminder_sent_at TEXT,
        created_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_appointments_tenant_start ON appointments(tenant_id, starts_at);
    CREATE INDEX IF NOT EXISTS idx_appointments_technician ON appointments(technician_id, starts_at);
";

/// Migration v6: SMS templates, campaigns, outbound queue.
const MIGRATION_V6: &str = "
    CREATE TABLE IF NOT EXISTS sms_templates (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        language TEXT NOT NULL CHECK (language IN ('am', 'en', 'mixed')),
        body TEXT NOT NULL,
        trigger_event TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(tenant_id, name, language)
    );

    CREATE TABLE IF NOT EXISTS sms_campaigns (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        template_id TEXT REFERENCES sms_templates(id) ON DELETE SET NULL,
        target_type TEXT NOT NULL CHECK (target_type IN ('category', 'group', 'customers')),
        target_id TEXT,
        total_recipients INTEGER NOT NULL DEFAULT 0,
        queued_count INTEGER NOT NULL DEFAULT 0,
        skipped_count INTEGER NOT NULL DEFAULT 0,
        created_by TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sms_messages (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
        customer_id TEXT REFERENCES customers(id) ON DELETE SET NULL,
        recipient TEXT NOT NULL,
        body TEXT NOT NULL,
        template_id TEXT REFERENCES sms_templates(id) ON DELETE SET NULL,
        campaign_id TEXT REFERENCES sms_campaigns(id) ON DELETE SET NULL,
        context TEXT NOT NULL DEFAULT 'manual',
        reference_id TEXT,
        status TEXT NOT NULL DEFAULT 'queued'
            CHECK (status IN ('queued', 'sending', 'sent', 'failed')),
        encoding TEXT NOT NULL DEFAULT 'gsm7',
        segments INTEGER NOT NULL DEFAULT 1,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        provider_message_id TEXT,
        next_attempt_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        sent_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_sms_templates_trigger ON sms_templates(tenant_id, trigger_event);
    CREATE INDEX IF NOT EXISTS idx_sms_messages_status ON sms_messages(status, next_attempt_at);
    CREATE INDEX IF NOT EXISTS idx_sms_messages_tenant ON sms_messages(tenant_id, created_at);
";

/// Migration v7: notification preferences and in-app inbox.
const MIGRATION_V7: &str = "
    CREATE TABLE IF NOT EXISTS notification_preferences (
        tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        notification_type TEXT NOT NULL,
        email INTEGER NOT NULL,
        sms INTEGER NOT NULL,
        push INTEGER NOT NULL,
        in_app INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (user_id, notification_type)
    );

    CREATE TABLE IF NOT EXISTS notifications (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        notification_type TEXT NOT NULL,
        title TEXT NOT NULL,
        body TEXT NOT NULL,
        reference_id TEXT,
        channels TEXT NOT NULL DEFAULT '[]',
        read_at TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, read_at, created_at);
";

/// Migration v8: sales and customer feedback.
const MIGRATION_V8: &str = "
    CREATE TABLE IF NOT EXISTS sales (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
        device_id TEXT REFERENCES devices(id) ON DELETE SET NULL,
        customer_id TEXT REFERENCES customers(id) ON DELETE SET NULL,
        amount REAL NOT NULL CHECK (amount > 0),
        payment_method TEXT NOT NULL
            CHECK (payment_method IN ('cash', 'card', 'mobile_money', 'bank_transfer')),
        kind TEXT NOT NULL DEFAULT 'repair'
            CHECK (kind IN ('repair', 'part_sale', 'accessory', 'other')),
        note TEXT,
        created_by TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS feedback (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
        device_id TEXT NOT NULL UNIQUE REFERENCES devices(id) ON DELETE CASCADE,
        customer_id TEXT REFERENCES customers(id) ON DELETE SET NULL,
        rating INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
        comment TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sales_tenant_created ON sales(tenant_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_feedback_tenant_created ON feedback(tenant_id, created_at);
";

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, tenant_id: &str, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM tenant_settings
         WHERE tenant_id = ?1 AND setting_category = ?2 AND setting_key = ?3",
        params![tenant_id, category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    tenant_id: &str,
    category: &str,
    key: &str,
    value: &str,
) -> AppResult<()> {
    conn.execute(
        "INSERT INTO tenant_settings (tenant_id, setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))
         ON CONFLICT(tenant_id, setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![tenant_id, category, key, value],
    )?;
    Ok(())
}

/// Get all settings of a tenant grouped by category as JSON.
pub fn get_all_settings(conn: &Connection, tenant_id: &str) -> AppResult<serde_json::Value> {
    let mut stmt = conn.prepare(
        "SELECT setting_category, setting_key, setting_value FROM tenant_settings
         WHERE tenant_id = ?1
         ORDER BY setting_category, setting_key",
    )?;

    let mut result = serde_json::Map::new();

    let rows = stmt.query_map(params![tenant_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    for (cat, key, val) in rows.flatten() {
        let category = result.entry(cat).or_insert_with(|| serde_json::json!({}));
        if let serde_json::Value::Object(ref mut map) = category {
            map.insert(key, serde_json::Value::String(val));
        }
    }

    Ok(serde_json::Value::Object(result))
}

/// Delete all settings of a tenant in a category.
pub fn delete_category(conn: &Connection, tenant_id: &str, category: &str) -> AppResult<usize> {
    Ok(conn.execute(
        "DELETE FROM tenant_settings WHERE tenant_id = ?1 AND setting_category = ?2",
        params![tenant_id, category],
    )?)
}

/// Snapshot the whole database into `target` (`VACUUM INTO`).
pub fn backup_to(conn: &Connection, target: &Path) -> AppResult<()> {
    if target.exists() {
        return Err(AppError::conflict(format!(
            "backup target already exists: {}",
            target.display()
        )));
    }
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let target_str = target
        .to_str()
        .ok_or_else(|| AppError::validation("backup path must be valid UTF-8"))?;
    conn.execute("VACUUM INTO ?1", params![target_str])?;
    info!(target = %target.display(), "Database snapshot written");
    Ok(())
}

/// In-memory database with every migration applied.
#[cfg(test)]
pub fn test_state() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .expect("pragma setup");
    run_migrations(&conn).expect("run_migrations should succeed in test");
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .expect("pragma setup");
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    fn seed_tenant(conn: &Connection, id: &str) {
        conn.execute(
            "INSERT INTO tenants (id, name, slug, created_at, updated_at)
             VALUES (?1, 'Shop', ?1, datetime('now'), datetime('now'))",
            params![id],
        )
        .expect("insert tenant");
    }

    #[test]
    fn test_migrations_v1_to_latest() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let tables = table_names(&conn);
        for expected in [
            "tenants",
            "tenant_settings",
            "users",
            "customers",
            "customer_categories",
            "recipient_groups",
            "recipient_group_members",
            "devices",
            "device_status_history",
            "inventory_items",
            "stock_movements",
            "device_parts",
            "appointments",
            "sms_templates",
            "sms_campaigns",
            "sms_messages",
            "notification_preferences",
            "notifications",
            "sales",
            "feedback",
        ] {
            assert!(
                tables.iter().any(|t| t == expected),
                "missing table {expected}"
            );
        }
        assert_eq!(schema_version(&conn), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, CURRENT_SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_device_status_check_constraint() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");
        seed_tenant(&conn, "t1");
        conn.execute(
            "INSERT INTO customers (id, tenant_id, full_name, phone, created_at, updated_at)
             VALUES ('c1', 't1', 'Abebe', '+251911000000', datetime('now'), datetime('now'))",
            [],
        )
        .expect("insert customer");

        let bad = conn.execute(
            "INSERT INTO devices (id, tenant_id, customer_id, tracking_code, device_type,
                                  issue_description, status, created_at, updated_at)
             VALUES ('d1', 't1', 'c1', 'RD-AAAAAA', 'phone', 'cracked', 'lost',
                     datetime('now'), datetime('now'))",
            [],
        );
        assert!(bad.is_err(), "unknown status should be rejected");
    }

    #[test]
    fn test_inventory_quantity_cannot_go_negative() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");
        seed_tenant(&conn, "t1");
        let bad = conn.execute(
            "INSERT INTO inventory_items (id, tenant_id, sku, name, quantity, created_at, updated_at)
             VALUES ('i1', 't1', 'SKU', 'Screen', -1, datetime('now'), datetime('now'))",
            [],
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_settings_crud() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");
        seed_tenant(&conn, "t1");
        seed_tenant(&conn, "t2");

        set_setting(&conn, "t1", "shop", "currency", "ETB").expect("set");
        assert_eq!(
            get_setting(&conn, "t1", "shop", "currency"),
            Some("ETB".to_string())
        );
        assert!(get_setting(&conn, "t2", "shop", "currency").is_none());

        set_setting(&conn, "t1", "shop", "currency", "USD").expect("update");
        let all = get_all_settings(&conn, "t1").expect("all");
        assert_eq!(all["shop"]["currency"], "USD");

        assert_eq!(delete_category(&conn, "t1", "shop").expect("delete"), 1);
        assert!(get_setting(&conn, "t1", "shop", "currency").is_none());
    }

    #[test]
    fn test_init_creates_file_and_backup_snapshot() {
        let dir = std::env::temp_dir().join(format!("repairdesk_db_{}", uuid::Uuid::new_v4()));
        let state = init(&dir).expect("init");
        assert!(state.db_path.exists());

        let target = dir.join("snapshots").join("copy.db");
        {
            let conn = state.lock().expect("lock");
            backup_to(&conn, &target).expect("backup");
            assert!(backup_to(&conn, &target).is_err(), "existing target is refused");
        }
        let copy = Connection::open(&target).expect("open snapshot");
        assert_eq!(schema_version(&copy), CURRENT_SCHEMA_VERSION);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_init_moves_garbage_file_aside() {
        let dir = std::env::temp_dir().join(format!("repairdesk_db_bad_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DB_FILE_NAME), b"definitely not sqlite, just some bytes here").unwrap();

        let state = init(&dir).expect("init recovers");
        let conn = state.lock().unwrap();
        assert_eq!(schema_version(&conn), CURRENT_SCHEMA_VERSION);
        let aside = fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .any(|e| e.file_name().to_string_lossy().contains("corrupt-"));
        assert!(aside, "original file should be kept aside");
        drop(conn);

        let _ = fs::remove_dir_all(&dir);
    }
}
