//! System diagnostics for RepairDesk.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **System health**: database reachability and size, uptime, tenant
//!   workload counts, SMS queue backlog and recent delivery errors
//! - **Log rotation helpers**: used by `lib.rs` to keep the log directory
//!   bounded.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::appointments;
use crate::config::Config;
use crate::db::{self, DbState};
use crate::error::AppResult;
use crate::sms;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Rolling log file prefix (`repairdesk.YYYY-MM-DD`).
pub const LOG_FILE_PREFIX: &str = "repairdesk";

const RECENT_SMS_ERRORS: i64 = 10;

static STARTED_AT: OnceLock<DateTime<Utc>> = OnceLock::new();

/// Record process start. Later calls keep the first value.
pub fn mark_started() {
    let _ = STARTED_AT.set(Utc::now());
}

fn uptime_secs(now: DateTime<Utc>) -> i64 {
    STARTED_AT
        .get()
        .map(|start| (now - *start).num_seconds().max(0))
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// System health
// ---------------------------------------------------------------------------

/// Health report for one tenant. Database problems are reported in the
/// payload rather than failing the request.
pub fn get_system_health(db: &DbState, config: &Config, tenant_id: &str, now: DateTime<Utc>) -> AppResult<Value> {
    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).ok();
    let conn = db.lock()?;

    let reachable = conn
        .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .is_ok();
    let schema_version = db::schema_version(&conn);

    let tenant = match tenant_counts(&conn, tenant_id, now) {
        Ok(v) => v,
        Err(e) => {
            warn!(tenant_id, error = %e, "health counts failed");
            json!({ "error": e.to_string() })
        }
    };
    let backlog = sms::queue_backlog(&conn, tenant_id)?;
    let errors: Vec<Value> = sms::recent_errors(&conn, tenant_id, RECENT_SMS_ERRORS)?
        .into_iter()
        .map(|m| {
            json!({
                "id": m.id,
                "recipient": m.recipient,
                "status": m.status,
                "attempts": m.attempts,
                "lastError": m.last_error,
                "updatedAt": m.updated_at,
            })
        })
        .collect();
    let pending_reminders = appointments::pending_reminders(&conn, tenant_id, now)?;
    drop(conn);

    debug!(tenant_id, reachable, schema_version, "health collected");
    Ok(json!({
        "database": {
            "reachable": reachable,
            "schemaVersion": schema_version,
            "expectedSchemaVersion": db::CURRENT_SCHEMA_VERSION,
            "sizeBytes": db_size,
            "path": db.db_path.to_string_lossy(),
        },
        "uptimeSecs": uptime_secs(now),
        "checkedAt": crate::data_helpers::to_rfc3339(now),
        "tenant": tenant,
        "smsQueue": backlog,
        "smsRecentErrors": errors,
        "smsGateway": if config.sms_gateway_url.is_empty() { "log-only" } else { "http" },
        "pendingReminders": pending_reminders,
        "logDir": config.log_dir.to_string_lossy(),
    }))
}

fn tenant_counts(conn: &Connection, tenant_id: &str, now: DateTime<Utc>) -> AppResult<Value> {
    let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, params![tenant_id], |row| row.get(0)) };
    let customers = count("SELECT COUNT(*) FROM customers WHERE tenant_id = ?1")?;
    let open_devices = count(
        "SELECT COUNT(*) FROM devices WHERE tenant_id = ?1 AND status NOT IN ('delivered', 'cancelled')",
    )?;
    let low_stock = count(
        "SELECT COUNT(*) FROM inventory_items
         WHERE tenant_id = ?1 AND is_active = 1 AND quantity <= reorder_level",
    )?;
    let overdue_devices: i64 = conn.query_row(
        "SELECT COUNT(*) FROM devices
         WHERE tenant_id = ?1 AND expected_ready_at IS NOT NULL AND expected_ready_at < ?2
           AND status NOT IN ('ready_for_pickup', 'delivered', 'cancelled')",
        params![tenant_id, crate::data_helpers::to_rfc3339(now)],
        |row| row.get(0),
    )?;
    Ok(json!({
        "customers": customers,
        "openDevices": open_devices,
        "overdueDevices": overdue_devices,
        "lowStockItems": low_stock,
    }))
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

fn is_log_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n == LOG_FILE_PREFIX || n.starts_with(&format!("{LOG_FILE_PREFIX}.")))
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
/// Returns the number of files removed.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if is_log_file(&path) {
                if let Ok(meta) = entry.metadata() {
                    if let Ok(modified) = meta.modified() {
                        log_files.push((path, modified));
                    }
                }
            }
        }
    }

    // Newest first; ties broken by name so dated files sort stably.
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenants::fixtures;

    #[test]
    fn test_about_info_has_required_fields() {
        let info = get_about_info();
        assert!(info.get("version").is_some());
        assert!(info.get("buildTimestamp").is_some());
        assert!(info.get("gitSha").is_some());
        assert!(info.get("platform").is_some());
        assert!(info.get("arch").is_some());
    }

    #[test]
    fn test_system_health_reports_tenant_counts() {
        let dir = std::env::temp_dir().join(format!("diag_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let db_state = crate::db::init(&dir).unwrap();
        let config = Config::for_data_dir(dir.clone());
        let tid = {
            let conn = db_state.lock().unwrap();
            let shop = fixtures::shop(&conn, "bole");
            let c = fixtures::customer(&conn, &shop.tenant.id, "Almaz", "0911000111");
            let d = fixtures::device(&conn, &shop.tenant.id, &c.id);
            conn.execute(
                "UPDATE devices SET expected_ready_at = '2020-01-01T00:00:00Z' WHERE id = ?1",
                params![d.id],
            )
            .unwrap();
            shop.tenant.id
        };

        let health = get_system_health(&db_state, &config, &tid, Utc::now()).unwrap();
        assert_eq!(health["database"]["reachable"], json!(true));
        assert_eq!(
            health["database"]["schemaVersion"],
            json!(crate::db::CURRENT_SCHEMA_VERSION)
        );
        assert!(health["database"]["sizeBytes"].as_u64().unwrap() > 0);
        assert_eq!(health["tenant"]["customers"], json!(1));
        assert_eq!(health["tenant"]["openDevices"], json!(1));
        assert_eq!(health["tenant"]["overdueDevices"], json!(1));
        assert_eq!(health["smsQueue"]["queued"], json!(0));
        assert_eq!(health["smsGateway"], json!("log-only"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_prune_keeps_newest_log_files() {
        let dir = std::env::temp_dir().join(format!("diag_logs_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        for day in 1..=13 {
            std::fs::write(dir.join(format!("repairdesk.2026-01-{day:02}")), "x").unwrap();
        }
        std::fs::write(dir.join("unrelated.txt"), "keep").unwrap();

        assert_eq!(prune_old_logs(&dir), 3);
        let left = std::fs::read_dir(&dir).unwrap().count();
        assert_eq!(left, MAX_LOG_FILES + 1);
        assert!(dir.join("unrelated.txt").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
