//! Tenant export bundles and whole-database snapshots.
//!
//! An export is a zip in the export directory named
//! `<slug>-export-<timestamp>.zip` holding `manifest.json` plus one JSON
//! array per table. Rows are dumped column by column, so new columns show up
//! without changes here. Password hashes are never selected and settings
//! whose key looks like a credential are redacted.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use chrono::{DateTime, Utc};
use rusqlite::{params, types::ValueRef, Connection};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::data_helpers::to_rfc3339;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::tenants::Tenant;

pub const EXPORT_FORMAT: &str = "repairdesk-tenant-export";
pub const EXPORT_FORMAT_VERSION: i64 = 1;

/// `(file stem, query)`; every query takes the tenant id as `?1`.
const TABLES: &[(&str, &str)] = &[
    (
        "users",
        "SELECT id, email, full_name, phone, role, is_active, last_login_at, created_at, updated_at
         FROM users WHERE tenant_id = ?1 ORDER BY created_at",
    ),
    ("customers", "SELECT * FROM customers WHERE tenant_id = ?1 ORDER BY created_at"),
    ("customer_categories", "SELECT * FROM customer_categories WHERE tenant_id = ?1 ORDER BY name"),
    ("recipient_groups", "SELECT * FROM recipient_groups WHERE tenant_id = ?1 ORDER BY name"),
    (
        "recipient_group_members",
        "SELECT m.* FROM recipient_group_members m
         JOIN recipient_groups g ON g.id = m.group_id
         WHERE g.tenant_id = ?1 ORDER BY m.group_id, m.added_at",
    ),
    ("devices", "SELECT * FROM devices WHERE tenant_id = ?1 ORDER BY created_at"),
    (
        "device_status_history",
        "SELECT * FROM device_status_history WHERE tenant_id = ?1 ORDER BY changed_at, rowid",
    ),
    ("device_parts", "SELECT * FROM device_parts WHERE tenant_id = ?1 ORDER BY created_at"),
    ("inventory_items", "SELECT * FROM inventory_items WHERE tenant_id = ?1 ORDER BY sku"),
    ("stock_movements", "SELECT * FROM stock_movements WHERE tenant_id = ?1 ORDER BY created_at, rowid"),
    ("appointments", "SELECT * FROM appointments WHERE tenant_id = ?1 ORDER BY starts_at"),
    ("sms_templates", "SELECT * FROM sms_templates WHERE tenant_id = ?1 ORDER BY name, language"),
    ("sms_campaigns", "SELECT * FROM sms_campaigns WHERE tenant_id = ?1 ORDER BY created_at"),
    ("sms_messages", "SELECT * FROM sms_messages WHERE tenant_id = ?1 ORDER BY created_at, rowid"),
    ("sales", "SELECT * FROM sales WHERE tenant_id = ?1 ORDER BY created_at"),
    ("feedback", "SELECT * FROM feedback WHERE tenant_id = ?1 ORDER BY created_at"),
];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportFile {
    pub file_name: String,
    pub size_bytes: u64,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    #[serde(flatten)]
    pub file: ExportFile,
    pub tables: BTreeMap<String, usize>,
}

fn json_cell(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(base64::engine::general_purpose::STANDARD.encode(b)),
    }
}

/// Run `sql` with the tenant id and return every row as a JSON object keyed
/// by column name.
fn dump(conn: &Connection, sql: &str, tenant_id: &str) -> AppResult<Vec<Value>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query(params![tenant_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut obj = Map::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            obj.insert(name.clone(), json_cell(row.get_ref(i)?));
        }
        out.push(Value::Object(obj));
    }
    Ok(out)
}

fn should_redact_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase();
    ["api_key", "apikey", "secret", "password", "token", "authorization", "pin"]
        .iter()
        .any(|marker| normalized.contains(marker))
}

fn redact_settings(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, v)| {
                    if should_redact_key(&key) {
                        (key, Value::String("[REDACTED]".into()))
                    } else {
                        (key, redact_settings(v))
                    }
                })
                .collect(),
        ),
        other => other,
    }
}

fn is_export_name(name: &str, slug: &str) -> bool {
    name.starts_with(&format!("{slug}-export-"))
        && name.ends_with(".zip")
        && !name.contains(['/', '\\'])
        && !name.contains("..")
}

fn describe(path: &Path) -> AppResult<ExportFile> {
    let meta = fs::metadata(path)?;
    let created_at = meta
        .modified()
        .ok()
        .map(|t| to_rfc3339(DateTime::<Utc>::from(t)));
    Ok(ExportFile {
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size_bytes: meta.len(),
        created_at,
    })
}

/// Write a tenant export into `export_dir`.
pub fn export_tenant(
    conn: &Connection,
    tenant: &Tenant,
    export_dir: &Path,
    now: DateTime<Utc>,
) -> AppResult<ExportSummary> {
    fs::create_dir_all(export_dir)?;
    let file_name = format!("{}-export-{}.zip", tenant.slug, now.format("%Y%m%d-%H%M%S-%3f"));
    let final_path = export_dir.join(&file_name);
    if final_path.exists() {
        return Err(AppError::conflict(format!("{file_name} already exists")));
    }
    let partial = export_dir.join(format!("{file_name}.part"));

    let mut zip = zip::ZipWriter::new(fs::File::create(&partial)?);
    let zip_options =
        zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut tables = BTreeMap::new();
    let result: AppResult<()> = (|| {
        for (name, sql) in TABLES {
            let rows = dump(conn, sql, &tenant.id)?;
            tables.insert(name.to_string(), rows.len());
            zip.start_file(format!("{name}.json"), zip_options)?;
            zip.write_all(serde_json::to_string_pretty(&rows)?.as_bytes())?;
        }

        let settings = redact_settings(db::get_all_settings(conn, &tenant.id)?);
        zip.start_file("settings.json", zip_options)?;
        zip.write_all(serde_json::to_string_pretty(&settings)?.as_bytes())?;

        let manifest = json!({
            "format": EXPORT_FORMAT,
            "formatVersion": EXPORT_FORMAT_VERSION,
            "appVersion": env!("CARGO_PKG_VERSION"),
            "schemaVersion": db::schema_version(conn),
            "exportedAt": to_rfc3339(now),
            "tenant": { "id": tenant.id, "name": tenant.name, "slug": tenant.slug },
            "tables": tables,
        });
        zip.start_file("manifest.json", zip_options)?;
        zip.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())?;
        Ok(())
    })();

    let finished = result.and_then(|()| zip.finish().map(|_| ()).map_err(AppError::from));
    if let Err(e) = finished {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    fs::rename(&partial, &final_path)?;

    let file = describe(&final_path)?;
    info!(
        tenant_id = %tenant.id,
        file = %file.file_name,
        size_bytes = file.size_bytes,
        "tenant export written"
    );
    Ok(ExportSummary { file, tables })
}

/// The tenant's finished exports, newest first.
pub fn list_exports(export_dir: &Path, slug: &str) -> AppResult<Vec<ExportFile>> {
    if !export_dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(export_dir)?.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_export_name(&name, slug) && entry.path().is_file() {
            files.push(describe(&entry.path())?);
        }
    }
    files.sort_by(|a, b| b.file_name.cmp(&a.file_name));
    Ok(files)
}

/// Resolve a download request to a path inside `export_dir`. Names outside
/// the tenant's prefix are reported as missing.
pub fn export_path(export_dir: &Path, slug: &str, file_name: &str) -> AppResult<PathBuf> {
    if !is_export_name(file_name, slug) {
        return Err(AppError::not_found("Export"));
    }
    let path = export_dir.join(file_name);
    if !path.is_file() {
        return Err(AppError::not_found("Export"));
    }
    Ok(path)
}

/// Full database snapshot for the `backup` CLI command.
pub fn snapshot(conn: &Connection, output: &Path) -> AppResult<()> {
    db::backup_to(conn, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    use crate::tenants::fixtures;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("repairdesk_{tag}_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn read_entry(path: &Path, name: &str) -> Value {
        let mut archive = zip::ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
        let mut entry = archive.by_name(name).unwrap();
        let mut text = String::new();
        entry.read_to_string(&mut text).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn export_contains_only_this_tenant() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let bole = fixtures::shop(&conn, "bole");
        let piassa = fixtures::shop(&conn, "piassa");
        let c = fixtures::customer(&conn, &bole.tenant.id, "Almaz", "0911000111");
        fixtures::device(&conn, &bole.tenant.id, &c.id);
        fixtures::customer(&conn, &piassa.tenant.id, "Bekele", "0911000222");
        db::set_setting(&conn, &bole.tenant.id, "sms", "gateway_api_key", "hunter2").unwrap();

        let dir = temp_dir("export");
        let summary = export_tenant(&conn, &bole.tenant, &dir, Utc::now()).unwrap();
        assert!(summary.file.file_name.starts_with("bole-export-"));
        assert_eq!(summary.tables["customers"], 1);
        assert_eq!(summary.tables["devices"], 1);
        assert_eq!(summary.tables["device_status_history"], 1);

        let path = dir.join(&summary.file.file_name);
        let manifest = read_entry(&path, "manifest.json");
        assert_eq!(manifest["tenant"]["slug"], json!("bole"));
        assert_eq!(manifest["format"], json!(EXPORT_FORMAT));

        let customers = read_entry(&path, "customers.json");
        assert_eq!(customers.as_array().unwrap().len(), 1);
        assert_eq!(customers[0]["full_name"], json!("Almaz"));

        let users = read_entry(&path, "users.json");
        assert!(users[0].get("password_hash").is_none());
        assert!(users[0].get("email").is_some());

        let settings = read_entry(&path, "settings.json");
        assert_eq!(settings["sms"]["gateway_api_key"], json!("[REDACTED]"));
        assert_eq!(settings["shop"]["name"], json!("Shop bole"));

        assert!(!dir.join(format!("{}.part", summary.file.file_name)).exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn listing_and_download_stay_inside_the_tenant() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let bole = fixtures::shop(&conn, "bole");
        let piassa = fixtures::shop(&conn, "piassa");
        let dir = temp_dir("listing");

        let a = export_tenant(&conn, &bole.tenant, &dir, Utc::now()).unwrap();
        export_tenant(&conn, &piassa.tenant, &dir, Utc::now()).unwrap();
        fs::write(dir.join("notes.txt"), "x").unwrap();

        let listed = list_exports(&dir, "bole").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_name, a.file.file_name);

        assert!(export_path(&dir, "bole", &a.file.file_name).is_ok());
        assert!(matches!(
            export_path(&dir, "piassa", &a.file.file_name),
            Err(AppError::NotFound(_))
        ));
        assert!(export_path(&dir, "bole", "../bole-export-x.zip").is_err());
        assert!(export_path(&dir, "bole", "bole-export-missing.zip").is_err());
        assert!(list_exports(&dir.join("nowhere"), "bole").unwrap().is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn snapshot_refuses_to_overwrite() {
        let dir = temp_dir("snapshot");
        let state = db::init(&dir).unwrap();
        let conn = state.lock().unwrap();
        let target = dir.join("copy.db");
        snapshot(&conn, &target).unwrap();
        assert!(target.exists());
        assert!(matches!(snapshot(&conn, &target), Err(AppError::Conflict(_))));
        drop(conn);
        let _ = fs::remove_dir_all(&dir);
    }
}
