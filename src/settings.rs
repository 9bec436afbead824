//! Per-tenant settings on top of the `tenant_settings` key/value store.
//!
//! Every known key has a default and a validator; reads fill in defaults,
//! writes reject unknown keys.

use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::info;

use crate::db;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text(usize),
    Currency,
    CountryCode,
    Timezone,
    SenderId,
    Language,
    Bool,
    TrackingPrefix,
    Priority,
    Hours,
}

struct SettingDef {
    category: &'static str,
    key: &'static str,
    default: &'static str,
    kind: Kind,
}

const SETTINGS: &[SettingDef] = &[
    SettingDef { category: "shop", key: "name", default: "", kind: Kind::Text(100) },
    SettingDef { category: "shop", key: "phone", default: "", kind: Kind::Text(30) },
    SettingDef { category: "shop", key: "address", default: "", kind: Kind::Text(200) },
    SettingDef { category: "shop", key: "currency", default: "ETB", kind: Kind::Currency },
    SettingDef { category: "shop", key: "timezone", default: "Africa/Addis_Ababa", kind: Kind::Timezone },
    SettingDef { category: "shop", key: "country_code", default: "251", kind: Kind::CountryCode },
    SettingDef { category: "sms", key: "sender_id", default: "", kind: Kind::SenderId },
    SettingDef { category: "sms", key: "default_language", default: "am", kind: Kind::Language },
    SettingDef { category: "sms", key: "auto_notify", default: "true", kind: Kind::Bool },
    SettingDef { category: "devices", key: "tracking_prefix", default: "RD", kind: Kind::TrackingPrefix },
    SettingDef { category: "devices", key: "default_priority", default: "normal", kind: Kind::Priority },
    SettingDef { category: "appointments", key: "reminder_hours", default: "24", kind: Kind::Hours },
    SettingDef { category: "analytics", key: "demo_fallback", default: "false", kind: Kind::Bool },
];

pub const CATEGORIES: &[&str] = &["shop", "sms", "devices", "appointments", "analytics"];

fn definition(category: &str, key: &str) -> Option<&'static SettingDef> {
    SETTINGS
        .iter()
        .find(|d| d.category == category && d.key == key)
}

fn check_category(category: &str) -> AppResult<()> {
    if CATEGORIES.contains(&category) {
        Ok(())
    } else {
        Err(AppError::not_found(format!("Settings category '{category}'")))
    }
}

/// Validate and canonicalize one raw value.
fn normalize(def: &SettingDef, raw: &Value) -> AppResult<String> {
    let field = format!("{}.{}", def.category, def.key);
    let text = match raw {
        Value::String(s) => s.trim().to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => return Err(AppError::validation(format!("{field} must be a scalar value"))),
    };
    let invalid = |msg: &str| AppError::validation(format!("{field} {msg}"));

    match def.kind {
        Kind::Text(max) => {
            if text.chars().count() > max {
                return Err(invalid(&format!("must be at most {max} characters")));
            }
            Ok(text)
        }
        Kind::Currency => {
            if text.len() == 3 && text.chars().all(|c| c.is_ascii_alphabetic()) {
                Ok(text.to_ascii_uppercase())
            } else {
                Err(invalid("must be a 3-letter currency code"))
            }
        }
        Kind::CountryCode => {
            let digits = text.trim_start_matches('+');
            if (1..=3).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit()) {
                Ok(digits.to_string())
            } else {
                Err(invalid("must be 1 to 3 digits"))
            }
        }
        Kind::Timezone => {
            let ok = !text.is_empty()
                && text.len() <= 64
                && text
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '+'));
            if ok {
                Ok(text)
            } else {
                Err(invalid("must be an IANA timezone name"))
            }
        }
        Kind::SenderId => {
            if text.chars().count() <= 11 && text.chars().all(|c| c.is_ascii_alphanumeric() || c == ' ') {
                Ok(text)
            } else {
                Err(invalid("must be at most 11 letters or digits"))
            }
        }
        Kind::Language => {
            let lang = text.to_ascii_lowercase();
            if crate::customers::LANGUAGES.contains(&lang.as_str()) {
                Ok(lang)
            } else {
                Err(invalid("must be one of am, en, mixed"))
            }
        }
        Kind::Bool => crate::config::parse_bool(&text)
            .map(|b| b.to_string())
            .ok_or_else(|| invalid("must be a boolean")),
        Kind::TrackingPrefix => {
            if (1..=4).contains(&text.len()) && text.chars().all(|c| c.is_ascii_alphabetic()) {
                Ok(text.to_ascii_uppercase())
            } else {
                Err(invalid("must be 1 to 4 letters"))
            }
        }
        Kind::Priority => {
            let p = text.to_ascii_lowercase();
            if crate::devices::PRIORITIES.contains(&p.as_str()) {
                Ok(p)
            } else {
                Err(invalid("must be one of low, normal, high, urgent"))
            }
        }
        Kind::Hours => match text.parse::<i64>() {
            Ok(h) if (1..=168).contains(&h) => Ok(h.to_string()),
            _ => Err(invalid("must be a whole number between 1 and 168")),
        },
    }
}

fn render(def: &SettingDef, stored: &str) -> Value {
    match def.kind {
        Kind::Bool => Value::Bool(stored == "true"),
        Kind::Hours => stored
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(stored.to_string())),
        _ => Value::String(stored.to_string()),
    }
}

/// Write every default for a new tenant.
pub fn seed_defaults(conn: &Connection, tenant_id: &str, shop_name: &str) -> AppResult<()> {
    for def in SETTINGS {
        let value = if def.category == "shop" && def.key == "name" {
            shop_name
        } else {
            def.default
        };
        db::set_setting(conn, tenant_id, def.category, def.key, value)?;
    }
    Ok(())
}

/// Stored value or the key's default.
pub fn get_string(conn: &Connection, tenant_id: &str, category: &str, key: &str) -> String {
    db::get_setting(conn, tenant_id, category, key)
        .or_else(|| definition(category, key).map(|d| d.default.to_string()))
        .unwrap_or_default()
}

pub fn get_bool(conn: &Connection, tenant_id: &str, category: &str, key: &str) -> bool {
    crate::config::parse_bool(&get_string(conn, tenant_id, category, key)).unwrap_or(false)
}

pub fn country_code(conn: &Connection, tenant_id: &str) -> String {
    get_string(conn, tenant_id, "shop", "country_code")
}

pub fn default_language(conn: &Connection, tenant_id: &str) -> String {
    get_string(conn, tenant_id, "sms", "default_language")
}

pub fn auto_notify(conn: &Connection, tenant_id: &str) -> bool {
    get_bool(conn, tenant_id, "sms", "auto_notify")
}

pub fn tracking_prefix(conn: &Connection, tenant_id: &str) -> String {
    get_string(conn, tenant_id, "devices", "tracking_prefix")
}

pub fn default_priority(conn: &Connection, tenant_id: &str) -> String {
    get_string(conn, tenant_id, "devices", "default_priority")
}

pub fn reminder_hours(conn: &Connection, tenant_id: &str) -> i64 {
    get_string(conn, tenant_id, "appointments", "reminder_hours")
        .parse()
        .unwrap_or(24)
}

pub fn demo_fallback(conn: &Connection, tenant_id: &str) -> bool {
    get_bool(conn, tenant_id, "analytics", "demo_fallback")
}

fn category_json(conn: &Connection, tenant_id: &str, category: &str) -> Value {
    let mut map = Map::new();
    for def in SETTINGS.iter().filter(|d| d.category == category) {
        let stored = get_string(conn, tenant_id, def.category, def.key);
        map.insert(def.key.to_string(), render(def, &stored));
    }
    Value::Object(map)
}

/// All categories with defaults filled in.
pub fn get_all(conn: &Connection, tenant_id: &str) -> AppResult<Value> {
    let mut out = Map::new();
    for category in CATEGORIES {
        out.insert(category.to_string(), category_json(conn, tenant_id, category));
    }
    Ok(Value::Object(out))
}

/// Apply a partial object to one category. Nothing is written if any key
/// fails validation.
pub fn update_category(
    conn: &Connection,
    tenant_id: &str,
    category: &str,
    patch: &Value,
) -> AppResult<Value> {
    check_category(category)?;
    let obj = patch
        .as_object()
        .ok_or_else(|| AppError::validation("settings payload must be an object"))?;
    if obj.is_empty() {
        return Err(AppError::validation("settings payload is empty"));
    }

    let mut normalized = Vec::with_capacity(obj.len());
    for (key, raw) in obj {
        let def = definition(category, key).ok_or_else(|| {
            AppError::validation(format!("Unknown setting {category}.{key}"))
        })?;
        normalized.push((def.key, normalize(def, raw)?));
    }

    let tx = conn.unchecked_transaction()?;
    for (key, value) in &normalized {
        db::set_setting(&tx, tenant_id, category, key, value)?;
    }
    tx.commit()?;

    info!(tenant_id, category, keys = normalized.len(), "settings updated");
    Ok(category_json(conn, tenant_id, category))
}

/// Reset one category to defaults. The shop name is kept.
pub fn reset_category(conn: &Connection, tenant_id: &str, category: &str) -> AppResult<Value> {
    check_category(category)?;
    let shop_name = get_string(conn, tenant_id, "shop", "name");
    let tx = conn.unchecked_transaction()?;
    db::delete_category(&tx, tenant_id, category)?;
    if category == "shop" {
        db::set_setting(&tx, tenant_id, "shop", "name", &shop_name)?;
    }
    tx.commit()?;
    info!(tenant_id, category, "settings category reset");
    Ok(category_json(conn, tenant_id, category))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenants::fixtures;
    use serde_json::json;

    #[test]
    fn defaults_are_filled_in() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        db::delete_category(&conn, &shop.tenant.id, "sms").unwrap();

        let all = get_all(&conn, &shop.tenant.id).unwrap();
        assert_eq!(all["shop"]["currency"], "ETB");
        assert_eq!(all["sms"]["auto_notify"], true);
        assert_eq!(all["appointments"]["reminder_hours"], 24);
        assert_eq!(country_code(&conn, &shop.tenant.id), "251");
    }

    #[test]
    fn update_validates_and_canonicalizes() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;

        let updated = update_category(
            &conn,
            tid,
            "devices",
            &json!({ "tracking_prefix": "bf", "default_priority": "HIGH" }),
        )
        .unwrap();
        assert_eq!(updated["tracking_prefix"], "BF");
        assert_eq!(tracking_prefix(&conn, tid), "BF");
        assert_eq!(default_priority(&conn, tid), "high");

        assert!(update_category(&conn, tid, "devices", &json!({ "tracking_prefix": "TOOLONG" })).is_err());
        assert!(update_category(&conn, tid, "shop", &json!({ "currency": "birr" })).is_err());
        assert!(update_category(&conn, tid, "shop", &json!({ "favourite": "x" })).is_err());
        assert!(update_category(&conn, tid, "appointments", &json!({ "reminder_hours": 500 })).is_err());
        assert!(matches!(
            update_category(&conn, tid, "nope", &json!({ "a": 1 })),
            Err(AppError::NotFound(_))
        ));

        update_category(&conn, tid, "sms", &json!({ "auto_notify": false })).unwrap();
        assert!(!auto_notify(&conn, tid));
    }

    #[test]
    fn failed_update_writes_nothing() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        let result = update_category(
            &conn,
            tid,
            "shop",
            &json!({ "currency": "USD", "country_code": "abcd" }),
        );
        assert!(result.is_err());
        assert_eq!(get_string(&conn, tid, "shop", "currency"), "ETB");
    }

    #[test]
    fn reset_restores_defaults_but_keeps_shop_name() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        update_category(&conn, tid, "shop", &json!({ "currency": "USD" })).unwrap();
        let reset = reset_category(&conn, tid, "shop").unwrap();
        assert_eq!(reset["currency"], "ETB");
        assert_eq!(reset["name"], "Shop bole");
    }
}
