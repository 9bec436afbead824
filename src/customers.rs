//! Customer records.

use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data_helpers::{
    check_len, clean, is_valid_email, like_pattern, new_id, normalize_phone, now_rfc3339, Page,
    Pagination,
};
use crate::error::{AppError, AppResult};
use crate::settings;

pub const LANGUAGES: &[&str] = &["am", "en", "mixed"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    pub tenant_id: String,
    pub full_name: String,
    pub phone: String,
    pub email: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub preferred_language: String,
    pub notes: Option<String>,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerDetail {
    #[serde(flatten)]
    pub customer: Customer,
    pub device_count: i64,
    pub open_device_count: i64,
    pub appointment_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCustomer {
    #[serde(alias = "full_name", alias = "name")]
    pub full_name: String,
    #[serde(alias = "mobile", alias = "telephone")]
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default, alias = "preferred_language", alias = "language")]
    pub preferred_language: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Partial update. An empty string clears an optional field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerUpdate {
    #[serde(default, alias = "full_name", alias = "name")]
    pub full_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default, alias = "preferred_language", alias = "language")]
    pub preferred_language: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, alias = "expected_version", alias = "version")]
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct CustomerFilter {
    pub search: Option<String>,
    pub city: Option<String>,
    pub language: Option<String>,
    pub pagination: Pagination,
}

pub(crate) const CUSTOMER_COLUMNS: &str = "id, tenant_id, full_name, phone, email, address, city, \
     preferred_language, notes, version, created_at, updated_at";

pub(crate) fn customer_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Customer> {
    Ok(Customer {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        full_name: row.get(2)?,
        phone: row.get(3)?,
        email: row.get(4)?,
        address: row.get(5)?,
        city: row.get(6)?,
        preferred_language: row.get(7)?,
        notes: row.get(8)?,
        version: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn validate_language(lang: &str) -> AppResult<String> {
    let lang = lang.trim().to_lowercase();
    if LANGUAGES.contains(&lang.as_str()) {
        Ok(lang)
    } else {
        Err(AppError::validation(
            "preferredLanguage must be one of am, en, mixed",
        ))
    }
}

fn validate_email(email: Option<String>) -> AppResult<Option<String>> {
    match clean(email) {
        Some(e) => {
            let e = e.to_lowercase();
            if is_valid_email(&e) {
                Ok(Some(e))
            } else {
                Err(AppError::validation("email is not valid"))
            }
        }
        None => Ok(None),
    }
}

fn checked_optional(field: &str, value: Option<String>, max: usize) -> AppResult<Option<String>> {
    let value = clean(value);
    if let Some(ref v) = value {
        check_len(field, v, 1, max)?;
    }
    Ok(value)
}

fn normalized_phone(conn: &Connection, tenant_id: &str, raw: &str) -> AppResult<String> {
    if raw.trim().is_empty() {
        return Err(AppError::validation("phone is required"));
    }
    normalize_phone(raw, &settings::country_code(conn, tenant_id))
        .ok_or_else(|| AppError::validation("phone must have 10 to 15 digits"))
}

fn ensure_phone_free(
    conn: &Connection,
    tenant_id: &str,
    phone: &str,
    except_id: Option<&str>,
) -> AppResult<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM customers WHERE tenant_id = ?1 AND phone = ?2",
            params![tenant_id, phone],
            |row| row.get(0),
        )
        .optional()?;
    match existing {
        Some(id) if Some(id.as_str()) != except_id => Err(AppError::conflict(format!(
            "A customer with phone {phone} already exists"
        ))),
        _ => Ok(()),
    }
}

pub fn create_customer(conn: &Connection, tenant_id: &str, input: NewCustomer) -> AppResult<Customer> {
    let full_name = input.full_name.trim().to_string();
    check_len("fullName", &full_name, 2, 100)?;
    let phone = normalized_phone(conn, tenant_id, &input.phone)?;
    let email = validate_email(input.email)?;
    let language = match clean(input.preferred_language) {
        Some(lang) => validate_language(&lang)?,
        None => settings::default_language(conn, tenant_id),
    };
    let address = checked_optional("address", input.address, 200)?;
    let city = checked_optional("city", input.city, 100)?;
    let notes = checked_optional("notes", input.notes, 2000)?;

    ensure_phone_free(conn, tenant_id, &phone, None)?;

    let id = new_id("cust");
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO customers (id, tenant_id, full_name, phone, email, address, city,
                                preferred_language, notes, version, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?10)",
        params![id, tenant_id, full_name, phone, email, address, city, language, notes, now],
    )?;
    info!(tenant_id, customer_id = %id, "customer created");
    get_customer(conn, tenant_id, &id)
}

pub fn get_customer(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<Customer> {
    conn.query_row(
        &format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE tenant_id = ?1 AND id = ?2"),
        params![tenant_id, id],
        customer_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("Customer"))
}

pub fn get_customer_detail(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<CustomerDetail> {
    let customer = get_customer(conn, tenant_id, id)?;
    let (device_count, open_device_count): (i64, i64) = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN status NOT IN ('delivered', 'cancelled') THEN 1 ELSE 0 END), 0)
         FROM devices WHERE tenant_id = ?1 AND customer_id = ?2",
        params![tenant_id, id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let appointment_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM appointments WHERE tenant_id = ?1 AND customer_id = ?2",
        params![tenant_id, id],
        |row| row.get(0),
    )?;
    Ok(CustomerDetail {
        customer,
        device_count,
        open_device_count,
        appointment_count,
    })
}

pub fn list_customers(
    conn: &Connection,
    tenant_id: &str,
    filter: &CustomerFilter,
) -> AppResult<Page<Customer>> {
    let mut clauses = vec!["tenant_id = ?".to_string()];
    let mut args: Vec<SqlValue> = vec![tenant_id.to_string().into()];

    if let Some(term) = filter.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        clauses.push(
            "(full_name LIKE ? ESCAPE '\\' OR phone LIKE ? ESCAPE '\\' OR email LIKE ? ESCAPE '\\')"
                .into(),
        );
        let pattern = like_pattern(term);
        for _ in 0..3 {
            args.push(pattern.clone().into());
        }
    }
    if let Some(city) = filter.city.as_deref().filter(|c| !c.trim().is_empty()) {
        clauses.push("city = ? COLLATE NOCASE".into());
        args.push(city.trim().to_string().into());
    }
    if let Some(lang) = filter.language.as_deref().filter(|l| !l.trim().is_empty()) {
        clauses.push("preferred_language = ?".into());
        args.push(validate_language(lang)?.into());
    }

    let where_sql = clauses.join(" AND ");
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM customers WHERE {where_sql}"),
        params_from_iter(args.iter()),
        |row| row.get(0),
    )?;

    let mut page_args = args.clone();
    page_args.push(filter.pagination.page_size.into());
    page_args.push(filter.pagination.offset().into());
    let mut stmt = conn.prepare(&format!(
        "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE {where_sql}
         ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
    ))?;
    let items = stmt
        .query_map(params_from_iter(page_args.iter()), customer_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Page::new(items, total, filter.pagination))
}

pub fn update_customer(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
    update: CustomerUpdate,
) -> AppResult<Customer> {
    let current = get_customer(conn, tenant_id, id)?;
    if let Some(expected) = update.expected_version {
        if expected != current.version {
            return Err(AppError::conflict(format!(
                "Customer was modified (version {} != expected {expected})",
                current.version
            )));
        }
    }

    let full_name = match update.full_name {
        Some(name) => {
            let name = name.trim().to_string();
            check_len("fullName", &name, 2, 100)?;
            name
        }
        None => current.full_name.clone(),
    };
    let phone = match update.phone {
        Some(raw) => {
            let phone = normalized_phone(conn, tenant_id, &raw)?;
            ensure_phone_free(conn, tenant_id, &phone, Some(id))?;
            phone
        }
        None => current.phone.clone(),
    };
    let email = match update.email {
        Some(raw) => validate_email(Some(raw))?,
        None => current.email.clone(),
    };
    let address = match update.address {
        Some(raw) => checked_optional("address", Some(raw), 200)?,
        None => current.address.clone(),
    };
    let city = match update.city {
        Some(raw) => checked_optional("city", Some(raw), 100)?,
        None => current.city.clone(),
    };
    let notes = match update.notes {
        Some(raw) => checked_optional("notes", Some(raw), 2000)?,
        None => current.notes.clone(),
    };
    let language = match update.preferred_language {
        Some(raw) => validate_language(&raw)?,
        None => current.preferred_language.clone(),
    };

    // Version guard in the WHERE clause catches a concurrent writer.
    let changed = conn.execute(
        "UPDATE customers SET full_name = ?1, phone = ?2, email = ?3, address = ?4, city = ?5,
                preferred_language = ?6, notes = ?7, version = version + 1, updated_at = ?8
         WHERE tenant_id = ?9 AND id = ?10 AND version = ?11",
        params![
            full_name,
            phone,
            email,
            address,
            city,
            language,
            notes,
            now_rfc3339(),
            tenant_id,
            id,
            current.version
        ],
    )?;
    if changed == 0 {
        return Err(AppError::conflict("Customer was modified concurrently"));
    }
    get_customer(conn, tenant_id, id)
}

pub fn delete_customer(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<()> {
    get_customer(conn, tenant_id, id)?;
    let (devices, appointments): (i64, i64) = conn.query_row(
        "SELECT (SELECT COUNT(*) FROM devices WHERE customer_id = ?1),
                (SELECT COUNT(*) FROM appointments WHERE customer_id = ?1)",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    if devices > 0 || appointments > 0 {
        return Err(AppError::conflict(format!(
            "Customer still has {devices} device(s) and {appointments} appointment(s)"
        )));
    }
    conn.execute(
        "DELETE FROM customers WHERE tenant_id = ?1 AND id = ?2",
        params![tenant_id, id],
    )?;
    info!(tenant_id, customer_id = id, "customer deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::tenants::fixtures;

    fn new_customer(name: &str, phone: &str) -> NewCustomer {
        NewCustomer {
            full_name: name.into(),
            phone: phone.into(),
            email: None,
            address: None,
            city: None,
            preferred_language: None,
            notes: None,
        }
    }

    #[test]
    fn create_normalizes_phone_and_defaults_language() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let c = create_customer(&conn, &shop.tenant.id, new_customer("Abebe Kebede", "0911 234 567"))
            .unwrap();
        assert_eq!(c.phone, "+251911234567");
        assert_eq!(c.preferred_language, "am");
        assert_eq!(c.version, 1);
    }

    #[test]
    fn duplicate_phone_conflicts_within_tenant_only() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let a = fixtures::shop(&conn, "bole");
        let b = fixtures::shop(&conn, "piassa");
        create_customer(&conn, &a.tenant.id, new_customer("Abebe", "0911234567")).unwrap();
        let dup = create_customer(&conn, &a.tenant.id, new_customer("Other", "+251911234567"));
        assert!(matches!(dup, Err(AppError::Conflict(_))));
        create_customer(&conn, &b.tenant.id, new_customer("Abebe", "0911234567"))
            .expect("other tenant may reuse the number");
    }

    #[test]
    fn validation_errors() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        assert!(create_customer(&conn, tid, new_customer("A", "0911234567")).is_err());
        assert!(create_customer(&conn, tid, new_customer("Abebe", "123")).is_err());
        let mut bad_email = new_customer("Abebe", "0911234567");
        bad_email.email = Some("not-an-email".into());
        assert!(create_customer(&conn, tid, bad_email).is_err());
        let mut bad_lang = new_customer("Abebe", "0911234567");
        bad_lang.preferred_language = Some("fr".into());
        assert!(create_customer(&conn, tid, bad_lang).is_err());
    }

    #[test]
    fn list_filters_and_paginates() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        for i in 0..5 {
            let mut c = new_customer(&format!("Customer {i}"), &format!("091100000{i}"));
            c.city = Some(if i % 2 == 0 { "Adama" } else { "Hawassa" }.into());
            create_customer(&conn, tid, c).unwrap();
        }
        let page = list_customers(
            &conn,
            tid,
            &CustomerFilter {
                city: Some("adama".into()),
                pagination: Pagination::new(Some(1), Some(2)).unwrap(),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);

        let search = list_customers(
            &conn,
            tid,
            &CustomerFilter {
                search: Some("Customer 4".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(search.total, 1);
    }

    #[test]
    fn update_checks_expected_version() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        let c = fixtures::customer(&conn, tid, "Almaz", "0911000111");

        let updated = update_customer(
            &conn,
            tid,
            &c.id,
            CustomerUpdate {
                city: Some("Bahir Dar".into()),
                email: Some("".into()),
                expected_version: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.city.as_deref(), Some("Bahir Dar"));

        let stale = update_customer(
            &conn,
            tid,
            &c.id,
            CustomerUpdate {
                notes: Some("late".into()),
                expected_version: Some(1),
                ..Default::default()
            },
        );
        assert!(matches!(stale, Err(AppError::Conflict(_))));
    }

    #[test]
    fn delete_blocked_while_devices_exist() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        let c = fixtures::customer(&conn, tid, "Almaz", "0911000111");
        fixtures::device(&conn, tid, &c.id);
        assert!(matches!(
            delete_customer(&conn, tid, &c.id),
            Err(AppError::Conflict(_))
        ));
        let detail = get_customer_detail(&conn, tid, &c.id).unwrap();
        assert_eq!(detail.device_count, 1);
        assert_eq!(detail.open_device_count, 1);

        let lonely = fixtures::customer(&conn, tid, "Lonely", "0911000222");
        delete_customer(&conn, tid, &lonely.id).unwrap();
        assert!(matches!(
            get_customer(&conn, tid, &lonely.id),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn other_tenant_cannot_read() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let a = fixtures::shop(&conn, "bole");
        let b = fixtures::shop(&conn, "piassa");
        let c = fixtures::customer(&conn, &a.tenant.id, "Almaz", "0911000111");
        assert!(get_customer(&conn, &b.tenant.id, &c.id).is_err());
    }
}
