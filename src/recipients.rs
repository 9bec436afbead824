//! Customer categories (saved filters) and recipient groups (curated
//! member lists). Both feed SMS campaigns.

use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::customers::{customer_from_row, Customer, CUSTOMER_COLUMNS, LANGUAGES};
use crate::data_helpers::{check_len, clean, new_id, now_rfc3339, parse_date, Page, Pagination};
use crate::devices::{DEVICE_TYPES, STATUSES};
use crate::error::{AppError, AppResult};

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

/// Filter evaluated against customers and their devices.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CategoryFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_status: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_devices: Option<i64>,
}

impl CategoryFilter {
    pub fn parse(raw: &Value) -> AppResult<Self> {
        let raw = if raw.is_null() { Value::Object(Default::default()) } else { raw.clone() };
        let mut filter: CategoryFilter = serde_json::from_value(raw)
            .map_err(|e| AppError::validation(format!("Invalid category filter: {e}")))?;
        filter.validate()?;
        filter.language = clean(filter.language).map(|l| l.to_lowercase());
        filter.city = clean(filter.city);
        filter.device_type = clean(filter.device_type).map(|t| t.to_lowercase());
        Ok(filter)
    }

    fn validate(&self) -> AppResult<()> {
        if let Some(lang) = clean(self.language.clone()) {
            if !LANGUAGES.contains(&lang.to_lowercase().as_str()) {
                return Err(AppError::validation("filter.language must be am, en or mixed"));
            }
        }
        if let Some(statuses) = &self.device_status {
            if let Some(bad) = statuses.iter().find(|s| !STATUSES.contains(&s.as_str())) {
                return Err(AppError::validation(format!(
                    "filter.deviceStatus contains unknown status '{bad}'"
                )));
            }
        }
        if let Some(t) = clean(self.device_type.clone()) {
            if !DEVICE_TYPES.contains(&t.to_lowercase().as_str()) {
                return Err(AppError::validation(format!(
                    "filter.deviceType '{t}' is not a device type"
                )));
            }
        }
        let after = self
            .registered_after
            .as_deref()
            .map(|d| parse_date("filter.registeredAfter", d))
            .transpose()?;
        let before = self
            .registered_before
            .as_deref()
            .map(|d| parse_date("filter.registeredBefore", d))
            .transpose()?;
        if let (Some(a), Some(b)) = (after, before) {
            if a > b {
                return Err(AppError::validation(
                    "filter.registeredAfter must not be later than registeredBefore",
                ));
            }
        }
        if matches!(self.min_devices, Some(n) if n < 1) {
            return Err(AppError::validation("filter.minDevices must be at least 1"));
        }
        Ok(())
    }

    /// WHERE fragment over `customers c` plus its bound arguments.
    fn to_sql(&self, tenant_id: &str) -> (String, Vec<SqlValue>) {
        let mut clauses = vec!["c.tenant_id = ?".to_string()];
        let mut args: Vec<SqlValue> = vec![tenant_id.to_string().into()];

        if let Some(lang) = &self.language {
            clauses.push("c.preferred_language = ?".into());
            args.push(lang.clone().into());
        }
        if let Some(city) = &self.city {
            clauses.push("c.city = ? COLLATE NOCASE".into());
            args.push(city.clone().into());
        }
        if let Some(after) = &self.registered_after {
            clauses.push("substr(c.created_at, 1, 10) >= ?".into());
            args.push(after.trim().to_string().into());
        }
        if let Some(before) = &self.registered_before {
            clauses.push("substr(c.created_at, 1, 10) <= ?".into());
            args.push(before.trim().to_string().into());
        }

        let statuses = self.device_status.as_deref().unwrap_or_default();
        if !statuses.is_empty() || self.device_type.is_some() {
            let mut device_clauses = vec!["d.customer_id = c.id".to_string()];
            if !statuses.is_empty() {
                let marks = vec!["?"; statuses.len()].join(", ");
                device_clauses.push(format!("d.status IN ({marks})"));
                args.extend(statuses.iter().map(|s| SqlValue::from(s.clone())));
            }
            if let Some(t) = &self.device_type {
                device_clauses.push("d.device_type = ?".into());
                args.push(t.clone().into());
            }
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM devices d WHERE {})",
                device_clauses.join(" AND ")
            ));
        }
        if let Some(min) = self.min_devices {
            clauses.push("(SELECT COUNT(*) FROM devices d2 WHERE d2.customer_id = c.id) >= ?".into());
            args.push(min.into());
        }

        (clauses.join(" AND "), args)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerCategory {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: Option<String>,
    pub filter: CategoryFilter,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub filter: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub filter: Option<Value>,
}

fn category_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CustomerCategory> {
    let raw: String = row.get(4)?;
    Ok(CustomerCategory {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        filter: serde_json::from_str(&raw).unwrap_or_default(),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

const CATEGORY_COLUMNS: &str = "id, tenant_id, name, description, filter, created_at, updated_at";

fn ensure_unique_name(
    conn: &Connection,
    table: &str,
    tenant_id: &str,
    name: &str,
    except_id: Option<&str>,
) -> AppResult<()> {
    let existing: Option<String> = conn
        .query_row(
            &format!("SELECT id FROM {table} WHERE tenant_id = ?1 AND name = ?2"),
            params![tenant_id, name],
            |row| row.get(0),
        )
        .optional()?;
    match existing {
        Some(id) if Some(id.as_str()) != except_id => {
            Err(AppError::conflict(format!("Name '{name}' is already used")))
        }
        _ => Ok(()),
    }
}

pub fn create_category(
    conn: &Connection,
    tenant_id: &str,
    input: CategoryInput,
) -> AppResult<CustomerCategory> {
    let name = input.name.trim().to_string();
    check_len("name", &name, 1, 100)?;
    let filter = CategoryFilter::parse(&input.filter)?;
    ensure_unique_name(conn, "customer_categories", tenant_id, &name, None)?;

    let id = new_id("cat");
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO customer_categories (id, tenant_id, name, description, filter, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            id,
            tenant_id,
            name,
            clean(input.description),
            serde_json::to_string(&filter)?,
            now
        ],
    )?;
    get_category(conn, tenant_id, &id)
}

pub fn get_category(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<CustomerCategory> {
    conn.query_row(
        &format!("SELECT {CATEGORY_COLUMNS} FROM customer_categories WHERE tenant_id = ?1 AND id = ?2"),
        params![tenant_id, id],
        category_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("Customer category"))
}

pub fn list_categories(conn: &Connection, tenant_id: &str) -> AppResult<Vec<CustomerCategory>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CATEGORY_COLUMNS} FROM customer_categories WHERE tenant_id = ?1 ORDER BY name"
    ))?;
    let rows = stmt.query_map(params![tenant_id], category_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn update_category(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
    update: CategoryUpdate,
) -> AppResult<CustomerCategory> {
    let current = get_category(conn, tenant_id, id)?;
    let name = match update.name {
        Some(n) => {
            let n = n.trim().to_string();
            check_len("name", &n, 1, 100)?;
            ensure_unique_name(conn, "customer_categories", tenant_id, &n, Some(id))?;
            n
        }
        None => current.name,
    };
    let description = match update.description {
        Some(d) => clean(Some(d)),
        None => current.description,
    };
    let filter = match update.filter {
        Some(raw) => CategoryFilter::parse(&raw)?,
        None => current.filter,
    };
    conn.execute(
        "UPDATE customer_categories SET name = ?1, description = ?2, filter = ?3, updated_at = ?4
         WHERE tenant_id = ?5 AND id = ?6",
        params![
            name,
            description,
            serde_json::to_string(&filter)?,
            now_rfc3339(),
            tenant_id,
            id
        ],
    )?;
    get_category(conn, tenant_id, id)
}

pub fn delete_category(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<()> {
    let n = conn.execute(
        "DELETE FROM customer_categories WHERE tenant_id = ?1 AND id = ?2",
        params![tenant_id, id],
    )?;
    if n == 0 {
        return Err(AppError::not_found("Customer category"));
    }
    Ok(())
}

fn prefixed_columns() -> String {
    CUSTOMER_COLUMNS
        .split(", ")
        .map(|c| format!("c.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Customers matching a filter, one page at a time.
pub fn resolve_filter(
    conn: &Connection,
    tenant_id: &str,
    filter: &CategoryFilter,
    pagination: Option<Pagination>,
) -> AppResult<Page<Customer>> {
    let (where_sql, args) = filter.to_sql(tenant_id);
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM customers c WHERE {where_sql}"),
        params_from_iter(args.iter()),
        |row| row.get(0),
    )?;

    let mut sql = format!(
        "SELECT {} FROM customers c WHERE {where_sql} ORDER BY c.full_name COLLATE NOCASE, c.id",
        prefixed_columns()
    );
    let mut page_args = args;
    let pagination = match pagination {
        Some(p) => {
            sql.push_str(" LIMIT ? OFFSET ?");
            page_args.push(p.page_size.into());
            page_args.push(p.offset().into());
            p
        }
        None => Pagination {
            page: 1,
            page_size: total.max(1),
        },
    };
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params_from_iter(page_args.iter()), customer_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(items, total, pagination))
}

pub fn resolve_category(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
    pagination: Option<Pagination>,
) -> AppResult<Page<Customer>> {
    let category = get_category(conn, tenant_id, id)?;
    resolve_filter(conn, tenant_id, &category.filter, pagination)
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientGroup {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: Option<String>,
    pub member_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "customer_ids", alias = "members")]
    pub customer_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipChange {
    pub added: usize,
    pub already_members: usize,
}

const GROUP_SELECT: &str = "SELECT g.id, g.tenant_id, g.name, g.description,
        (SELECT COUNT(*) FROM recipient_group_members m WHERE m.group_id = g.id),
        g.created_at, g.updated_at
     FROM recipient_groups g";

fn group_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecipientGroup> {
    Ok(RecipientGroup {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        member_count: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

pub fn create_group(conn: &Connection, tenant_id: &str, input: GroupInput) -> AppResult<RecipientGroup> {
    let name = input.name.trim().to_string();
    check_len("name", &name, 1, 100)?;
    ensure_unique_name(conn, "recipient_groups", tenant_id, &name, None)?;

    let tx = conn.unchecked_transaction()?;
    let id = new_id("grp");
    let now = now_rfc3339();
    tx.execute(
        "INSERT INTO recipient_groups (id, tenant_id, name, description, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![id, tenant_id, name, clean(input.description), now],
    )?;
    if !input.customer_ids.is_empty() {
        insert_members(&tx, tenant_id, &id, &input.customer_ids)?;
    }
    tx.commit()?;
    info!(tenant_id, group_id = %id, "recipient group created");
    get_group(conn, tenant_id, &id)
}

pub fn get_group(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<RecipientGroup> {
    conn.query_row(
        &format!("{GROUP_SELECT} WHERE g.tenant_id = ?1 AND g.id = ?2"),
        params![tenant_id, id],
        group_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("Recipient group"))
}

pub fn list_groups(conn: &Connection, tenant_id: &str) -> AppResult<Vec<RecipientGroup>> {
    let mut stmt = conn.prepare(&format!("{GROUP_SELECT} WHERE g.tenant_id = ?1 ORDER BY g.name"))?;
    let rows = stmt.query_map(params![tenant_id], group_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn update_group(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
    update: GroupUpdate,
) -> AppResult<RecipientGroup> {
    let current = get_group(conn, tenant_id, id)?;
    let name = match update.name {
        Some(n) => {
            let n = n.trim().to_string();
            check_len("name", &n, 1, 100)?;
            ensure_unique_name(conn, "recipient_groups", tenant_id, &n, Some(id))?;
            n
        }
        None => current.name,
    };
    let description = match update.description {
        Some(d) => clean(Some(d)),
        None => current.description,
    };
    conn.execute(
        "UPDATE recipient_groups SET name = ?1, description = ?2, updated_at = ?3
         WHERE tenant_id = ?4 AND id = ?5",
        params![name, description, now_rfc3339(), tenant_id, id],
    )?;
    get_group(conn, tenant_id, id)
}

pub fn delete_group(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<()> {
    let n = conn.execute(
        "DELETE FROM recipient_groups WHERE tenant_id = ?1 AND id = ?2",
        params![tenant_id, id],
    )?;
    if n == 0 {
        return Err(AppError::not_found("Recipient group"));
    }
    Ok(())
}

fn insert_members(
    conn: &Connection,
    tenant_id: &str,
    group_id: &str,
    customer_ids: &[String],
) -> AppResult<MembershipChange> {
    let mut ids: Vec<&str> = customer_ids.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return Err(AppError::validation("customerIds must not be empty"));
    }

    let mut check = conn.prepare("SELECT 1 FROM customers WHERE tenant_id = ?1 AND id = ?2")?;
    let unknown: Vec<&str> = ids
        .iter()
        .copied()
        .filter(|id| !check.exists(params![tenant_id, id]).unwrap_or(false))
        .collect();
    if !unknown.is_empty() {
        return Err(AppError::validation(format!(
            "Unknown customer id(s): {}",
            unknown.join(", ")
        )));
    }

    let now = now_rfc3339();
    let mut insert = conn.prepare(
        "INSERT OR IGNORE INTO recipient_group_members (group_id, customer_id, added_at)
         VALUES (?1, ?2, ?3)",
    )?;
    let mut added = 0;
    for id in &ids {
        added += insert.execute(params![group_id, id, now])?;
    }
    Ok(MembershipChange {
        added,
        already_members: ids.len() - added,
    })
}

pub fn add_members(
    conn: &Connection,
    tenant_id: &str,
    group_id: &str,
    customer_ids: &[String],
) -> AppResult<MembershipChange> {
    get_group(conn, tenant_id, group_id)?;
    let tx = conn.unchecked_transaction()?;
    let change = insert_members(&tx, tenant_id, group_id, customer_ids)?;
    tx.execute(
        "UPDATE recipient_groups SET updated_at = ?1 WHERE id = ?2",
        params![now_rfc3339(), group_id],
    )?;
    tx.commit()?;
    Ok(change)
}

pub fn remove_member(conn: &Connection, tenant_id: &str, group_id: &str, customer_id: &str) -> AppResult<()> {
    get_group(conn, tenant_id, group_id)?;
    let n = conn.execute(
        "DELETE FROM recipient_group_members WHERE group_id = ?1 AND customer_id = ?2",
        params![group_id, customer_id],
    )?;
    if n == 0 {
        return Err(AppError::not_found("Group member"));
    }
    Ok(())
}

pub fn list_members(
    conn: &Connection,
    tenant_id: &str,
    group_id: &str,
    pagination: Option<Pagination>,
) -> AppResult<Page<Customer>> {
    get_group(conn, tenant_id, group_id)?;
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM recipient_group_members WHERE group_id = ?1",
        params![group_id],
        |row| row.get(0),
    )?;
    let (limit, offset, pagination) = match pagination {
        Some(p) => (p.page_size, p.offset(), p),
        None => (-1, 0, Pagination { page: 1, page_size: total.max(1) }),
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM customers c
         JOIN recipient_group_members m ON m.customer_id = c.id
         WHERE m.group_id = ?1 AND c.tenant_id = ?2
         ORDER BY c.full_name COLLATE NOCASE, c.id
         LIMIT ?3 OFFSET ?4",
        prefixed_columns()
    ))?;
    let items = stmt
        .query_map(params![group_id, tenant_id, limit, offset], customer_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(items, total, pagination))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::devices;
    use crate::tenants::fixtures;
    use serde_json::json;

    #[test]
    fn filter_rejects_unknown_keys_and_values() {
        assert!(CategoryFilter::parse(&json!({ "colour": "red" })).is_err());
        assert!(CategoryFilter::parse(&json!({ "language": "fr" })).is_err());
        assert!(CategoryFilter::parse(&json!({ "deviceStatus": ["lost"] })).is_err());
        assert!(CategoryFilter::parse(&json!({ "registeredAfter": "yesterday" })).is_err());
        assert!(CategoryFilter::parse(&json!({ "minDevices": 0 })).is_err());
        assert!(CategoryFilter::parse(&json!({
            "registeredAfter": "2026-02-01",
            "registeredBefore": "2026-01-01"
        }))
        .is_err());
        let ok = CategoryFilter::parse(&json!({ "language": "EN", "deviceType": "Laptop" })).unwrap();
        assert_eq!(ok.language.as_deref(), Some("en"));
        assert_eq!(ok.device_type.as_deref(), Some("laptop"));
        assert_eq!(CategoryFilter::parse(&Value::Null).unwrap(), CategoryFilter::default());
    }

    #[test]
    fn category_resolves_by_language_and_device_status() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;

        let with_device = fixtures::customer(&conn, tid, "Almaz", "0911000111");
        let dev = fixtures::device(&conn, tid, &with_device.id);
        devices::change_status(&conn, tid, &dev.id, "diagnosed", None, None).unwrap();
        fixtures::customer(&conn, tid, "Bekele", "0911000222");

        let category = create_category(
            &conn,
            tid,
            CategoryInput {
                name: "Diagnosed phones".into(),
                description: None,
                filter: json!({ "language": "en", "deviceStatus": ["diagnosed"], "deviceType": "phone" }),
            },
        )
        .unwrap();
        let matched = resolve_category(&conn, tid, &category.id, None).unwrap();
        assert_eq!(matched.total, 1);
        assert_eq!(matched.items[0].id, with_device.id);

        let everyone = create_category(
            &conn,
            tid,
            CategoryInput {
                name: "Everyone".into(),
                description: None,
                filter: json!({}),
            },
        )
        .unwrap();
        assert_eq!(resolve_category(&conn, tid, &everyone.id, None).unwrap().total, 2);

        let dup = create_category(
            &conn,
            tid,
            CategoryInput {
                name: "Everyone".into(),
                description: None,
                filter: json!({}),
            },
        );
        assert!(matches!(dup, Err(AppError::Conflict(_))));
    }

    #[test]
    fn group_membership() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let a = fixtures::shop(&conn, "bole");
        let b = fixtures::shop(&conn, "piassa");
        let tid = &a.tenant.id;
        let c1 = fixtures::customer(&conn, tid, "Almaz", "0911000111");
        let c2 = fixtures::customer(&conn, tid, "Bekele", "0911000222");
        let foreign = fixtures::customer(&conn, &b.tenant.id, "Chaltu", "0911000333");

        let group = create_group(
            &conn,
            tid,
            GroupInput {
                name: "VIP".into(),
                description: Some("Loyal customers".into()),
                customer_ids: vec![c1.id.clone()],
            },
        )
        .unwrap();
        assert_eq!(group.member_count, 1);

        let change = add_members(&conn, tid, &group.id, &[c1.id.clone(), c2.id.clone()]).unwrap();
        assert_eq!(change.added, 1);
        assert_eq!(change.already_members, 1);

        let err = add_members(&conn, tid, &group.id, &[foreign.id.clone()]);
        assert!(matches!(err, Err(AppError::Validation(_))));

        let members = list_members(&conn, tid, &group.id, None).unwrap();
        assert_eq!(members.total, 2);

        remove_member(&conn, tid, &group.id, &c1.id).unwrap();
        assert!(remove_member(&conn, tid, &group.id, &c1.id).is_err());
        assert_eq!(get_group(&conn, tid, &group.id).unwrap().member_count, 1);

        assert!(get_group(&conn, &b.tenant.id, &group.id).is_err());
        delete_group(&conn, tid, &group.id).unwrap();
    }
}
