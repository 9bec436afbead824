//! Recorded payments.

use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::customers;
use crate::data_helpers::{check_len, clean, new_id, now_rfc3339, range_bound, Page, Pagination};
use crate::devices;
use crate::error::{AppError, AppResult};

pub const PAYMENT_METHODS: &[&str] = &["cash", "card", "mobile_money", "bank_transfer"];
pub const KINDS: &[&str] = &["repair", "part_sale", "accessory", "other"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    pub id: String,
    pub device_id: Option<String>,
    pub tracking_code: Option<String>,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
    pub amount: f64,
    pub payment_method: String,
    pub kind: String,
    pub note: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSale {
    pub amount: f64,
    #[serde(alias = "payment_method", alias = "method")]
    pub payment_method: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default, alias = "device_id")]
    pub device_id: Option<String>,
    #[serde(default, alias = "customer_id")]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

fn default_kind() -> String {
    "repair".into()
}

#[derive(Debug, Clone, Default)]
pub struct SaleFilter {
    pub from: Option<String>,
    pub to: Option<String>,
    pub payment_method: Option<String>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SalePage {
    #[serde(flatten)]
    pub page: Page<Sale>,
    /// Sum over every sale matching the filter, not just this page.
    pub total_amount: f64,
}

const SALE_SELECT: &str = "SELECT s.id, s.device_id, d.tracking_code, s.customer_id, c.full_name,
        s.amount, s.payment_method, s.kind, s.note, s.created_by, s.created_at
     FROM sales s
     LEFT JOIN devices d ON d.id = s.device_id
     LEFT JOIN customers c ON c.id = s.customer_id";

fn sale_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sale> {
    Ok(Sale {
        id: row.get(0)?,
        device_id: row.get(1)?,
        tracking_code: row.get(2)?,
        customer_id: row.get(3)?,
        customer_name: row.get(4)?,
        amount: row.get(5)?,
        payment_method: row.get(6)?,
        kind: row.get(7)?,
        note: row.get(8)?,
        created_by: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn one_of(field: &str, value: &str, allowed: &[&str]) -> AppResult<String> {
    let v = value.trim().to_lowercase();
    if allowed.contains(&v.as_str()) {
        Ok(v)
    } else {
        Err(AppError::validation(format!("{field} must be one of {}", allowed.join(", "))))
    }
}

pub fn create_sale(conn: &Connection, tenant_id: &str, input: NewSale, actor: Option<&str>) -> AppResult<Sale> {
    if !input.amount.is_finite() || input.amount <= 0.0 {
        return Err(AppError::validation("amount must be greater than zero"));
    }
    let payment_method = one_of("paymentMethod", &input.payment_method, PAYMENT_METHODS)?;
    let kind = one_of("kind", &input.kind, KINDS)?;
    let note = clean(input.note);
    if let Some(ref n) = note {
        check_len("note", n, 1, 500)?;
    }

    let device = clean(input.device_id)
        .map(|id| {
            devices::get_device(conn, tenant_id, &id)
                .map_err(|_| AppError::validation("deviceId is not a device of this shop"))
        })
        .transpose()?;
    let mut customer_id = clean(input.customer_id);
    if let Some(ref id) = customer_id {
        customers::get_customer(conn, tenant_id, id)
            .map_err(|_| AppError::validation("customerId is not a customer of this shop"))?;
    }
    if let Some(ref d) = device {
        match &customer_id {
            Some(c) if *c != d.customer_id => {
                return Err(AppError::validation("Device does not belong to this customer"))
            }
            None if kind == "repair" => customer_id = Some(d.customer_id.clone()),
            _ => {}
        }
    }

    let id = new_id("sale");
    conn.execute(
        "INSERT INTO sales (id, tenant_id, device_id, customer_id, amount, payment_method, kind,
                            note, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            tenant_id,
            device.as_ref().map(|d| d.id.as_str()),
            customer_id,
            input.amount,
            payment_method,
            kind,
            note,
            actor,
            now_rfc3339()
        ],
    )?;
    info!(tenant_id, sale_id = %id, amount = input.amount, method = %payment_method, "sale recorded");
    get_sale(conn, tenant_id, &id)
}

pub fn get_sale(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<Sale> {
    conn.query_row(
        &format!("{SALE_SELECT} WHERE s.tenant_id = ?1 AND s.id = ?2"),
        params![tenant_id, id],
        sale_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("Sale"))
}

pub fn list_sales(conn: &Connection, tenant_id: &str, filter: &SaleFilter) -> AppResult<SalePage> {
    let mut clauses = vec!["s.tenant_id = ?".to_string()];
    let mut args: Vec<SqlValue> = vec![tenant_id.to_string().into()];
    if let Some(from) = filter.from.as_deref().filter(|s| !s.trim().is_empty()) {
        clauses.push("s.created_at >= ?".into());
        args.push(range_bound("from", from, false)?.into());
    }
    if let Some(to) = filter.to.as_deref().filter(|s| !s.trim().is_empty()) {
        clauses.push("s.created_at < ?".into());
        args.push(range_bound("to", to, true)?.into());
    }
    if let Some(method) = filter.payment_method.as_deref().filter(|s| !s.trim().is_empty()) {
        clauses.push("s.payment_method = ?".into());
        args.push(one_of("paymentMethod", method, PAYMENT_METHODS)?.into());
    }
    let where_sql = clauses.join(" AND ");
    let (total, total_amount): (i64, f64) = conn.query_row(
        &format!("SELECT COUNT(*), COALESCE(SUM(s.amount), 0) FROM sales s WHERE {where_sql}"),
        params_from_iter(args.iter()),
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    args.push(filter.pagination.page_size.into());
    args.push(filter.pagination.offset().into());
    let mut stmt = conn.prepare(&format!(
        "{SALE_SELECT} WHERE {where_sql} ORDER BY s.created_at DESC, s.rowid DESC LIMIT ? OFFSET ?"
    ))?;
    let items = stmt
        .query_map(params_from_iter(args.iter()), sale_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SalePage {
        page: Page::new(items, total, filter.pagination),
        total_amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::tenants::fixtures;

    fn sale(amount: f64, method: &str, device_id: Option<&str>) -> NewSale {
        NewSale {
            amount,
            payment_method: method.into(),
            kind: "repair".into(),
            device_id: device_id.map(str::to_string),
            customer_id: None,
            note: None,
        }
    }

    #[test]
    fn repair_sale_takes_customer_from_device() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        let c = fixtures::customer(&conn, tid, "Almaz", "0911000111");
        let d = fixtures::device(&conn, tid, &c.id);

        let s = create_sale(&conn, tid, sale(2500.0, "Mobile_Money", Some(&d.id)), None).unwrap();
        assert_eq!(s.customer_id.as_deref(), Some(c.id.as_str()));
        assert_eq!(s.payment_method, "mobile_money");
        assert_eq!(s.tracking_code.as_deref(), Some(d.tracking_code.as_str()));

        let other = fixtures::customer(&conn, tid, "Bekele", "0911000222");
        let mut mismatch = sale(10.0, "cash", Some(&d.id));
        mismatch.customer_id = Some(other.id);
        assert!(create_sale(&conn, tid, mismatch, None).is_err());
    }

    #[test]
    fn amount_and_method_are_validated() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        assert!(create_sale(&conn, tid, sale(0.0, "cash", None), None).is_err());
        assert!(create_sale(&conn, tid, sale(f64::NAN, "cash", None), None).is_err());
        assert!(create_sale(&conn, tid, sale(5.0, "cheque", None), None).is_err());
        let mut bad_kind = sale(5.0, "cash", None);
        bad_kind.kind = "gift".into();
        assert!(create_sale(&conn, tid, bad_kind, None).is_err());
    }

    #[test]
    fn list_totals_cover_the_whole_filter() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        for (amount, method) in [(100.0, "cash"), (250.0, "card"), (50.0, "cash")] {
            create_sale(&conn, tid, sale(amount, method, None), None).unwrap();
        }
        conn.execute(
            "UPDATE sales SET created_at = '2020-01-01T10:00:00Z' WHERE amount = 50",
            [],
        )
        .unwrap();

        let filter = SaleFilter {
            payment_method: Some("cash".into()),
            pagination: Pagination::new(Some(1), Some(1)).unwrap(),
            ..Default::default()
        };
        let page = list_sales(&conn, tid, &filter).unwrap();
        assert_eq!(page.page.total, 2);
        assert_eq!(page.page.items.len(), 1);
        assert_eq!(page.total_amount, 150.0);

        let filter = SaleFilter {
            from: Some("2020-01-01".into()),
            to: Some("2020-01-01".into()),
            ..Default::default()
        };
        let page = list_sales(&conn, tid, &filter).unwrap();
        assert_eq!(page.page.total, 1);
        assert_eq!(page.total_amount, 50.0);
    }
}
