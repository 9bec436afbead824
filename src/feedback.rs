//! Customer ratings of finished repairs.

use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data_helpers::{check_len, clean, new_id, now_rfc3339, range_bound, Page, Pagination};
use crate::devices;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub id: String,
    pub device_id: String,
    pub tracking_code: Option<String>,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
    pub rating: i64,
    pub comment: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFeedback {
    #[serde(alias = "device_id")]
    pub device_id: String,
    pub rating: i64,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FeedbackFilter {
    pub from: Option<String>,
    pub to: Option<String>,
    pub rating: Option<i64>,
    pub pagination: Pagination,
}

const FEEDBACK_SELECT: &str = "SELECT f.id, f.device_id, d.tracking_code, f.customer_id, c.full_name,
        f.rating, f.comment, f.created_at
     FROM feedback f
     LEFT JOIN devices d ON d.id = f.device_id
     LEFT JOIN customers c ON c.id = f.customer_id";

fn feedback_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Feedback> {
    Ok(Feedback {
        id: row.get(0)?,
        device_id: row.get(1)?,
        tracking_code: row.get(2)?,
        customer_id: row.get(3)?,
        customer_name: row.get(4)?,
        rating: row.get(5)?,
        comment: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn validate_rating(rating: i64) -> AppResult<()> {
    if (1..=5).contains(&rating) {
        Ok(())
    } else {
        Err(AppError::validation("rating must be between 1 and 5"))
    }
}

pub fn create_feedback(conn: &Connection, tenant_id: &str, input: NewFeedback) -> AppResult<Feedback> {
    validate_rating(input.rating)?;
    let comment = clean(input.comment);
    if let Some(ref c) = comment {
        check_len("comment", c, 1, 1000)?;
    }
    let device = devices::get_device(conn, tenant_id, input.device_id.trim())
        .map_err(|_| AppError::validation("deviceId is not a device of this shop"))?;
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM feedback WHERE device_id = ?1)",
        params![device.id],
        |row| row.get(0),
    )?;
    if exists {
        return Err(AppError::conflict(format!(
            "Feedback for {} was already recorded",
            device.tracking_code
        )));
    }

    let id = new_id("fb");
    conn.execute(
        "INSERT INTO feedback (id, tenant_id, device_id, customer_id, rating, comment, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![id, tenant_id, device.id, device.customer_id, input.rating, comment, now_rfc3339()],
    )?;
    info!(tenant_id, device_id = %device.id, rating = input.rating, "feedback recorded");
    get_feedback(conn, tenant_id, &id)
}

pub fn get_feedback(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<Feedback> {
    conn.query_row(
        &format!("{FEEDBACK_SELECT} WHERE f.tenant_id = ?1 AND f.id = ?2"),
        params![tenant_id, id],
        feedback_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("Feedback"))
}

pub fn list_feedback(conn: &Connection, tenant_id: &str, filter: &FeedbackFilter) -> AppResult<Page<Feedback>> {
    let mut clauses = vec!["f.tenant_id = ?".to_string()];
    let mut args: Vec<SqlValue> = vec![tenant_id.to_string().into()];
    if let Some(from) = filter.from.as_deref().filter(|s| !s.trim().is_empty()) {
        clauses.push("f.created_at >= ?".into());
        args.push(range_bound("from", from, false)?.into());
    }
    if let Some(to) = filter.to.as_deref().filter(|s| !s.trim().is_empty()) {
        clauses.push("f.created_at < ?".into());
        args.push(range_bound("to", to, true)?.into());
    }
    if let Some(rating) = filter.rating {
        validate_rating(rating)?;
        clauses.push("f.rating = ?".into());
        args.push(rating.into());
    }
    let where_sql = clauses.join(" AND ");
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM feedback f WHERE {where_sql}"),
        params_from_iter(args.iter()),
        |row| row.get(0),
    )?;
    args.push(filter.pagination.page_size.into());
    args.push(filter.pagination.offset().into());
    let mut stmt = conn.prepare(&format!(
        "{FEEDBACK_SELECT} WHERE {where_sql} ORDER BY f.created_at DESC, f.rowid DESC LIMIT ? OFFSET ?"
    ))?;
    let items = stmt
        .query_map(params_from_iter(args.iter()), feedback_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(items, total, filter.pagination))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::tenants::fixtures;

    #[test]
    fn one_feedback_per_device() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        let c = fixtures::customer(&conn, tid, "Almaz", "0911000111");
        let d = fixtures::device(&conn, tid, &c.id);

        let input = |rating| NewFeedback {
            device_id: d.id.clone(),
            rating,
            comment: Some("Fast and friendly".into()),
        };
        assert!(matches!(create_feedback(&conn, tid, input(6)), Err(AppError::Validation(_))));
        let f = create_feedback(&conn, tid, input(5)).unwrap();
        assert_eq!(f.customer_id.as_deref(), Some(c.id.as_str()));
        assert!(matches!(create_feedback(&conn, tid, input(4)), Err(AppError::Conflict(_))));

        let filter = FeedbackFilter {
            rating: Some(5),
            ..Default::default()
        };
        assert_eq!(list_feedback(&conn, tid, &filter).unwrap().total, 1);
    }

    #[test]
    fn device_must_be_in_tenant() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let bole = fixtures::shop(&conn, "bole");
        let piassa = fixtures::shop(&conn, "piassa");
        let c = fixtures::customer(&conn, &bole.tenant.id, "Almaz", "0911000111");
        let d = fixtures::device(&conn, &bole.tenant.id, &c.id);
        let result = create_feedback(
            &conn,
            &piassa.tenant.id,
            NewFeedback {
                device_id: d.id,
                rating: 3,
                comment: None,
            },
        );
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
