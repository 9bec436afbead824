//! Spare-part inventory and stock movements.

use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::data_helpers::{
    check_len, check_non_negative, clean, like_pattern, new_id, now_rfc3339, Page, Pagination,
};
use crate::devices::Device;
use crate::error::{AppError, AppResult};
use crate::notifications::{self, StaffEvent};

pub const MOVEMENT_REASONS: &[&str] = &["purchase", "sale", "repair_use", "adjustment", "return"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub id: String,
    pub tenant_id: String,
    pub sku: String,
    pub name: String,
    pub category: Option<String>,
    pub compatible_models: Option<String>,
    pub quantity: i64,
    pub reorder_level: i64,
    pub unit_cost: f64,
    pub unit_price: f64,
    pub location: Option<String>,
    pub is_active: bool,
    pub low_stock: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockMovement {
    pub id: String,
    pub item_id: String,
    pub change: i64,
    pub quantity_after: i64,
    pub reason: String,
    pub reference: Option<String>,
    pub note: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    pub sku: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, alias = "compatible_models")]
    pub compatible_models: Option<String>,
    #[serde(default, alias = "qty")]
    pub quantity: i64,
    #[serde(default, alias = "reorder_level")]
    pub reorder_level: i64,
    #[serde(default, alias = "unit_cost", alias = "cost")]
    pub unit_cost: f64,
    #[serde(default, alias = "unit_price", alias = "price")]
    pub unit_price: f64,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemUpdate {
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, alias = "compatible_models")]
    pub compatible_models: Option<String>,
    #[serde(default, alias = "reorder_level")]
    pub reorder_level: Option<i64>,
    #[serde(default, alias = "unit_cost", alias = "cost")]
    pub unit_cost: Option<f64>,
    #[serde(default, alias = "unit_price", alias = "price")]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, alias = "is_active")]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockAdjustment {
    #[serde(alias = "delta", alias = "quantity")]
    pub change: i64,
    pub reason: String,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockResult {
    pub item: InventoryItem,
    pub movement: StockMovement,
}

#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub search: Option<String>,
    pub category: Option<String>,
    pub low_stock: bool,
    pub include_inactive: bool,
    pub pagination: Pagination,
}

const ITEM_COLUMNS: &str = "id, tenant_id, sku, name, category, compatible_models, quantity, \
     reorder_level, unit_cost, unit_price, location, is_active, created_at, updated_at";

fn item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InventoryItem> {
    let quantity: i64 = row.get(6)?;
    let reorder_level: i64 = row.get(7)?;
    Ok(InventoryItem {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        sku: row.get(2)?,
        name: row.get(3)?,
        category: row.get(4)?,
        compatible_models: row.get(5)?,
        quantity,
        reorder_level,
        unit_cost: row.get(8)?,
        unit_price: row.get(9)?,
        location: row.get(10)?,
        is_active: row.get::<_, i64>(11)? != 0,
        low_stock: quantity <= reorder_level,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn movement_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StockMovement> {
    Ok(StockMovement {
        id: row.get(0)?,
        item_id: row.get(1)?,
        change: row.get(2)?,
        quantity_after: row.get(3)?,
        reason: row.get(4)?,
        reference: row.get(5)?,
        note: row.get(6)?,
        created_by: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn normalize_sku(raw: &str) -> AppResult<String> {
    let sku = raw.trim().to_uppercase();
    check_len("sku", &sku, 1, 50)?;
    if sku.chars().any(char::is_whitespace) {
        return Err(AppError::validation("sku must not contain spaces"));
    }
    Ok(sku)
}

fn ensure_sku_free(conn: &Connection, tenant_id: &str, sku: &str, except_id: Option<&str>) -> AppResult<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM inventory_items WHERE tenant_id = ?1 AND sku = ?2",
            params![tenant_id, sku],
            |row| row.get(0),
        )
        .optional()?;
    match existing {
        Some(id) if Some(id.as_str()) != except_id => {
            Err(AppError::conflict(format!("SKU {sku} already exists")))
        }
        _ => Ok(()),
    }
}

fn optional_text(field: &str, value: Option<String>, max: usize) -> AppResult<Option<String>> {
    let value = clean(value);
    if let Some(ref v) = value {
        check_len(field, v, 1, max)?;
    }
    Ok(value)
}

pub fn create_item(
    conn: &Connection,
    tenant_id: &str,
    input: NewItem,
    actor: Option<&str>,
) -> AppResult<InventoryItem> {
    let sku = normalize_sku(&input.sku)?;
    let name = input.name.trim().to_string();
    check_len("name", &name, 1, 200)?;
    if input.quantity < 0 {
        return Err(AppError::validation("quantity must be zero or greater"));
    }
    if input.reorder_level < 0 {
        return Err(AppError::validation("reorderLevel must be zero or greater"));
    }
    check_non_negative("unitCost", Some(input.unit_cost))?;
    check_non_negative("unitPrice", Some(input.unit_price))?;
    ensure_sku_free(conn, tenant_id, &sku, None)?;

    let tx = conn.unchecked_transaction()?;
    let id = new_id("item");
    let now = now_rfc3339();
    tx.execute(
        "INSERT INTO inventory_items (id, tenant_id, sku, name, category, compatible_models, quantity,
                                      reorder_level, unit_cost, unit_price, location, is_active,
                                      created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, ?12, ?12)",
        params![
            id,
            tenant_id,
            sku,
            name,
            optional_text("category", input.category, 100)?,
            optional_text("compatibleModels", input.compatible_models, 500)?,
            input.quantity,
            input.reorder_level,
            input.unit_cost,
            input.unit_price,
            optional_text("location", input.location, 100)?,
            now
        ],
    )?;
    if input.quantity > 0 {
        insert_movement(
            &tx,
            tenant_id,
            &id,
            input.quantity,
            input.quantity,
            "purchase",
            None,
            Some("Opening stock"),
            actor,
        )?;
    }
    tx.commit()?;
    info!(tenant_id, item_id = %id, sku = %sku, "inventory item created");
    get_item(conn, tenant_id, &id)
}

pub fn get_item(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<InventoryItem> {
    conn.query_row(
        &format!("SELECT {ITEM_COLUMNS} FROM inventory_items WHERE tenant_id = ?1 AND id = ?2"),
        params![tenant_id, id],
        item_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("Inventory item"))
}

pub fn list_items(conn: &Connection, tenant_id: &str, filter: &ItemFilter) -> AppResult<Page<InventoryItem>> {
    let mut clauses = vec!["tenant_id = ?".to_string()];
    let mut args: Vec<SqlValue> = vec![tenant_id.to_string().into()];
    if !filter.include_inactive {
        clauses.push("is_active = 1".into());
    }
    if let Some(term) = filter.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        clauses.push(
            "(sku LIKE ? ESCAPE '\\' OR name LIKE ? ESCAPE '\\' OR compatible_models LIKE ? ESCAPE '\\')"
                .into(),
        );
        let pattern = like_pattern(term);
        for _ in 0..3 {
            args.push(pattern.clone().into());
        }
    }
    if let Some(category) = filter.category.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        clauses.push("category = ? COLLATE NOCASE".into());
        args.push(category.to_string().into());
    }
    if filter.low_stock {
        clauses.push("quantity <= reorder_level".into());
    }

    let where_sql = clauses.join(" AND ");
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM inventory_items WHERE {where_sql}"),
        params_from_iter(args.iter()),
        |row| row.get(0),
    )?;
    args.push(filter.pagination.page_size.into());
    args.push(filter.pagination.offset().into());
    let mut stmt = conn.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM inventory_items WHERE {where_sql}
         ORDER BY name COLLATE NOCASE, sku LIMIT ? OFFSET ?"
    ))?;
    let items = stmt
        .query_map(params_from_iter(args.iter()), item_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(items, total, filter.pagination))
}

/// Active items at or below their reorder level, emptiest first.
pub fn low_stock_items(conn: &Connection, tenant_id: &str) -> AppResult<Vec<InventoryItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM inventory_items
         WHERE tenant_id = ?1 AND is_active = 1 AND quantity <= reorder_level
         ORDER BY quantity - reorder_level, name COLLATE NOCASE"
    ))?;
    let rows = stmt.query_map(params![tenant_id], item_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn update_item(conn: &Connection, tenant_id: &str, id: &str, update: ItemUpdate) -> AppResult<InventoryItem> {
    let current = get_item(conn, tenant_id, id)?;
    let sku = match update.sku {
        Some(raw) => {
            let sku = normalize_sku(&raw)?;
            ensure_sku_free(conn, tenant_id, &sku, Some(id))?;
            sku
        }
        None => current.sku,
    };
    let name = match update.name {
        Some(raw) => {
            let n = raw.trim().to_string();
            check_len("name", &n, 1, 200)?;
            n
        }
        None => current.name,
    };
    if matches!(update.reorder_level, Some(r) if r < 0) {
        return Err(AppError::validation("reorderLevel must be zero or greater"));
    }
    check_non_negative("unitCost", update.unit_cost)?;
    check_non_negative("unitPrice", update.unit_price)?;
    let category = match update.category {
        Some(raw) => optional_text("category", Some(raw), 100)?,
        None => current.category,
    };
    let compatible = match update.compatible_models {
        Some(raw) => optional_text("compatibleModels", Some(raw), 500)?,
        None => current.compatible_models,
    };
    let location = match update.location {
        Some(raw) => optional_text("location", Some(raw), 100)?,
        None => current.location,
    };

    conn.execute(
        "UPDATE inventory_items SET sku = ?1, name = ?2, category = ?3, compatible_models = ?4,
                reorder_level = ?5, unit_cost = ?6, unit_price = ?7, location = ?8, is_active = ?9,
                updated_at = ?10
         WHERE tenant_id = ?11 AND id = ?12",
        params![
            sku,
            name,
            category,
            compatible,
            update.reorder_level.unwrap_or(current.reorder_level),
            update.unit_cost.unwrap_or(current.unit_cost),
            update.unit_price.unwrap_or(current.unit_price),
            location,
            update.is_active.unwrap_or(current.is_active) as i64,
            now_rfc3339(),
            tenant_id,
            id
        ],
    )?;
    get_item(conn, tenant_id, id)
}

pub fn delete_item(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<()> {
    get_item(conn, tenant_id, id)?;
    let movements: i64 = conn.query_row(
        "SELECT COUNT(*) FROM stock_movements WHERE item_id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    if movements > 0 {
        return Err(AppError::conflict(
            "Item has stock history; deactivate it instead",
        ));
    }
    conn.execute(
        "DELETE FROM inventory_items WHERE tenant_id = ?1 AND id = ?2",
        params![tenant_id, id],
    )?;
    info!(tenant_id, item_id = id, "inventory item deleted");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn insert_movement(
    conn: &Connection,
    tenant_id: &str,
    item_id: &str,
    change: i64,
    quantity_after: i64,
    reason: &str,
    reference: Option<&str>,
    note: Option<&str>,
    actor: Option<&str>,
) -> AppResult<StockMovement> {
    let id = new_id("mov");
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO stock_movements (id, tenant_id, item_id, change, quantity_after, reason,
                                      reference, note, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![id, tenant_id, item_id, change, quantity_after, reason, reference, note, actor, now],
    )?;
    Ok(StockMovement {
        id,
        item_id: item_id.to_string(),
        change,
        quantity_after,
        reason: reason.to_string(),
        reference: reference.map(str::to_string),
        note: note.map(str::to_string),
        created_by: actor.map(str::to_string),
        created_at: now,
    })
}

/// Apply a signed change inside the caller's transaction.
fn apply_change(
    conn: &Connection,
    item: &InventoryItem,
    change: i64,
    reason: &str,
    reference: Option<&str>,
    note: Option<&str>,
    actor: Option<&str>,
) -> AppResult<StockMovement> {
    let after = item.quantity + change;
    if after < 0 {
        return Err(AppError::validation(format!(
            "Insufficient stock for {}: have {}, need {}",
            item.sku,
            item.quantity,
            -change
        )));
    }
    conn.execute(
        "UPDATE inventory_items SET quantity = ?1, updated_at = ?2 WHERE id = ?3",
        params![after, now_rfc3339(), item.id],
    )?;
    insert_movement(conn, &item.tenant_id, &item.id, change, after, reason, reference, note, actor)
}

/// Raise `low_stock` when a movement takes the item from above its reorder
/// level to at or below it.
fn notify_if_crossed(conn: &Connection, tenant_id: &str, before: &InventoryItem, after_qty: i64) {
    if before.quantity <= before.reorder_level || after_qty > before.reorder_level {
        return;
    }
    let event = StaffEvent::new(
        notifications::LOW_STOCK,
        format!("Low stock: {}", before.name),
        format!(
            "{} ({}) is down to {} (reorder level {})",
            before.name, before.sku, after_qty, before.reorder_level
        ),
    )
    .reference(&before.id);
    if let Err(e) = notifications::dispatch(conn, tenant_id, &event) {
        warn!(item_id = %before.id, error = %e, "low stock notification failed");
    }
}

pub fn adjust_stock(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
    adjustment: StockAdjustment,
    actor: Option<&str>,
) -> AppResult<StockResult> {
    let item = get_item(conn, tenant_id, id)?;
    let reason = adjustment.reason.trim().to_lowercase();
    if !MOVEMENT_REASONS.contains(&reason.as_str()) {
        return Err(AppError::validation(format!(
            "reason must be one of {}",
            MOVEMENT_REASONS.join(", ")
        )));
    }
    if reason == "repair_use" {
        return Err(AppError::validation(
            "Parts used on a device are recorded through the device",
        ));
    }
    let change = adjustment.change;
    let sign_ok = match reason.as_str() {
        "purchase" | "return" => change > 0,
        "sale" => change < 0,
        _ => change != 0,
    };
    if !sign_ok {
        return Err(AppError::validation(format!(
            "change {change} does not fit reason '{reason}'"
        )));
    }
    let reference = clean(adjustment.reference);
    let note = clean(adjustment.note);
    if let Some(ref n) = note {
        check_len("note", n, 1, 500)?;
    }

    let tx = conn.unchecked_transaction()?;
    let movement = apply_change(&tx, &item, change, &reason, reference.as_deref(), note.as_deref(), actor)?;
    tx.commit()?;

    info!(tenant_id, item_id = id, change, reason = %reason, "stock adjusted");
    notify_if_crossed(conn, tenant_id, &item, movement.quantity_after);
    Ok(StockResult {
        item: get_item(conn, tenant_id, id)?,
        movement,
    })
}

/// Take parts out of stock for a repair. Returns the `device_parts` id.
pub fn use_part_for_device(
    conn: &Connection,
    tenant_id: &str,
    device: &Device,
    item_id: &str,
    quantity: i64,
    actor: Option<&str>,
) -> AppResult<String> {
    if quantity <= 0 {
        return Err(AppError::validation("quantity must be at least 1"));
    }
    let item = get_item(conn, tenant_id, item_id)?;
    if !item.is_active {
        return Err(AppError::validation(format!("{} is inactive", item.sku)));
    }

    let tx = conn.unchecked_transaction()?;
    let movement = apply_change(
        &tx,
        &item,
        -quantity,
        "repair_use",
        Some(&device.id),
        Some(&device.tracking_code),
        actor,
    )?;
    let part_id = new_id("part");
    tx.execute(
        "INSERT INTO device_parts (id, tenant_id, device_id, item_id, quantity, unit_price,
                                   movement_id, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            part_id,
            tenant_id,
            device.id,
            item.id,
            quantity,
            item.unit_price,
            movement.id,
            actor,
            movement.created_at
        ],
    )?;
    tx.commit()?;

    info!(tenant_id, device_id = %device.id, item_id, quantity, "part used on device");
    notify_if_crossed(conn, tenant_id, &item, movement.quantity_after);
    Ok(part_id)
}

pub fn list_movements(
    conn: &Connection,
    tenant_id: &str,
    item_id: &str,
    pagination: Pagination,
) -> AppResult<Page<StockMovement>> {
    get_item(conn, tenant_id, item_id)?;
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM stock_movements WHERE tenant_id = ?1 AND item_id = ?2",
        params![tenant_id, item_id],
        |row| row.get(0),
    )?;
    let mut stmt = conn.prepare(
        "SELECT id, item_id, change, quantity_after, reason, reference, note, created_by, created_at
         FROM stock_movements WHERE tenant_id = ?1 AND item_id = ?2
         ORDER BY created_at DESC, rowid DESC LIMIT ?3 OFFSET ?4",
    )?;
    let items = stmt
        .query_map(
            params![tenant_id, item_id, pagination.page_size, pagination.offset()],
            movement_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(items, total, pagination))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::devices;
    use crate::tenants::fixtures;

    fn screen(qty: i64, reorder: i64) -> NewItem {
        NewItem {
            sku: " scr-a52 ".into(),
            name: "A52 screen".into(),
            category: Some("Screens".into()),
            compatible_models: Some("Samsung A52".into()),
            quantity: qty,
            reorder_level: reorder,
            unit_cost: 1200.0,
            unit_price: 1800.0,
            location: None,
        }
    }

    fn low_stock_notifications(conn: &Connection) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE notification_type = 'low_stock'",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn create_uppercases_sku_and_records_opening_stock() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        let item = create_item(&conn, tid, screen(5, 2), None).unwrap();
        assert_eq!(item.sku, "SCR-A52");
        assert!(!item.low_stock);
        let moves = list_movements(&conn, tid, &item.id, Pagination::default()).unwrap();
        assert_eq!(moves.total, 1);
        assert_eq!(moves.items[0].reason, "purchase");

        assert!(matches!(
            create_item(&conn, tid, screen(1, 0), None),
            Err(AppError::Conflict(_))
        ));
    }

    #[test]
    fn adjust_rejects_negative_result_and_mismatched_sign() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        let item = create_item(&conn, tid, screen(2, 0), None).unwrap();

        let adj = |change: i64, reason: &str| StockAdjustment {
            change,
            reason: reason.into(),
            reference: None,
            note: None,
        };
        assert!(adjust_stock(&conn, tid, &item.id, adj(-3, "sale"), None).is_err());
        assert!(adjust_stock(&conn, tid, &item.id, adj(3, "sale"), None).is_err());
        assert!(adjust_stock(&conn, tid, &item.id, adj(-1, "purchase"), None).is_err());
        assert!(adjust_stock(&conn, tid, &item.id, adj(-1, "repair_use"), None).is_err());
        assert!(adjust_stock(&conn, tid, &item.id, adj(0, "adjustment"), None).is_err());

        let result = adjust_stock(&conn, tid, &item.id, adj(-2, "sale"), None).unwrap();
        assert_eq!(result.item.quantity, 0);
        assert_eq!(result.movement.quantity_after, 0);
    }

    #[test]
    fn crossing_reorder_level_notifies_once() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        let item = create_item(&conn, tid, screen(4, 2), None).unwrap();
        let sale = |n: i64| StockAdjustment {
            change: -n,
            reason: "sale".into(),
            reference: None,
            note: None,
        };

        adjust_stock(&conn, tid, &item.id, sale(1), None).unwrap();
        assert_eq!(low_stock_notifications(&conn), 0);
        adjust_stock(&conn, tid, &item.id, sale(1), None).unwrap();
        assert_eq!(low_stock_notifications(&conn), 1);
        adjust_stock(&conn, tid, &item.id, sale(1), None).unwrap();
        assert_eq!(low_stock_notifications(&conn), 1, "already below, no repeat");

        let low = low_stock_items(&conn, tid).unwrap();
        assert_eq!(low.len(), 1);
        assert!(low[0].low_stock);
    }

    #[test]
    fn parts_used_on_device_are_priced_and_deducted() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        let item = create_item(&conn, tid, screen(3, 0), None).unwrap();
        let c = fixtures::customer(&conn, tid, "Almaz", "0911000111");
        let d = fixtures::device(&conn, tid, &c.id);

        let part = devices::record_part(
            &conn,
            tid,
            &d.id,
            devices::PartUsage {
                item_id: item.id.clone(),
                quantity: 2,
            },
            Some(&shop.admin.id),
        )
        .unwrap();
        assert_eq!(part.line_total, 3600.0);
        assert_eq!(get_item(&conn, tid, &item.id).unwrap().quantity, 1);

        let too_many = devices::record_part(
            &conn,
            tid,
            &d.id,
            devices::PartUsage {
                item_id: item.id.clone(),
                quantity: 5,
            },
            None,
        );
        assert!(too_many.is_err());
        let parts = devices::list_parts(&conn, tid, &d.id).unwrap();
        assert_eq!(parts.items.len(), 1);
        assert_eq!(parts.total_cost, 3600.0);
    }

    #[test]
    fn delete_blocked_by_history() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        let stocked = create_item(&conn, tid, screen(1, 0), None).unwrap();
        assert!(matches!(
            delete_item(&conn, tid, &stocked.id),
            Err(AppError::Conflict(_))
        ));
        let deactivated = update_item(
            &conn,
            tid,
            &stocked.id,
            ItemUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!deactivated.is_active);
        assert_eq!(list_items(&conn, tid, &ItemFilter::default()).unwrap().total, 0);

        let mut empty = screen(0, 0);
        empty.sku = "BAT-1".into();
        let empty = create_item(&conn, tid, empty, None).unwrap();
        delete_item(&conn, tid, &empty.id).unwrap();
    }
}
