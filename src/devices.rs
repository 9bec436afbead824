//! Devices left for repair and their status lifecycle.
//!
//! Every status change is appended to `device_status_history`. Side effects
//! of a change (staff notifications, customer SMS) run after the write has
//! committed; their failures are logged and do not undo the change.

use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::customers;
use crate::data_helpers::{
    check_len, check_non_negative, clean, like_pattern, new_id, now_rfc3339, parse_timestamp,
    to_rfc3339, Page, Pagination,
};
use crate::error::{AppError, AppResult};
use crate::inventory;
use crate::notifications::{self, StaffEvent};
use crate::settings;
use crate::sms;
use crate::tenants;

pub const STATUSES: &[&str] = &[
    "registered",
    "diagnosed",
    "awaiting_parts",
    "in_progress",
    "ready_for_pickup",
    "delivered",
    "unrepairable",
    "cancelled",
];

/// Statuses a device is no longer being worked on in.
pub const CLOSED_STATUSES: &[&str] = &["delivered", "cancelled"];

pub const DEVICE_TYPES: &[&str] = &[
    "phone",
    "tablet",
    "laptop",
    "desktop",
    "smartwatch",
    "console",
    "other",
];

pub const PRIORITIES: &[&str] = &["low", "normal", "high", "urgent"];

/// No 0/O, 1/I: codes are read out over the phone.
const TRACKING_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const TRACKING_CODE_LEN: usize = 6;

pub fn allowed_transitions(from: &str) -> &'static [&'static str] {
    match from {
        "registered" => &["diagnosed", "in_progress", "cancelled"],
        "diagnosed" => &["awaiting_parts", "in_progress", "unrepairable", "cancelled"],
        "awaiting_parts" => &["in_progress", "cancelled"],
        "in_progress" => &["awaiting_parts", "ready_for_pickup", "unrepairable"],
        "ready_for_pickup" => &["delivered", "in_progress"],
        "unrepairable" => &["delivered"],
        _ => &[],
    }
}

pub fn can_transition(from: &str, to: &str) -> bool {
    allowed_transitions(from).contains(&to)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub tenant_id: String,
    pub customer_id: String,
    pub customer_name: String,
    pub tracking_code: String,
    pub device_type: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub issue_description: String,
    pub condition_notes: Option<String>,
    pub accessories: Option<String>,
    pub status: String,
    pub priority: String,
    pub technician_id: Option<String>,
    pub technician_name: Option<String>,
    pub location: Option<String>,
    pub estimated_cost: Option<f64>,
    pub final_cost: Option<f64>,
    pub deposit_paid: f64,
    pub expected_ready_at: Option<String>,
    pub delivered_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Device {
    /// Final cost (or estimate) minus the deposit.
    pub fn amount_due(&self) -> Option<f64> {
        self.final_cost
            .or(self.estimated_cost)
            .map(|cost| (cost - self.deposit_paid).max(0.0))
    }

    /// "Samsung A52", falling back to the device type.
    pub fn label(&self) -> String {
        let parts: Vec<&str> = [self.brand.as_deref(), self.model.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        if parts.is_empty() {
            self.device_type.clone()
        } else {
            parts.join(" ")
        }
    }
}

const DEVICE_SELECT: &str = "SELECT d.id, d.tenant_id, d.customer_id, c.full_name, d.tracking_code,
        d.device_type, d.brand, d.model, d.serial_number, d.issue_description,
        d.condition_notes, d.accessories, d.status, d.priority, d.technician_id, u.full_name,
        d.location, d.estimated_cost, d.final_cost, d.deposit_paid, d.expected_ready_at,
        d.delivered_at, d.created_at, d.updated_at
     FROM devices d
     JOIN customers c ON c.id = d.customer_id
     LEFT JOIN users u ON u.id = d.technician_id";

fn device_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        customer_id: row.get(2)?,
        customer_name: row.get(3)?,
        tracking_code: row.get(4)?,
        device_type: row.get(5)?,
        brand: row.get(6)?,
        model: row.get(7)?,
        serial_number: row.get(8)?,
        issue_description: row.get(9)?,
        condition_notes: row.get(10)?,
        accessories: row.get(11)?,
        status: row.get(12)?,
        priority: row.get(13)?,
        technician_id: row.get(14)?,
        technician_name: row.get(15)?,
        location: row.get(16)?,
        estimated_cost: row.get(17)?,
        final_cost: row.get(18)?,
        deposit_paid: row.get(19)?,
        expected_ready_at: row.get(20)?,
        delivered_at: row.get(21)?,
        created_at: row.get(22)?,
        updated_at: row.get(23)?,
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDevice {
    #[serde(alias = "customer_id")]
    pub customer_id: String,
    #[serde(alias = "device_type", alias = "type")]
    pub device_type: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, alias = "serial_number", alias = "imei")]
    pub serial_number: Option<String>,
    #[serde(alias = "issue_description", alias = "issue", alias = "problem")]
    pub issue_description: String,
    #[serde(default, alias = "condition_notes")]
    pub condition_notes: Option<String>,
    #[serde(default)]
    pub accessories: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, alias = "estimated_cost")]
    pub estimated_cost: Option<f64>,
    #[serde(default, alias = "deposit_paid", alias = "deposit")]
    pub deposit_paid: Option<f64>,
    #[serde(default, alias = "expected_ready_at")]
    pub expected_ready_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUpdate {
    #[serde(default, alias = "device_type", alias = "type")]
    pub device_type: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, alias = "serial_number", alias = "imei")]
    pub serial_number: Option<String>,
    #[serde(default, alias = "issue_description", alias = "issue")]
    pub issue_description: Option<String>,
    #[serde(default, alias = "condition_notes")]
    pub condition_notes: Option<String>,
    #[serde(default)]
    pub accessories: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, alias = "estimated_cost")]
    pub estimated_cost: Option<f64>,
    #[serde(default, alias = "final_cost")]
    pub final_cost: Option<f64>,
    #[serde(default, alias = "deposit_paid", alias = "deposit")]
    pub deposit_paid: Option<f64>,
    #[serde(default, alias = "expected_ready_at")]
    pub expected_ready_at: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub statuses: Vec<String>,
    pub customer_id: Option<String>,
    pub technician_id: Option<String>,
    pub device_type: Option<String>,
    pub search: Option<String>,
    pub overdue: bool,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub id: String,
    pub from_status: Option<String>,
    pub to_status: String,
    pub note: Option<String>,
    pub changed_by: Option<String>,
    pub changed_by_name: Option<String>,
    pub changed_at: String,
}

fn validate_device_type(raw: &str) -> AppResult<String> {
    let t = raw.trim().to_lowercase();
    if DEVICE_TYPES.contains(&t.as_str()) {
        Ok(t)
    } else {
        Err(AppError::validation(format!(
            "deviceType must be one of {}",
            DEVICE_TYPES.join(", ")
        )))
    }
}

fn validate_priority(raw: &str) -> AppResult<String> {
    let p = raw.trim().to_lowercase();
    if PRIORITIES.contains(&p.as_str()) {
        Ok(p)
    } else {
        Err(AppError::validation(
            "priority must be one of low, normal, high, urgent",
        ))
    }
}

pub(crate) fn validate_status(raw: &str) -> AppResult<String> {
    let s = raw.trim().to_lowercase();
    if STATUSES.contains(&s.as_str()) {
        Ok(s)
    } else {
        Err(AppError::validation(format!("Unknown device status '{raw}'")))
    }
}

fn optional_text(field: &str, value: Option<String>, max: usize) -> AppResult<Option<String>> {
    let value = clean(value);
    if let Some(ref v) = value {
        check_len(field, v, 1, max)?;
    }
    Ok(value)
}

/// `None` keeps the old value; an empty string clears it.
fn merge_text(
    field: &str,
    new: Option<String>,
    old: Option<String>,
    max: usize,
) -> AppResult<Option<String>> {
    match new {
        Some(raw) => optional_text(field, Some(raw), max),
        None => Ok(old),
    }
}

fn optional_timestamp(field: &str, value: Option<String>) -> AppResult<Option<String>> {
    clean(value)
        .map(|raw| parse_timestamp(field, &raw).map(to_rfc3339))
        .transpose()
}

fn random_tracking_suffix() -> String {
    Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(TRACKING_CODE_LEN)
        .map(|b| TRACKING_ALPHABET[(*b as usize) % TRACKING_ALPHABET.len()] as char)
        .collect()
}

fn generate_tracking_code(conn: &Connection, tenant_id: &str) -> AppResult<String> {
    let prefix = settings::tracking_prefix(conn, tenant_id);
    for _ in 0..16 {
        let code = format!("{prefix}-{}", random_tracking_suffix());
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM devices WHERE tenant_id = ?1 AND tracking_code = ?2)",
            params![tenant_id, code],
            |row| row.get(0),
        )?;
        if !taken {
            return Ok(code);
        }
    }
    Err(AppError::internal("could not allocate a unique tracking code"))
}

#[allow(clippy::too_many_arguments)]
fn insert_history(
    conn: &Connection,
    tenant_id: &str,
    device_id: &str,
    from: Option<&str>,
    to: &str,
    note: Option<&str>,
    actor: Option<&str>,
    at: &str,
) -> AppResult<()> {
    conn.execute(
        "INSERT INTO device_status_history (id, tenant_id, device_id, from_status, to_status,
                                            note, changed_by, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![new_id("hist"), tenant_id, device_id, from, to, note, actor, at],
    )?;
    Ok(())
}

pub fn register_device(
    conn: &Connection,
    tenant_id: &str,
    actor: Option<&str>,
    input: NewDevice,
) -> AppResult<Device> {
    let customer = customers::get_customer(conn, tenant_id, input.customer_id.trim())?;
    let device_type = validate_device_type(&input.device_type)?;
    let issue = input.issue_description.trim().to_string();
    if issue.is_empty() {
        return Err(AppError::validation("issueDescription is required"));
    }
    check_len("issueDescription", &issue, 1, 2000)?;
    check_non_negative("estimatedCost", input.estimated_cost)?;
    check_non_negative("depositPaid", input.deposit_paid)?;
    let priority = match clean(input.priority) {
        Some(p) => validate_priority(&p)?,
        None => settings::default_priority(conn, tenant_id),
    };
    let expected_ready_at = optional_timestamp("expectedReadyAt", input.expected_ready_at)?;

    let tx = conn.unchecked_transaction()?;
    let id = new_id("dev");
    let code = generate_tracking_code(&tx, tenant_id)?;
    let now = now_rfc3339();
    tx.execute(
        "INSERT INTO devices (id, tenant_id, customer_id, tracking_code, device_type, brand, model,
                              serial_number, issue_description, condition_notes, accessories,
                              status, priority, location, estimated_cost, deposit_paid,
                              expected_ready_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'registered', ?12, ?13, ?14, ?15,
                 ?16, ?17, ?17)",
        params![
            id,
            tenant_id,
            customer.id,
            code,
            device_type,
            optional_text("brand", input.brand, 100)?,
            optional_text("model", input.model, 100)?,
            optional_text("serialNumber", input.serial_number, 100)?,
            issue,
            optional_text("conditionNotes", input.condition_notes, 1000)?,
            optional_text("accessories", input.accessories, 500)?,
            priority,
            optional_text("location", input.location, 100)?,
            input.estimated_cost,
            input.deposit_paid.unwrap_or(0.0),
            expected_ready_at,
            now
        ],
    )?;
    insert_history(&tx, tenant_id, &id, None, "registered", Some("Device registered"), actor, &now)?;
    tx.commit()?;

    info!(tenant_id, device_id = %id, tracking_code = %code, "device registered");
    get_device(conn, tenant_id, &id)
}

pub fn get_device(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<Device> {
    conn.query_row(
        &format!("{DEVICE_SELECT} WHERE d.tenant_id = ?1 AND d.id = ?2"),
        params![tenant_id, id],
        device_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("Device"))
}

pub fn list_devices(conn: &Connection, tenant_id: &str, filter: &DeviceFilter) -> AppResult<Page<Device>> {
    let mut clauses = vec!["d.tenant_id = ?".to_string()];
    let mut args: Vec<SqlValue> = vec![tenant_id.to_string().into()];

    if !filter.statuses.is_empty() {
        let statuses = filter
            .statuses
            .iter()
            .map(|s| validate_status(s))
            .collect::<AppResult<Vec<_>>>()?;
        clauses.push(format!("d.status IN ({})", vec!["?"; statuses.len()].join(", ")));
        args.extend(statuses.into_iter().map(SqlValue::from));
    }
    if let Some(customer_id) = &filter.customer_id {
        clauses.push("d.customer_id = ?".into());
        args.push(customer_id.clone().into());
    }
    if let Some(technician_id) = &filter.technician_id {
        clauses.push("d.technician_id = ?".into());
        args.push(technician_id.clone().into());
    }
    if let Some(t) = &filter.device_type {
        clauses.push("d.device_type = ?".into());
        args.push(validate_device_type(t)?.into());
    }
    if let Some(term) = filter.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        clauses.push(
            "(d.tracking_code LIKE ? ESCAPE '\\' OR d.brand LIKE ? ESCAPE '\\'
              OR d.model LIKE ? ESCAPE '\\' OR d.serial_number LIKE ? ESCAPE '\\')"
                .into(),
        );
        let pattern = like_pattern(term);
        for _ in 0..4 {
            args.push(pattern.clone().into());
        }
    }
    if filter.overdue {
        clauses.push(
            "d.expected_ready_at IS NOT NULL AND d.expected_ready_at < ?
             AND d.status NOT IN ('ready_for_pickup', 'delivered', 'cancelled', 'unrepairable')"
                .into(),
        );
        args.push(now_rfc3339().into());
    }

    let where_sql = clauses.join(" AND ");
    let total: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM devices d JOIN customers c ON c.id = d.customer_id WHERE {where_sql}"
        ),
        params_from_iter(args.iter()),
        |row| row.get(0),
    )?;
    args.push(filter.pagination.page_size.into());
    args.push(filter.pagination.offset().into());
    let mut stmt = conn.prepare(&format!(
        "{DEVICE_SELECT} WHERE {where_sql} ORDER BY d.created_at DESC, d.id DESC LIMIT ? OFFSET ?"
    ))?;
    let items = stmt
        .query_map(params_from_iter(args.iter()), device_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(items, total, filter.pagination))
}

pub fn devices_for_customer(conn: &Connection, tenant_id: &str, customer_id: &str) -> AppResult<Vec<Device>> {
    customers::get_customer(conn, tenant_id, customer_id)?;
    let mut stmt = conn.prepare(&format!(
        "{DEVICE_SELECT} WHERE d.tenant_id = ?1 AND d.customer_id = ?2 ORDER BY d.created_at DESC"
    ))?;
    let rows = stmt.query_map(params![tenant_id, customer_id], device_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn update_device(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
    update: DeviceUpdate,
) -> AppResult<Device> {
    let current = get_device(conn, tenant_id, id)?;

    let device_type = match update.device_type {
        Some(t) => validate_device_type(&t)?,
        None => current.device_type,
    };
    let issue = match update.issue_description {
        Some(raw) => {
            let issue = raw.trim().to_string();
            if issue.is_empty() {
                return Err(AppError::validation("issueDescription is required"));
            }
            check_len("issueDescription", &issue, 1, 2000)?;
            issue
        }
        None => current.issue_description,
    };
    let priority = match update.priority {
        Some(p) => validate_priority(&p)?,
        None => current.priority,
    };
    check_non_negative("estimatedCost", update.estimated_cost)?;
    check_non_negative("finalCost", update.final_cost)?;
    check_non_negative("depositPaid", update.deposit_paid)?;

    let brand = merge_text("brand", update.brand, current.brand, 100)?;
    let model = merge_text("model", update.model, current.model, 100)?;
    let serial = merge_text("serialNumber", update.serial_number, current.serial_number, 100)?;
    let condition = merge_text("conditionNotes", update.condition_notes, current.condition_notes, 1000)?;
    let accessories = merge_text("accessories", update.accessories, current.accessories, 500)?;
    let location = merge_text("location", update.location, current.location, 100)?;
    let expected_ready_at = match update.expected_ready_at {
        Some(raw) => optional_timestamp("expectedReadyAt", Some(raw))?,
        None => current.expected_ready_at,
    };

    conn.execute(
        "UPDATE devices SET device_type = ?1, brand = ?2, model = ?3, serial_number = ?4,
                issue_description = ?5, condition_notes = ?6, accessories = ?7, priority = ?8,
                location = ?9, estimated_cost = ?10, final_cost = ?11, deposit_paid = ?12,
                expected_ready_at = ?13, updated_at = ?14
         WHERE tenant_id = ?15 AND id = ?16",
        params![
            device_type,
            brand,
            model,
            serial,
            issue,
            condition,
            accessories,
            priority,
            location,
            update.estimated_cost.or(current.estimated_cost),
            update.final_cost.or(current.final_cost),
            update.deposit_paid.unwrap_or(current.deposit_paid),
            expected_ready_at,
            now_rfc3339(),
            tenant_id,
            id
        ],
    )?;
    get_device(conn, tenant_id, id)
}

/// Move a device to a new status and fire the follow-up notifications.
pub fn change_status(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
    new_status: &str,
    note: Option<String>,
    actor: Option<&str>,
) -> AppResult<Device> {
    let to = validate_status(new_status)?;
    let current = get_device(conn, tenant_id, id)?;
    if current.status == to {
        return Err(AppError::validation(format!("Device is already {to}")));
    }
    if !can_transition(&current.status, &to) {
        return Err(AppError::validation(format!(
            "Cannot move device from {} to {to}",
            current.status
        )));
    }
    let note = clean(note);
    if let Some(ref n) = note {
        check_len("note", n, 1, 1000)?;
    }

    let now = now_rfc3339();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE devices SET status = ?1, updated_at = ?2,
                delivered_at = CASE WHEN ?1 = 'delivered' THEN ?2 ELSE delivered_at END
         WHERE tenant_id = ?3 AND id = ?4",
        params![to, now, tenant_id, id],
    )?;
    insert_history(&tx, tenant_id, id, Some(&current.status), &to, note.as_deref(), actor, &now)?;
    tx.commit()?;

    info!(tenant_id, device_id = id, from = %current.status, to = %to, "device status changed");
    let device = get_device(conn, tenant_id, id)?;

    let event = StaffEvent::new(
        notifications::DEVICE_STATUS_CHANGED,
        format!("{} is now {}", device.tracking_code, to.replace('_', " ")),
        format!(
            "{} ({}) moved from {} to {}",
            device.label(),
            device.customer_name,
            current.status.replace('_', " "),
            to.replace('_', " ")
        ),
    )
    .reference(&device.id)
    .excluding(actor);
    if let Err(e) = notifications::dispatch(conn, tenant_id, &event) {
        warn!(device_id = id, error = %e, "status notification failed");
    }

    if settings::auto_notify(conn, tenant_id) {
        match sms::notify_customer_for_device(conn, tenant_id, &device, &to) {
            Ok(Some(message_id)) => info!(device_id = id, message_id = %message_id, "customer SMS queued"),
            Ok(None) => debug!(device_id = id, status = %to, "no SMS sent for status"),
            Err(e) => warn!(device_id = id, error = %e, "customer SMS could not be queued"),
        }
    }

    Ok(device)
}

/// Assign (or with `None`, unassign) a technician.
pub fn assign_technician(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
    technician_id: Option<String>,
    actor: Option<&str>,
) -> AppResult<Device> {
    let device = get_device(conn, tenant_id, id)?;
    if CLOSED_STATUSES.contains(&device.status.as_str()) {
        return Err(AppError::validation(format!(
            "Cannot assign a technician to a {} device",
            device.status
        )));
    }
    let technician = match clean(technician_id) {
        Some(tech_id) => {
            let user = auth::get_user(conn, tenant_id, &tech_id)
                .map_err(|_| AppError::validation("technicianId is not a user of this shop"))?;
            if !user.is_active {
                return Err(AppError::validation("Technician account is inactive"));
            }
            Some(user)
        }
        None => None,
    };

    conn.execute(
        "UPDATE devices SET technician_id = ?1, updated_at = ?2 WHERE tenant_id = ?3 AND id = ?4",
        params![technician.as_ref().map(|u| u.id.as_str()), now_rfc3339(), tenant_id, id],
    )?;
    let device = get_device(conn, tenant_id, id)?;

    if let Some(user) = technician {
        info!(tenant_id, device_id = id, technician_id = %user.id, "technician assigned");
        if Some(user.id.as_str()) != actor {
            let event = StaffEvent::new(
                notifications::DEVICE_ASSIGNED,
                format!("{} assigned to you", device.tracking_code),
                format!("{}: {}", device.label(), device.issue_description),
            )
            .reference(&device.id)
            .target(&user.id);
            if let Err(e) = notifications::dispatch(conn, tenant_id, &event) {
                warn!(device_id = id, error = %e, "assignment notification failed");
            }
        }
    }
    Ok(device)
}

pub fn history(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<Vec<StatusChange>> {
    get_device(conn, tenant_id, id)?;
    let mut stmt = conn.prepare(
        "SELECT h.id, h.from_status, h.to_status, h.note, h.changed_by, u.full_name, h.changed_at
         FROM device_status_history h
         LEFT JOIN users u ON u.id = h.changed_by
         WHERE h.tenant_id = ?1 AND h.device_id = ?2
         ORDER BY h.changed_at, h.rowid",
    )?;
    let rows = stmt.query_map(params![tenant_id, id], |row| {
        Ok(StatusChange {
            id: row.get(0)?,
            from_status: row.get(1)?,
            to_status: row.get(2)?,
            note: row.get(3)?,
            changed_by: row.get(4)?,
            changed_by_name: row.get(5)?,
            changed_at: row.get(6)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn delete_device(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<()> {
    let device = get_device(conn, tenant_id, id)?;
    if !matches!(device.status.as_str(), "registered" | "cancelled") {
        return Err(AppError::conflict(format!(
            "Only registered or cancelled devices can be deleted (device is {})",
            device.status
        )));
    }
    let parts: i64 = conn.query_row(
        "SELECT COUNT(*) FROM device_parts WHERE device_id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    if parts > 0 {
        return Err(AppError::conflict("Device has parts recorded against it"));
    }
    conn.execute(
        "DELETE FROM devices WHERE tenant_id = ?1 AND id = ?2",
        params![tenant_id, id],
    )?;
    info!(tenant_id, device_id = id, "device deleted");
    Ok(())
}

// ---------------------------------------------------------------------------
// Parts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePart {
    pub id: String,
    pub item_id: String,
    pub sku: String,
    pub name: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub line_total: f64,
    pub created_by: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceParts {
    pub items: Vec<DevicePart>,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUsage {
    #[serde(alias = "item_id", alias = "inventoryItemId")]
    pub item_id: String,
    #[serde(default = "one", alias = "qty")]
    pub quantity: i64,
}

fn one() -> i64 {
    1
}

pub fn record_part(
    conn: &Connection,
    tenant_id: &str,
    device_id: &str,
    usage: PartUsage,
    actor: Option<&str>,
) -> AppResult<DevicePart> {
    let device = get_device(conn, tenant_id, device_id)?;
    if CLOSED_STATUSES.contains(&device.status.as_str()) {
        return Err(AppError::validation(format!(
            "Cannot add parts to a {} device",
            device.status
        )));
    }
    let part_id = inventory::use_part_for_device(
        conn,
        tenant_id,
        &device,
        usage.item_id.trim(),
        usage.quantity,
        actor,
    )?;
    list_parts(conn, tenant_id, device_id)?
        .items
        .into_iter()
        .find(|p| p.id == part_id)
        .ok_or_else(|| AppError::internal("recorded part vanished"))
}

pub fn list_parts(conn: &Connection, tenant_id: &str, device_id: &str) -> AppResult<DeviceParts> {
    get_device(conn, tenant_id, device_id)?;
    let mut stmt = conn.prepare(
        "SELECT p.id, p.item_id, i.sku, i.name, p.quantity, p.unit_price, p.created_by, p.created_at
         FROM device_parts p
         JOIN inventory_items i ON i.id = p.item_id
         WHERE p.tenant_id = ?1 AND p.device_id = ?2
         ORDER BY p.created_at, p.rowid",
    )?;
    let items = stmt
        .query_map(params![tenant_id, device_id], |row| {
            let quantity: i64 = row.get(4)?;
            let unit_price: f64 = row.get(5)?;
            Ok(DevicePart {
                id: row.get(0)?,
                item_id: row.get(1)?,
                sku: row.get(2)?,
                name: row.get(3)?,
                quantity,
                unit_price,
                line_total: unit_price * quantity as f64,
                created_by: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let total_cost = items.iter().map(|p| p.line_total).sum();
    Ok(DeviceParts { items, total_cost })
}

// ---------------------------------------------------------------------------
// Public tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicStatusEntry {
    pub status: String,
    pub changed_at: String,
}

/// What a customer sees when looking up a tracking code.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicTracking {
    pub tracking_code: String,
    pub shop_name: String,
    pub shop_phone: Option<String>,
    pub device_type: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub status: String,
    pub expected_ready_at: Option<String>,
    pub amount_due: Option<f64>,
    pub updated_at: String,
    pub history: Vec<PublicStatusEntry>,
}

pub fn public_track(conn: &Connection, tenant_slug: &str, tracking_code: &str) -> AppResult<PublicTracking> {
    let tenant = tenants::find_by_slug(conn, tenant_slug.trim())?
        .ok_or_else(|| AppError::not_found("Device"))?;
    let code = tracking_code.trim().to_uppercase();
    let device_id: String = conn
        .query_row(
            "SELECT id FROM devices WHERE tenant_id = ?1 AND tracking_code = ?2",
            params![tenant.id, code],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| AppError::not_found("Device"))?;
    let device = get_device(conn, &tenant.id, &device_id)?;
    let history = history(conn, &tenant.id, &device_id)?
        .into_iter()
        .map(|h| PublicStatusEntry {
            status: h.to_status,
            changed_at: h.changed_at,
        })
        .collect();
    let shop_phone = Some(settings::get_string(conn, &tenant.id, "shop", "phone")).filter(|p| !p.is_empty());

    Ok(PublicTracking {
        amount_due: device.amount_due(),
        tracking_code: device.tracking_code,
        shop_name: settings::get_string(conn, &tenant.id, "shop", "name"),
        shop_phone,
        device_type: device.device_type,
        brand: device.brand,
        model: device.model,
        status: device.status,
        expected_ready_at: device.expected_ready_at,
        updated_at: device.updated_at,
        history,
    })
}
