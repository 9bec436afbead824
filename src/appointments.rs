//! Appointment booking, technician overlap checks and SMS reminders.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth;
use crate::customers;
use crate::data_helpers::{
    check_len, clean, new_id, now_rfc3339, parse_timestamp, range_bound, to_rfc3339, Page, Pagination,
};
use crate::devices;
use crate::error::{AppError, AppResult};
use crate::notifications::{self, StaffEvent};
use crate::settings;
use crate::sms::{self, Variables};
use crate::tenants;

pub const STATUSES: &[&str] = &["scheduled", "confirmed", "completed", "cancelled", "no_show"];
pub const MAX_DURATION_HOURS: i64 = 8;
pub const DEFAULT_DURATION_MINUTES: i64 = 60;

pub fn allowed_transitions(from: &str) -> &'static [&'static str] {
    match from {
        "scheduled" => &["confirmed", "cancelled", "no_show", "completed"],
        "confirmed" => &["completed", "cancelled", "no_show"],
        _ => &[],
    }
}

fn is_terminal(status: &str) -> bool {
    allowed_transitions(status).is_empty()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: String,
    pub tenant_id: String,
    pub customer_id: String,
    pub customer_name: String,
    pub device_id: Option<String>,
    pub tracking_code: Option<String>,
    pub technician_id: Option<String>,
    pub technician_name: Option<String>,
    pub purpose: String,
    pub starts_at: String,
    pub ends_at: String,
    pub status: String,
    pub notes: Option<String>,
    pub reminder_sent_at: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

const APPOINTMENT_SELECT: &str = "SELECT a.id, a.tenant_id, a.customer_id, c.full_name, a.device_id,
        d.tracking_code, a.technician_id, u.full_name, a.purpose, a.starts_at, a.ends_at, a.status,
        a.notes, a.reminder_sent_at, a.created_by, a.created_at, a.updated_at
     FROM appointments a
     JOIN customers c ON c.id = a.customer_id
     LEFT JOIN devices d ON d.id = a.device_id
     LEFT JOIN users u ON u.id = a.technician_id";

fn appointment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Appointment> {
    Ok(Appointment {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        customer_id: row.get(2)?,
        customer_name: row.get(3)?,
        device_id: row.get(4)?,
        tracking_code: row.get(5)?,
        technician_id: row.get(6)?,
        technician_name: row.get(7)?,
        purpose: row.get(8)?,
        starts_at: row.get(9)?,
        ends_at: row.get(10)?,
        status: row.get(11)?,
        notes: row.get(12)?,
        reminder_sent_at: row.get(13)?,
        created_by: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAppointment {
    #[serde(alias = "customer_id")]
    pub customer_id: String,
    #[serde(default, alias = "device_id")]
    pub device_id: Option<String>,
    #[serde(default, alias = "technician_id")]
    pub technician_id: Option<String>,
    pub purpose: String,
    #[serde(alias = "starts_at", alias = "start")]
    pub starts_at: String,
    /// Defaults to one hour after the start.
    #[serde(default, alias = "ends_at", alias = "end")]
    pub ends_at: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Partial update. For `deviceId` and `technicianId` an empty string clears
/// the field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentUpdate {
    #[serde(default, alias = "device_id")]
    pub device_id: Option<String>,
    #[serde(default, alias = "technician_id")]
    pub technician_id: Option<String>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default, alias = "starts_at", alias = "start")]
    pub starts_at: Option<String>,
    #[serde(default, alias = "ends_at", alias = "end")]
    pub ends_at: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AppointmentFilter {
    pub from: Option<String>,
    pub to: Option<String>,
    pub status: Option<String>,
    pub technician_id: Option<String>,
    pub customer_id: Option<String>,
    pub pagination: Pagination,
}

fn validate_window(starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> AppResult<()> {
    if ends_at <= starts_at {
        return Err(AppError::validation("endsAt must be after startsAt"));
    }
    if ends_at - starts_at > Duration::hours(MAX_DURATION_HOURS) {
        return Err(AppError::validation(format!(
            "An appointment can last at most {MAX_DURATION_HOURS} hours"
        )));
    }
    Ok(())
}

fn validate_device(conn: &Connection, tenant_id: &str, customer_id: &str, device_id: &str) -> AppResult<()> {
    let device = devices::get_device(conn, tenant_id, device_id)
        .map_err(|_| AppError::validation("deviceId is not a device of this shop"))?;
    if device.customer_id != customer_id {
        return Err(AppError::validation("Device does not belong to this customer"));
    }
    Ok(())
}

fn validate_technician(conn: &Connection, tenant_id: &str, technician_id: &str) -> AppResult<()> {
    let user = auth::get_user(conn, tenant_id, technician_id)
        .map_err(|_| AppError::validation("technicianId is not a user of this shop"))?;
    if !user.is_active {
        return Err(AppError::validation("Technician account is inactive"));
    }
    Ok(())
}

/// 409 when the technician already holds an active appointment that
/// overlaps `[starts_at, ends_at)`.
fn ensure_no_overlap(
    conn: &Connection,
    tenant_id: &str,
    technician_id: &str,
    starts_at: &str,
    ends_at: &str,
    except_id: Option<&str>,
) -> AppResult<()> {
    let clash: Option<(String, String)> = conn
        .query_row(
            "SELECT id, starts_at FROM appointments
             WHERE tenant_id = ?1 AND technician_id = ?2
               AND status NOT IN ('cancelled', 'no_show')
               AND starts_at < ?4 AND ends_at > ?3
               AND id != ?5
             ORDER BY starts_at LIMIT 1",
            params![tenant_id, technician_id, starts_at, ends_at, except_id.unwrap_or("")],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match clash {
        Some((id, at)) => Err(AppError::conflict(format!(
            "Technician already has appointment {id} at {at}"
        ))),
        None => Ok(()),
    }
}

pub fn create_appointment(
    conn: &Connection,
    tenant_id: &str,
    input: NewAppointment,
    actor: Option<&str>,
) -> AppResult<Appointment> {
    let customer = customers::get_customer(conn, tenant_id, input.customer_id.trim())
        .map_err(|_| AppError::validation("customerId is not a customer of this shop"))?;
    let purpose = input.purpose.trim().to_string();
    check_len("purpose", &purpose, 1, 200)?;
    let starts_at = parse_timestamp("startsAt", &input.starts_at)?;
    let ends_at = match clean(input.ends_at) {
        Some(raw) => parse_timestamp("endsAt", &raw)?,
        None => starts_at + Duration::minutes(DEFAULT_DURATION_MINUTES),
    };
    validate_window(starts_at, ends_at)?;
    let device_id = clean(input.device_id);
    if let Some(ref id) = device_id {
        validate_device(conn, tenant_id, &customer.id, id)?;
    }
    let technician_id = clean(input.technician_id);
    let (starts, ends) = (to_rfc3339(starts_at), to_rfc3339(ends_at));
    if let Some(ref tech) = technician_id {
        validate_technician(conn, tenant_id, tech)?;
        ensure_no_overlap(conn, tenant_id, tech, &starts, &ends, None)?;
    }
    let notes = clean(input.notes);
    if let Some(ref n) = notes {
        check_len("notes", n, 1, 1000)?;
    }

    let id = new_id("appt");
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO appointments (id, tenant_id, customer_id, device_id, technician_id, purpose,
                                   starts_at, ends_at, status, notes, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'scheduled', ?9, ?10, ?11, ?11)",
        params![id, tenant_id, customer.id, device_id, technician_id, purpose, starts, ends, notes, actor, now],
    )?;
    info!(tenant_id, appointment_id = %id, starts_at = %starts, "appointment created");

    let appointment = get_appointment(conn, tenant_id, &id)?;
    let event = StaffEvent::new(
        notifications::APPOINTMENT_CREATED,
        format!("New appointment with {}", appointment.customer_name),
        format!("{} at {}", appointment.purpose, appointment.starts_at),
    )
    .reference(&appointment.id)
    .excluding(actor);
    if let Err(e) = notifications::dispatch(conn, tenant_id, &event) {
        warn!(appointment_id = %id, error = %e, "appointment notification failed");
    }
    Ok(appointment)
}

pub fn get_appointment(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<Appointment> {
    conn.query_row(
        &format!("{APPOINTMENT_SELECT} WHERE a.tenant_id = ?1 AND a.id = ?2"),
        params![tenant_id, id],
        appointment_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("Appointment"))
}

pub fn list_appointments(
    conn: &Connection,
    tenant_id: &str,
    filter: &AppointmentFilter,
) -> AppResult<Page<Appointment>> {
    let mut clauses = vec!["a.tenant_id = ?".to_string()];
    let mut args: Vec<SqlValue> = vec![tenant_id.to_string().into()];
    if let Some(from) = filter.from.as_deref().filter(|s| !s.trim().is_empty()) {
        clauses.push("a.starts_at >= ?".into());
        args.push(range_bound("from", from, false)?.into());
    }
    if let Some(to) = filter.to.as_deref().filter(|s| !s.trim().is_empty()) {
        clauses.push("a.starts_at < ?".into());
        args.push(range_bound("to", to, true)?.into());
    }
    if let Some(status) = filter.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        if !STATUSES.contains(&status) {
            return Err(AppError::validation(format!("status must be one of {}", STATUSES.join(", "))));
        }
        clauses.push("a.status = ?".into());
        args.push(status.to_string().into());
    }
    if let Some(tech) = filter.technician_id.as_deref().filter(|s| !s.is_empty()) {
        clauses.push("a.technician_id = ?".into());
        args.push(tech.to_string().into());
    }
    if let Some(customer) = filter.customer_id.as_deref().filter(|s| !s.is_empty()) {
        clauses.push("a.customer_id = ?".into());
        args.push(customer.to_string().into());
    }

    let where_sql = clauses.join(" AND ");
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM appointments a WHERE {where_sql}"),
        params_from_iter(args.iter()),
        |row| row.get(0),
    )?;
    args.push(filter.pagination.page_size.into());
    args.push(filter.pagination.offset().into());
    let mut stmt = conn.prepare(&format!(
        "{APPOINTMENT_SELECT} WHERE {where_sql} ORDER BY a.starts_at, a.id LIMIT ? OFFSET ?"
    ))?;
    let items = stmt
        .query_map(params_from_iter(args.iter()), appointment_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(items, total, filter.pagination))
}

pub fn update_appointment(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
    update: AppointmentUpdate,
) -> AppResult<Appointment> {
    let current = get_appointment(conn, tenant_id, id)?;
    if is_terminal(&current.status) {
        return Err(AppError::validation(format!(
            "A {} appointment cannot be changed",
            current.status.replace('_', " ")
        )));
    }
    let starts_at = match update.starts_at.as_deref() {
        Some(raw) => parse_timestamp("startsAt", raw)?,
        None => parse_timestamp("startsAt", &current.starts_at)?,
    };
    let ends_at = match update.ends_at.as_deref() {
        Some(raw) => parse_timestamp("endsAt", raw)?,
        None => parse_timestamp("endsAt", &current.ends_at)?,
    };
    validate_window(starts_at, ends_at)?;
    let (starts, ends) = (to_rfc3339(starts_at), to_rfc3339(ends_at));

    let device_id = match update.device_id {
        Some(raw) => clean(Some(raw)),
        None => current.device_id,
    };
    if let Some(ref d) = device_id {
        validate_device(conn, tenant_id, &current.customer_id, d)?;
    }
    let technician_id = match update.technician_id {
        Some(raw) => {
            let t = clean(Some(raw));
            if let Some(ref tech) = t {
                validate_technician(conn, tenant_id, tech)?;
            }
            t
        }
        None => current.technician_id,
    };
    if let Some(ref tech) = technician_id {
        ensure_no_overlap(conn, tenant_id, tech, &starts, &ends, Some(id))?;
    }
    let purpose = match update.purpose {
        Some(raw) => {
            let p = raw.trim().to_string();
            check_len("purpose", &p, 1, 200)?;
            p
        }
        None => current.purpose,
    };
    let notes = match update.notes {
        Some(raw) => clean(Some(raw)),
        None => current.notes,
    };
    if let Some(ref n) = notes {
        check_len("notes", n, 1, 1000)?;
    }
    let rescheduled = starts != current.starts_at;

    conn.execute(
        "UPDATE appointments SET device_id = ?1, technician_id = ?2, purpose = ?3, starts_at = ?4,
                ends_at = ?5, notes = ?6, updated_at = ?7,
                reminder_sent_at = CASE WHEN ?8 THEN NULL ELSE reminder_sent_at END
         WHERE tenant_id = ?9 AND id = ?10",
        params![device_id, technician_id, purpose, starts, ends, notes, now_rfc3339(), rescheduled, tenant_id, id],
    )?;
    if rescheduled {
        info!(tenant_id, appointment_id = id, starts_at = %starts, "appointment rescheduled");
    }
    get_appointment(conn, tenant_id, id)
}

pub fn change_status(conn: &Connection, tenant_id: &str, id: &str, status: &str) -> AppResult<Appointment> {
    let current = get_appointment(conn, tenant_id, id)?;
    let to = status.trim().to_lowercase();
    if !STATUSES.contains(&to.as_str()) {
        return Err(AppError::validation(format!("status must be one of {}", STATUSES.join(", "))));
    }
    if !allowed_transitions(&current.status).contains(&to.as_str()) {
        return Err(AppError::validation(format!(
            "Cannot move an appointment from {} to {}",
            current.status, to
        )));
    }
    conn.execute(
        "UPDATE appointments SET status = ?1, updated_at = ?2 WHERE tenant_id = ?3 AND id = ?4",
        params![to, now_rfc3339(), tenant_id, id],
    )?;
    info!(tenant_id, appointment_id = id, from = %current.status, to = %to, "appointment status changed");
    get_appointment(conn, tenant_id, id)
}

pub fn delete_appointment(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<()> {
    let n = conn.execute(
        "DELETE FROM appointments WHERE tenant_id = ?1 AND id = ?2",
        params![tenant_id, id],
    )?;
    if n == 0 {
        return Err(AppError::not_found("Appointment"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Reminders
// ---------------------------------------------------------------------------

fn due_reminders(conn: &Connection, tenant_id: &str, now: DateTime<Utc>) -> AppResult<Vec<Appointment>> {
    let horizon = now + Duration::hours(settings::reminder_hours(conn, tenant_id));
    let mut stmt = conn.prepare(&format!(
        "{APPOINTMENT_SELECT}
         WHERE a.tenant_id = ?1 AND a.status IN ('scheduled', 'confirmed')
           AND a.reminder_sent_at IS NULL AND a.starts_at > ?2 AND a.starts_at <= ?3
         ORDER BY a.starts_at"
    ))?;
    let rows = stmt.query_map(
        params![tenant_id, to_rfc3339(now), to_rfc3339(horizon)],
        appointment_from_row,
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Appointments inside the reminder window that have not been reminded.
pub fn pending_reminders(conn: &Connection, tenant_id: &str, now: DateTime<Utc>) -> AppResult<i64> {
    Ok(due_reminders(conn, tenant_id, now)?.len() as i64)
}

/// Queue reminder SMS for every tenant. An appointment is stamped once its
/// reminder is queued or its template cannot be rendered for it. Tenants
/// without an `appointment_reminder` template are left alone, and other
/// failures leave the appointment for the next pass.
pub fn queue_due_reminders(conn: &Connection, now: DateTime<Utc>) -> AppResult<usize> {
    let mut queued = 0;
    for tenant in tenants::list_tenants(conn)? {
        for appointment in due_reminders(conn, &tenant.id, now)? {
            let customer = customers::get_customer(conn, &tenant.id, &appointment.customer_id)?;
            let device = appointment
                .device_id
                .as_deref()
                .map(|id| devices::get_device(conn, &tenant.id, id))
                .transpose()?;
            let mut extra = Variables::new();
            let starts_at = parse_timestamp("startsAt", &appointment.starts_at)?;
            extra.insert(
                "appointment_time".into(),
                starts_at.format("%Y-%m-%d %H:%M UTC").to_string(),
            );
            let outcome = sms::send_triggered(
                conn,
                &tenant.id,
                sms::TRIGGER_APPOINTMENT_REMINDER,
                &customer,
                device.as_ref(),
                extra,
                "appointment_reminder",
                &appointment.id,
            );
            match outcome {
                Ok(None) => break,
                Ok(Some(message_id)) => {
                    queued += 1;
                    info!(appointment_id = %appointment.id, message_id = %message_id, "reminder queued");
                }
                Err(AppError::Validation(reason)) => {
                    warn!(appointment_id = %appointment.id, %reason, "reminder cannot be rendered, skipped");
                }
                Err(e) => {
                    warn!(appointment_id = %appointment.id, error = %e, "reminder failed, will retry");
                    continue;
                }
            }
            conn.execute(
                "UPDATE appointments SET reminder_sent_at = ?1 WHERE id = ?2",
                params![to_rfc3339(now), appointment.id],
            )?;
        }
    }
    Ok(queued)
}
