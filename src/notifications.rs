//! Staff notifications: per-user channel preferences, event fan-out and the
//! in-app inbox.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{self, User};
use crate::data_helpers::{new_id, normalize_phone, now_rfc3339, Page, Pagination};
use crate::error::{AppError, AppResult};
use crate::settings;
use crate::sms;

pub const DEVICE_STATUS_CHANGED: &str = "device_status_changed";
pub const DEVICE_ASSIGNED: &str = "device_assigned";
pub const APPOINTMENT_CREATED: &str = "appointment_created";
pub const LOW_STOCK: &str = "low_stock";
pub const SMS_FAILED: &str = "sms_failed";
pub const DAILY_SUMMARY: &str = "daily_summary";

pub const CHANNELS: &[&str] = &["email", "sms", "push", "in_app"];

/// Channel toggles for one notification type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Channels {
    pub email: bool,
    pub sms: bool,
    pub push: bool,
    pub in_app: bool,
}

impl Channels {
    const fn new(email: bool, sms: bool, push: bool, in_app: bool) -> Self {
        Self { email, sms, push, in_app }
    }

    pub fn any(&self) -> bool {
        self.email || self.sms || self.push || self.in_app
    }

    fn enabled(&self) -> Vec<&'static str> {
        let flags = [self.email, self.sms, self.push, self.in_app];
        CHANNELS
            .iter()
            .zip(flags)
            .filter_map(|(name, on)| on.then_some(*name))
            .collect()
    }
}

/// Known types with their default channels.
pub const NOTIFICATION_TYPES: &[(&str, Channels)] = &[
    (DEVICE_STATUS_CHANGED, Channels::new(false, false, true, true)),
    (DEVICE_ASSIGNED, Channels::new(false, false, true, true)),
    (APPOINTMENT_CREATED, Channels::new(false, false, false, true)),
    (LOW_STOCK, Channels::new(true, false, false, true)),
    (SMS_FAILED, Channels::new(false, false, false, true)),
    (DAILY_SUMMARY, Channels::new(true, false, false, true)),
];

fn defaults_for(notification_type: &str) -> Option<Channels> {
    NOTIFICATION_TYPES
        .iter()
        .find(|(t, _)| *t == notification_type)
        .map(|(_, c)| *c)
}

// ---------------------------------------------------------------------------
// Preferences
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Preference {
    pub notification_type: String,
    #[serde(flatten)]
    pub channels: Channels,
    /// False while the user still runs on the defaults for this type.
    pub customized: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceUpdate {
    #[serde(alias = "type", alias = "notification_type")]
    pub notification_type: String,
    #[serde(default)]
    pub email: Option<bool>,
    #[serde(default)]
    pub sms: Option<bool>,
    #[serde(default)]
    pub push: Option<bool>,
    #[serde(default, alias = "in_app", alias = "inApp")]
    pub in_app: Option<bool>,
}

fn stored_channels(conn: &Connection, user_id: &str, notification_type: &str) -> AppResult<Option<Channels>> {
    Ok(conn
        .query_row(
            "SELECT email, sms, push, in_app FROM notification_preferences
             WHERE user_id = ?1 AND notification_type = ?2",
            params![user_id, notification_type],
            |row| {
                Ok(Channels {
                    email: row.get::<_, i64>(0)? != 0,
                    sms: row.get::<_, i64>(1)? != 0,
                    push: row.get::<_, i64>(2)? != 0,
                    in_app: row.get::<_, i64>(3)? != 0,
                })
            },
        )
        .optional()?)
}

/// Effective channels for a user and type, falling back to the defaults.
pub fn channels_for(conn: &Connection, user_id: &str, notification_type: &str) -> AppResult<Channels> {
    let defaults = defaults_for(notification_type)
        .ok_or_else(|| AppError::validation(format!("Unknown notification type {notification_type}")))?;
    Ok(stored_channels(conn, user_id, notification_type)?.unwrap_or(defaults))
}

pub fn get_preferences(conn: &Connection, user_id: &str) -> AppResult<Vec<Preference>> {
    NOTIFICATION_TYPES
        .iter()
        .map(|(notification_type, defaults)| {
            let stored = stored_channels(conn, user_id, notification_type)?;
            Ok(Preference {
                notification_type: notification_type.to_string(),
                customized: stored.is_some(),
                channels: stored.unwrap_or(*defaults),
            })
        })
        .collect()
}

/// Upsert partial toggles. All types are validated before anything is written.
pub fn update_preferences(
    conn: &Connection,
    tenant_id: &str,
    user_id: &str,
    updates: Vec<PreferenceUpdate>,
) -> AppResult<Vec<Preference>> {
    if updates.is_empty() {
        return Err(AppError::validation("No preferences given"));
    }
    for update in &updates {
        if defaults_for(update.notification_type.trim()).is_none() {
            return Err(AppError::validation(format!(
                "Unknown notification type {}",
                update.notification_type
            )));
        }
    }

    let tx = conn.unchecked_transaction()?;
    let now = now_rfc3339();
    for update in &updates {
        let notification_type = update.notification_type.trim();
        let current = channels_for(&tx, user_id, notification_type)?;
        let merged = Channels {
            email: update.email.unwrap_or(current.email),
            sms: update.sms.unwrap_or(current.sms),
            push: update.push.unwrap_or(current.push),
            in_app: update.in_app.unwrap_or(current.in_app),
        };
        tx.execute(
            "INSERT INTO notification_preferences
                 (tenant_id, user_id, notification_type, email, sms, push, in_app, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(user_id, notification_type) DO UPDATE SET
                 email = excluded.email, sms = excluded.sms, push = excluded.push,
                 in_app = excluded.in_app, updated_at = excluded.updated_at",
            params![
                tenant_id,
                user_id,
                notification_type,
                merged.email as i64,
                merged.sms as i64,
                merged.push as i64,
                merged.in_app as i64,
                now
            ],
        )?;
    }
    tx.commit()?;
    info!(tenant_id, user_id, count = updates.len(), "notification preferences updated");
    get_preferences(conn, user_id)
}

pub fn reset_preferences(conn: &Connection, user_id: &str) -> AppResult<Vec<Preference>> {
    conn.execute(
        "DELETE FROM notification_preferences WHERE user_id = ?1",
        params![user_id],
    )?;
    get_preferences(conn, user_id)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Something staff should hear about.
#[derive(Debug, Clone)]
pub struct StaffEvent {
    pub notification_type: &'static str,
    pub title: String,
    pub body: String,
    pub reference_id: Option<String>,
    target: Option<String>,
    exclude: Option<String>,
}

impl StaffEvent {
    pub fn new(notification_type: &'static str, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            notification_type,
            title: title.into(),
            body: body.into(),
            reference_id: None,
            target: None,
            exclude: None,
        }
    }

    pub fn reference(mut self, id: &str) -> Self {
        self.reference_id = Some(id.to_string());
        self
    }

    /// Deliver to one user only.
    pub fn target(mut self, user_id: &str) -> Self {
        self.target = Some(user_id.to_string());
        self
    }

    /// Skip the user who caused the event.
    pub fn excluding(mut self, user_id: Option<&str>) -> Self {
        self.exclude = user_id.map(str::to_string);
        self
    }
}

fn recipients(conn: &Connection, tenant_id: &str, event: &StaffEvent) -> AppResult<Vec<User>> {
    let users = match &event.target {
        Some(id) => match auth::get_user(conn, tenant_id, id) {
            Ok(user) if user.is_active => vec![user],
            Ok(_) | Err(AppError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        },
        None => auth::active_users(conn, tenant_id)?,
    };
    Ok(users
        .into_iter()
        .filter(|u| event.exclude.as_deref() != Some(u.id.as_str()))
        .collect())
}

/// Fan an event out to its recipients according to their preferences.
/// Returns how many users were notified on at least one channel.
pub fn dispatch(conn: &Connection, tenant_id: &str, event: &StaffEvent) -> AppResult<usize> {
    let users = recipients(conn, tenant_id, event)?;
    let mut delivered = 0;
    for user in users {
        let channels = channels_for(conn, &user.id, event.notification_type)?;
        if !channels.any() {
            continue;
        }
        let enabled = channels.enabled();
        if channels.in_app || channels.email || channels.push {
            conn.execute(
                "INSERT INTO notifications (id, tenant_id, user_id, notification_type, title, body,
                                            reference_id, channels, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    new_id("ntf"),
                    tenant_id,
                    user.id,
                    event.notification_type,
                    event.title,
                    event.body,
                    event.reference_id,
                    serde_json::to_string(&enabled)?,
                    now_rfc3339()
                ],
            )?;
        }
        if channels.sms {
            send_staff_sms(conn, tenant_id, &user, event);
        }
        delivered += 1;
    }
    debug!(tenant_id, kind = event.notification_type, delivered, "staff event dispatched");
    Ok(delivered)
}

fn send_staff_sms(conn: &Connection, tenant_id: &str, user: &User, event: &StaffEvent) {
    let country = settings::country_code(conn, tenant_id);
    let Some(phone) = user.phone.as_deref().and_then(|p| normalize_phone(p, &country)) else {
        debug!(user_id = %user.id, "no usable phone for staff SMS");
        return;
    };
    let outgoing = sms::Outgoing {
        customer_id: None,
        recipient: phone,
        body: format!("{}: {}", event.title, event.body),
        template_id: None,
        campaign_id: None,
        context: "staff",
        reference_id: event.reference_id.clone(),
    };
    if let Err(e) = sms::enqueue(conn, tenant_id, outgoing) {
        warn!(user_id = %user.id, error = %e, "staff SMS could not be queued");
    }
}

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub notification_type: String,
    pub title: String,
    pub body: String,
    pub reference_id: Option<String>,
    pub channels: Vec<String>,
    pub read: bool,
    pub read_at: Option<String>,
    pub created_at: String,
}

fn notification_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    let channels: String = row.get(5)?;
    let read_at: Option<String> = row.get(6)?;
    Ok(Notification {
        id: row.get(0)?,
        notification_type: row.get(1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        reference_id: row.get(4)?,
        channels: serde_json::from_str(&channels).unwrap_or_default(),
        read: read_at.is_some(),
        read_at,
        created_at: row.get(7)?,
    })
}

pub fn list_inbox(
    conn: &Connection,
    user_id: &str,
    unread_only: bool,
    pagination: Pagination,
) -> AppResult<Page<Notification>> {
    let unread_clause = if unread_only { " AND read_at IS NULL" } else { "" };
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM notifications WHERE user_id = ?1{unread_clause}"),
        params![user_id],
        |row| row.get(0),
    )?;
    let mut stmt = conn.prepare(&format!(
        "SELECT id, notification_type, title, body, reference_id, channels, read_at, created_at
         FROM notifications WHERE user_id = ?1{unread_clause}
         ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
    ))?;
    let items = stmt
        .query_map(
            params![user_id, pagination.page_size, pagination.offset()],
            notification_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(items, total, pagination))
}

pub fn unread_count(conn: &Connection, user_id: &str) -> AppResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND read_at IS NULL",
        params![user_id],
        |row| row.get(0),
    )?)
}

/// Mark one entry read. Marking an already read entry is a no-op.
pub fn mark_read(conn: &Connection, user_id: &str, id: &str) -> AppResult<()> {
    let found: Option<Option<String>> = conn
        .query_row(
            "SELECT read_at FROM notifications WHERE user_id = ?1 AND id = ?2",
            params![user_id, id],
            |row| row.get(0),
        )
        .optional()?;
    match found {
        None => Err(AppError::not_found("Notification")),
        Some(Some(_)) => Ok(()),
        Some(None) => {
            conn.execute(
                "UPDATE notifications SET read_at = ?1 WHERE user_id = ?2 AND id = ?3",
                params![now_rfc3339(), user_id, id],
            )?;
            Ok(())
        }
    }
}

pub fn mark_all_read(conn: &Connection, user_id: &str) -> AppResult<usize> {
    Ok(conn.execute(
        "UPDATE notifications SET read_at = ?1 WHERE user_id = ?2 AND read_at IS NULL",
        params![now_rfc3339(), user_id],
    )?)
}
