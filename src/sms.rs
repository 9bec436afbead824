//! SMS templates, rendering, segment accounting, the outbound queue and
//! campaigns.
//!
//! Templates use `{placeholder}` syntax with a fixed catalogue of names;
//! `{{` and `}}` produce literal braces. Messages are never sent inline:
//! everything goes through `sms_messages` and the delivery worker.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::customers::{self, Customer, LANGUAGES};
use crate::data_helpers::{
    check_len, clean, new_id, normalize_phone, now_rfc3339, to_rfc3339, Page, Pagination,
};
use crate::devices::{self, Device};
use crate::error::{AppError, AppResult};
use crate::notifications::{self, StaffEvent};
use crate::recipients;
use crate::settings;

pub const TRIGGER_APPOINTMENT_REMINDER: &str = "appointment_reminder";
pub const MESSAGE_STATUSES: &[&str] = &["queued", "sending", "sent", "failed"];
pub const MAX_TEMPLATE_CHARS: usize = 1000;
pub const MAX_MESSAGE_CHARS: usize = 1600;
pub const MAX_CAMPAIGN_CUSTOMERS: usize = 1000;

pub const DELIVERY_BATCH_SIZE: i64 = 20;
pub const RETRY_BACKOFF_SECS: i64 = 60;
pub const STUCK_AFTER_MINUTES: i64 = 10;

/// Placeholder names with a short description for template editors.
pub const PLACEHOLDERS: &[(&str, &str)] = &[
    ("customer_name", "Customer full name"),
    ("customer_phone", "Customer phone number"),
    ("device_type", "Device type (phone, laptop, ...)"),
    ("device_brand", "Device brand"),
    ("device_model", "Device model"),
    ("tracking_code", "Repair tracking code"),
    ("device_status", "Current repair status"),
    ("estimated_cost", "Estimated repair cost"),
    ("final_cost", "Final repair cost"),
    ("amount_due", "Cost minus deposit paid"),
    ("shop_name", "Shop name"),
    ("shop_phone", "Shop phone number"),
    ("appointment_time", "Appointment start time"),
    ("today", "Today's date"),
];

pub type Variables = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Placeholder parsing and rendering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Text(String),
    Var(String),
}

fn tokenize(body: &str) -> AppResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                text.push('{');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some('{') | None => {
                            return Err(AppError::validation("Unterminated placeholder in template"))
                        }
                        Some(ch) => name.push(ch),
                    }
                }
                let name = name.trim().to_string();
                if name.is_empty()
                    || !name.chars().all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_')
                {
                    return Err(AppError::validation(format!("Invalid placeholder {{{name}}}")));
                }
                if !text.is_empty() {
                    tokens.push(Token::Text(std::mem::take(&mut text)));
                }
                tokens.push(Token::Var(name));
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                text.push('}');
            }
            '}' => return Err(AppError::validation("Unmatched '}' in template; use '}}' for a brace")),
            other => text.push(other),
        }
    }
    if !text.is_empty() {
        tokens.push(Token::Text(text));
    }
    Ok(tokens)
}

/// Validate a template body. Returns the placeholders it uses, in order of
/// first appearance.
pub fn validate_body(body: &str) -> AppResult<Vec<String>> {
    let mut seen = Vec::new();
    for token in tokenize(body)? {
        if let Token::Var(name) = token {
            if !PLACEHOLDERS.iter().any(|(p, _)| *p == name) {
                return Err(AppError::validation(format!("Unknown placeholder {{{name}}}")));
            }
            if !seen.contains(&name) {
                seen.push(name);
            }
        }
    }
    Ok(seen)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rendered {
    pub text: String,
    pub missing: Vec<String>,
}

/// Substitute variables. Placeholders without a value render empty and are
/// listed in `missing`.
pub fn render(body: &str, vars: &Variables) -> AppResult<Rendered> {
    let mut text = String::with_capacity(body.len());
    let mut missing: Vec<String> = Vec::new();
    for token in tokenize(body)? {
        match token {
            Token::Text(t) => text.push_str(&t),
            Token::Var(name) => match vars.get(&name).filter(|v| !v.trim().is_empty()) {
                Some(value) => text.push_str(value),
                None => {
                    if !missing.contains(&name) {
                        missing.push(name);
                    }
                }
            },
        }
    }
    Ok(Rendered { text, missing })
}

// ---------------------------------------------------------------------------
// Segment accounting
// ---------------------------------------------------------------------------

const GSM_BASIC: &str = "@£$¥èéùìòÇ\nØø\rÅåΔ_ΦΓΛΩΠΨΣΘΞÆæßÉ !\"#¤%&'()*+,-./0123456789:;<=>?\
¡ABCDEFGHIJKLMNOPQRSTUVWXYZÄÖÑÜ§¿abcdefghijklmnopqrstuvwxyzäöñüà";
const GSM_EXTENSION: &str = "^{}\\[~]|€\u{0C}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentInfo {
    pub encoding: &'static str,
    /// Length in encoding units (septets or UTF-16 code units).
    pub units: usize,
    pub segments: usize,
    pub per_segment: usize,
}

pub fn segment_info(text: &str) -> SegmentInfo {
    let gsm_units = text.chars().try_fold(0usize, |acc, c| {
        if GSM_BASIC.contains(c) {
            Some(acc + 1)
        } else if GSM_EXTENSION.contains(c) {
            Some(acc + 2)
        } else {
            None
        }
    });
    let (encoding, units, single, multi) = match gsm_units {
        Some(units) => ("gsm7", units, 160, 153),
        None => ("ucs2", text.encode_utf16().count(), 70, 67),
    };
    let (segments, per_segment) = if units <= single {
        (usize::from(units > 0), single)
    } else {
        (units.div_ceil(multi), multi)
    };
    SegmentInfo {
        encoding,
        units,
        segments,
        per_segment,
    }
}

// ---------------------------------------------------------------------------
// Variables from context
// ---------------------------------------------------------------------------

fn money(amount: f64, currency: &str) -> String {
    format!("{amount:.2} {currency}")
}

fn put(vars: &mut Variables, key: &str, value: Option<String>) {
    if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
        vars.insert(key.to_string(), v);
    }
}

/// Values for the placeholder catalogue from whatever context is at hand.
pub fn context_variables(
    conn: &Connection,
    tenant_id: &str,
    customer: Option<&Customer>,
    device: Option<&Device>,
) -> Variables {
    let mut vars = Variables::new();
    put(&mut vars, "shop_name", Some(settings::get_string(conn, tenant_id, "shop", "name")));
    put(&mut vars, "shop_phone", Some(settings::get_string(conn, tenant_id, "shop", "phone")));
    put(&mut vars, "today", Some(Utc::now().format("%Y-%m-%d").to_string()));
    if let Some(c) = customer {
        put(&mut vars, "customer_name", Some(c.full_name.clone()));
        put(&mut vars, "customer_phone", Some(c.phone.clone()));
    }
    if let Some(d) = device {
        let currency = settings::get_string(conn, tenant_id, "shop", "currency");
        put(&mut vars, "device_type", Some(d.device_type.clone()));
        put(&mut vars, "device_brand", d.brand.clone());
        put(&mut vars, "device_model", d.model.clone());
        put(&mut vars, "tracking_code", Some(d.tracking_code.clone()));
        put(&mut vars, "device_status", Some(d.status.replace('_', " ")));
        put(&mut vars, "estimated_cost", d.estimated_cost.map(|v| money(v, &currency)));
        put(&mut vars, "final_cost", d.final_cost.map(|v| money(v, &currency)));
        put(&mut vars, "amount_due", d.amount_due().map(|v| money(v, &currency)));
    }
    vars
}

/// Load the customer and device named by a request. A device implies its
/// customer; naming both requires them to match.
fn load_context(
    conn: &Connection,
    tenant_id: &str,
    customer_id: Option<&str>,
    device_id: Option<&str>,
) -> AppResult<(Option<Customer>, Option<Device>)> {
    let device = device_id
        .map(|id| devices::get_device(conn, tenant_id, id))
        .transpose()?;
    let customer_id = match (customer_id, &device) {
        (Some(c), Some(d)) if c != d.customer_id => {
            return Err(AppError::validation("Device does not belong to this customer"))
        }
        (Some(c), _) => Some(c.to_string()),
        (None, Some(d)) => Some(d.customer_id.clone()),
        (None, None) => None,
    };
    let customer = customer_id
        .map(|id| customers::get_customer(conn, tenant_id, &id))
        .transpose()?;
    Ok((customer, device))
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsTemplate {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub language: String,
    pub body: String,
    pub trigger: Option<String>,
    pub is_active: bool,
    pub placeholders: Vec<String>,
    pub segments: SegmentInfo,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInput {
    pub name: String,
    pub language: String,
    pub body: String,
    #[serde(default, alias = "triggerEvent", alias = "trigger_event")]
    pub trigger: Option<String>,
    #[serde(default = "default_true", alias = "is_active")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    /// An empty string clears the trigger.
    #[serde(default, alias = "triggerEvent", alias = "trigger_event")]
    pub trigger: Option<String>,
    #[serde(default, alias = "is_active")]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateFilter {
    pub language: Option<String>,
    pub trigger: Option<String>,
    pub active_only: bool,
}

const TEMPLATE_COLUMNS: &str =
    "id, tenant_id, name, language, body, trigger_event, is_active, created_at, updated_at";

fn template_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SmsTemplate> {
    let body: String = row.get(4)?;
    Ok(SmsTemplate {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        language: row.get(3)?,
        placeholders: validate_body(&body).unwrap_or_default(),
        segments: segment_info(&body),
        body,
        trigger: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn validate_language(raw: &str) -> AppResult<String> {
    let language = raw.trim().to_lowercase();
    if LANGUAGES.contains(&language.as_str()) {
        Ok(language)
    } else {
        Err(AppError::validation(format!(
            "language must be one of {}",
            LANGUAGES.join(", ")
        )))
    }
}

fn validate_trigger(raw: Option<String>) -> AppResult<Option<String>> {
    let Some(trigger) = clean(raw).map(|t| t.to_lowercase()) else {
        return Ok(None);
    };
    if trigger == TRIGGER_APPOINTMENT_REMINDER || devices::STATUSES.contains(&trigger.as_str()) {
        Ok(Some(trigger))
    } else {
        Err(AppError::validation(format!(
            "trigger must be a device status or {TRIGGER_APPOINTMENT_REMINDER}"
        )))
    }
}

fn validate_template_body(body: &str) -> AppResult<()> {
    if body.trim().is_empty() {
        return Err(AppError::validation("body is required"));
    }
    if body.chars().count() > MAX_TEMPLATE_CHARS {
        return Err(AppError::validation(format!(
            "body must be at most {MAX_TEMPLATE_CHARS} characters"
        )));
    }
    validate_body(body).map(|_| ())
}

fn ensure_template_free(
    conn: &Connection,
    tenant_id: &str,
    name: &str,
    language: &str,
    except_id: Option<&str>,
) -> AppResult<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM sms_templates WHERE tenant_id = ?1 AND name = ?2 AND language = ?3",
            params![tenant_id, name, language],
            |row| row.get(0),
        )
        .optional()?;
    match existing {
        Some(id) if Some(id.as_str()) != except_id => Err(AppError::conflict(format!(
            "A {language} template named '{name}' already exists"
        ))),
        _ => Ok(()),
    }
}

pub fn create_template(conn: &Connection, tenant_id: &str, input: TemplateInput) -> AppResult<SmsTemplate> {
    let name = input.name.trim().to_string();
    check_len("name", &name, 1, 100)?;
    let language = validate_language(&input.language)?;
    validate_template_body(&input.body)?;
    let trigger = validate_trigger(input.trigger)?;
    ensure_template_free(conn, tenant_id, &name, &language, None)?;

    let id = new_id("tpl");
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO sms_templates (id, tenant_id, name, language, body, trigger_event, is_active,
                                    created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![id, tenant_id, name, language, input.body, trigger, input.is_active as i64, now],
    )?;
    info!(tenant_id, template_id = %id, name = %name, language = %language, "SMS template created");
    get_template(conn, tenant_id, &id)
}

pub fn get_template(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<SmsTemplate> {
    conn.query_row(
        &format!("SELECT {TEMPLATE_COLUMNS} FROM sms_templates WHERE tenant_id = ?1 AND id = ?2"),
        params![tenant_id, id],
        template_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("SMS template"))
}

pub fn list_templates(conn: &Connection, tenant_id: &str, filter: &TemplateFilter) -> AppResult<Vec<SmsTemplate>> {
    let mut sql = format!("SELECT {TEMPLATE_COLUMNS} FROM sms_templates WHERE tenant_id = ?");
    let mut args: Vec<SqlValue> = vec![tenant_id.to_string().into()];
    if let Some(language) = filter.language.as_deref().filter(|l| !l.trim().is_empty()) {
        sql.push_str(" AND language = ?");
        args.push(validate_language(language)?.into());
    }
    if let Some(trigger) = filter.trigger.as_deref().filter(|t| !t.trim().is_empty()) {
        sql.push_str(" AND trigger_event = ?");
        args.push(trigger.trim().to_lowercase().into());
    }
    if filter.active_only {
        sql.push_str(" AND is_active = 1");
    }
    sql.push_str(" ORDER BY name COLLATE NOCASE, language");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), template_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn update_template(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
    update: TemplateUpdate,
) -> AppResult<SmsTemplate> {
    let current = get_template(conn, tenant_id, id)?;
    let name = match update.name {
        Some(raw) => {
            let n = raw.trim().to_string();
            check_len("name", &n, 1, 100)?;
            n
        }
        None => current.name,
    };
    let language = match update.language {
        Some(raw) => validate_language(&raw)?,
        None => current.language,
    };
    let body = match update.body {
        Some(body) => {
            validate_template_body(&body)?;
            body
        }
        None => current.body,
    };
    let trigger = match update.trigger {
        Some(raw) => validate_trigger(Some(raw))?,
        None => current.trigger,
    };
    ensure_template_free(conn, tenant_id, &name, &language, Some(id))?;

    conn.execute(
        "UPDATE sms_templates SET name = ?1, language = ?2, body = ?3, trigger_event = ?4,
                is_active = ?5, updated_at = ?6
         WHERE tenant_id = ?7 AND id = ?8",
        params![
            name,
            language,
            body,
            trigger,
            update.is_active.unwrap_or(current.is_active) as i64,
            now_rfc3339(),
            tenant_id,
            id
        ],
    )?;
    get_template(conn, tenant_id, id)
}

pub fn delete_template(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<()> {
    let n = conn.execute(
        "DELETE FROM sms_templates WHERE tenant_id = ?1 AND id = ?2",
        params![tenant_id, id],
    )?;
    if n == 0 {
        return Err(AppError::not_found("SMS template"));
    }
    info!(tenant_id, template_id = id, "SMS template deleted");
    Ok(())
}

/// Active template for a trigger, preferring `language`, then `mixed`, then
/// any other language.
pub fn find_trigger_template(
    conn: &Connection,
    tenant_id: &str,
    trigger: &str,
    language: &str,
) -> AppResult<Option<SmsTemplate>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {TEMPLATE_COLUMNS} FROM sms_templates
                 WHERE tenant_id = ?1 AND trigger_event = ?2 AND is_active = 1
                 ORDER BY CASE WHEN language = ?3 THEN 0 WHEN language = 'mixed' THEN 1 ELSE 2 END,
                          updated_at DESC
                 LIMIT 1"
            ),
            params![tenant_id, trigger, language],
            template_from_row,
        )
        .optional()?)
}

/// The same-named active template in the customer's language, if the shop
/// keeps one; otherwise the template itself.
fn language_variant(conn: &Connection, template: &SmsTemplate, language: &str) -> AppResult<SmsTemplate> {
    if template.language == language {
        return Ok(template.clone());
    }
    let variant = conn
        .query_row(
            &format!(
                "SELECT {TEMPLATE_COLUMNS} FROM sms_templates
                 WHERE tenant_id = ?1 AND name = ?2 AND language = ?3 AND is_active = 1"
            ),
            params![template.tenant_id, template.name, language],
            template_from_row,
        )
        .optional()?;
    Ok(variant.unwrap_or_else(|| template.clone()))
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsMessage {
    pub id: String,
    pub customer_id: Option<String>,
    pub recipient: String,
    pub body: String,
    pub template_id: Option<String>,
    pub campaign_id: Option<String>,
    pub context: String,
    pub reference_id: Option<String>,
    pub status: String,
    pub encoding: String,
    pub segments: i64,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub next_attempt_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub sent_at: Option<String>,
}

const MESSAGE_COLUMNS: &str = "id, customer_id, recipient, body, template_id, campaign_id, context, \
     reference_id, status, encoding, segments, attempts, last_error, provider_message_id, \
     next_attempt_at, created_at, updated_at, sent_at";

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SmsMessage> {
    Ok(SmsMessage {
        id: row.get(0)?,
        customer_id: row.get(1)?,
        recipient: row.get(2)?,
        body: row.get(3)?,
        template_id: row.get(4)?,
        campaign_id: row.get(5)?,
        context: row.get(6)?,
        reference_id: row.get(7)?,
        status: row.get(8)?,
        encoding: row.get(9)?,
        segments: row.get(10)?,
        attempts: row.get(11)?,
        last_error: row.get(12)?,
        provider_message_id: row.get(13)?,
        next_attempt_at: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
        sent_at: row.get(17)?,
    })
}

/// A rendered message ready for the queue.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub customer_id: Option<String>,
    pub recipient: String,
    pub body: String,
    pub template_id: Option<String>,
    pub campaign_id: Option<String>,
    /// `manual`, `campaign`, `device_status`, `appointment_reminder` or `staff`.
    pub context: &'static str,
    pub reference_id: Option<String>,
}

/// Put a message on the outbound queue. Returns its id.
pub fn enqueue(conn: &Connection, tenant_id: &str, outgoing: Outgoing) -> AppResult<String> {
    if outgoing.body.trim().is_empty() {
        return Err(AppError::validation("Message body is empty"));
    }
    if outgoing.body.chars().count() > MAX_MESSAGE_CHARS {
        return Err(AppError::validation(format!(
            "Message must be at most {MAX_MESSAGE_CHARS} characters"
        )));
    }
    let info = segment_info(&outgoing.body);
    let id = new_id("sms");
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO sms_messages (id, tenant_id, customer_id, recipient, body, template_id,
                                   campaign_id, context, reference_id, status, encoding, segments,
                                   attempts, next_attempt_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'queued', ?10, ?11, 0, ?12, ?12, ?12)",
        params![
            id,
            tenant_id,
            outgoing.customer_id,
            outgoing.recipient,
            outgoing.body,
            outgoing.template_id,
            outgoing.campaign_id,
            outgoing.context,
            outgoing.reference_id,
            info.encoding,
            info.segments as i64,
            now
        ],
    )?;
    Ok(id)
}

pub fn get_message(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<SmsMessage> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM sms_messages WHERE tenant_id = ?1 AND id = ?2"),
        params![tenant_id, id],
        message_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("SMS message"))
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub status: Option<String>,
    pub customer_id: Option<String>,
    pub campaign_id: Option<String>,
    pub pagination: Pagination,
}

pub fn list_messages(conn: &Connection, tenant_id: &str, filter: &MessageFilter) -> AppResult<Page<SmsMessage>> {
    let mut clauses = vec!["tenant_id = ?".to_string()];
    let mut args: Vec<SqlValue> = vec![tenant_id.to_string().into()];
    if let Some(status) = filter.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        if !MESSAGE_STATUSES.contains(&status) {
            return Err(AppError::validation(format!(
                "status must be one of {}",
                MESSAGE_STATUSES.join(", ")
            )));
        }
        clauses.push("status = ?".into());
        args.push(status.to_string().into());
    }
    if let Some(customer_id) = filter.customer_id.as_deref().filter(|s| !s.is_empty()) {
        clauses.push("customer_id = ?".into());
        args.push(customer_id.to_string().into());
    }
    if let Some(campaign_id) = filter.campaign_id.as_deref().filter(|s| !s.is_empty()) {
        clauses.push("campaign_id = ?".into());
        args.push(campaign_id.to_string().into());
    }
    let where_sql = clauses.join(" AND ");
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM sms_messages WHERE {where_sql}"),
        params_from_iter(args.iter()),
        |row| row.get(0),
    )?;
    args.push(filter.pagination.page_size.into());
    args.push(filter.pagination.offset().into());
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM sms_messages WHERE {where_sql}
         ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?"
    ))?;
    let items = stmt
        .query_map(params_from_iter(args.iter()), message_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(items, total, filter.pagination))
}

/// Message counts per status.
pub fn queue_backlog(conn: &Connection, tenant_id: &str) -> AppResult<BTreeMap<String, i64>> {
    let mut counts: BTreeMap<String, i64> = MESSAGE_STATUSES.iter().map(|s| (s.to_string(), 0)).collect();
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM sms_messages WHERE tenant_id = ?1 GROUP BY status")?;
    let rows = stmt.query_map(params![tenant_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    for row in rows {
        let (status, count) = row?;
        counts.insert(status, count);
    }
    Ok(counts)
}

/// Most recent messages carrying a delivery error.
pub fn recent_errors(conn: &Connection, tenant_id: &str, limit: i64) -> AppResult<Vec<SmsMessage>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM sms_messages
         WHERE tenant_id = ?1 AND last_error IS NOT NULL
         ORDER BY updated_at DESC, rowid DESC LIMIT ?2"
    ))?;
    let rows = stmt.query_map(params![tenant_id, limit], message_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ---------------------------------------------------------------------------
// Preview and send
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    #[serde(default, alias = "template_id")]
    pub template_id: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default, alias = "customer_id")]
    pub customer_id: Option<String>,
    #[serde(default, alias = "device_id")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub variables: Variables,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Preview {
    pub text: String,
    pub missing: Vec<String>,
    pub placeholders: Vec<String>,
    #[serde(flatten)]
    pub segments: SegmentInfo,
}

/// Template (or ad-hoc body) and variables for a preview or send.
struct Prepared {
    template: Option<SmsTemplate>,
    customer: Option<Customer>,
    body: String,
    vars: Variables,
}

fn prepare(
    conn: &Connection,
    tenant_id: &str,
    template_id: Option<&str>,
    body: Option<String>,
    customer_id: Option<&str>,
    device_id: Option<&str>,
    overrides: Variables,
) -> AppResult<Prepared> {
    let (customer, device) = load_context(conn, tenant_id, customer_id, device_id)?;
    let template = match (template_id, clean(body.clone())) {
        (Some(id), None) => {
            let template = get_template(conn, tenant_id, id)?;
            Some(match &customer {
                Some(c) => language_variant(conn, &template, &c.preferred_language)?,
                None => template,
            })
        }
        (None, Some(_)) => None,
        _ => return Err(AppError::validation("Provide either templateId or body")),
    };
    let body = match &template {
        Some(t) => t.body.clone(),
        None => body.unwrap_or_default(),
    };
    validate_template_body(&body)?;
    let mut vars = context_variables(conn, tenant_id, customer.as_ref(), device.as_ref());
    vars.extend(overrides.into_iter().filter(|(_, v)| !v.trim().is_empty()));
    Ok(Prepared {
        template,
        customer,
        body,
        vars,
    })
}

pub fn preview(conn: &Connection, tenant_id: &str, request: PreviewRequest) -> AppResult<Preview> {
    let prepared = prepare(
        conn,
        tenant_id,
        request.template_id.as_deref(),
        request.body,
        request.customer_id.as_deref(),
        request.device_id.as_deref(),
        request.variables,
    )?;
    let rendered = render(&prepared.body, &prepared.vars)?;
    Ok(Preview {
        segments: segment_info(&rendered.text),
        placeholders: validate_body(&prepared.body)?,
        text: rendered.text,
        missing: rendered.missing,
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(default, alias = "customer_id")]
    pub customer_id: Option<String>,
    #[serde(default, alias = "to")]
    pub phone: Option<String>,
    #[serde(default, alias = "device_id")]
    pub device_id: Option<String>,
    #[serde(default, alias = "template_id")]
    pub template_id: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub variables: Variables,
}

fn refuse_missing(missing: &[String]) -> AppResult<()> {
    if missing.is_empty() {
        Ok(())
    } else {
        Err(AppError::validation(format!(
            "Message is missing values for: {}",
            missing.join(", ")
        )))
    }
}

/// Queue one message to a customer or a raw phone number.
pub fn send_message(conn: &Connection, tenant_id: &str, request: SendRequest) -> AppResult<SmsMessage> {
    let raw_phone = clean(request.phone);
    if request.customer_id.is_some() == raw_phone.is_some() && request.device_id.is_none() {
        return Err(AppError::validation("Provide either customerId or phone"));
    }
    let prepared = prepare(
        conn,
        tenant_id,
        request.template_id.as_deref(),
        request.body,
        request.customer_id.as_deref(),
        request.device_id.as_deref(),
        request.variables,
    )?;
    if let Some(t) = &prepared.template {
        if !t.is_active {
            return Err(AppError::validation(format!("Template '{}' is inactive", t.name)));
        }
    }
    let rendered = render(&prepared.body, &prepared.vars)?;
    refuse_missing(&rendered.missing)?;

    let recipient = match (&raw_phone, &prepared.customer) {
        (Some(phone), _) => normalize_phone(phone, &settings::country_code(conn, tenant_id))
            .ok_or_else(|| AppError::validation("phone is not a valid number"))?,
        (None, Some(c)) => c.phone.clone(),
        (None, None) => return Err(AppError::validation("Provide either customerId or phone")),
    };
    let id = enqueue(
        conn,
        tenant_id,
        Outgoing {
            customer_id: prepared.customer.as_ref().map(|c| c.id.clone()),
            recipient,
            body: rendered.text,
            template_id: prepared.template.as_ref().map(|t| t.id.clone()),
            campaign_id: None,
            context: "manual",
            reference_id: clean(request.device_id),
        },
    )?;
    info!(tenant_id, message_id = %id, "SMS queued");
    get_message(conn, tenant_id, &id)
}

/// Queue the message for a trigger, if the shop has a template for it.
#[allow(clippy::too_many_arguments)]
pub(crate) fn send_triggered(
    conn: &Connection,
    tenant_id: &str,
    trigger: &str,
    customer: &Customer,
    device: Option<&Device>,
    extra: Variables,
    context: &'static str,
    reference_id: &str,
) -> AppResult<Option<String>> {
    let Some(template) = find_trigger_template(conn, tenant_id, trigger, &customer.preferred_language)? else {
        return Ok(None);
    };
    let mut vars = context_variables(conn, tenant_id, Some(customer), device);
    vars.extend(extra);
    let rendered = render(&template.body, &vars)?;
    if !rendered.missing.is_empty() {
        return Err(AppError::validation(format!(
            "Template '{}' is missing values for: {}",
            template.name,
            rendered.missing.join(", ")
        )));
    }
    let id = enqueue(
        conn,
        tenant_id,
        Outgoing {
            customer_id: Some(customer.id.clone()),
            recipient: customer.phone.clone(),
            body: rendered.text,
            template_id: Some(template.id),
            campaign_id: None,
            context,
            reference_id: Some(reference_id.to_string()),
        },
    )?;
    Ok(Some(id))
}

/// Status-change SMS for a device's customer. `Ok(None)` when no template
/// is set up for the status.
pub fn notify_customer_for_device(
    conn: &Connection,
    tenant_id: &str,
    device: &Device,
    status: &str,
) -> AppResult<Option<String>> {
    let customer = customers::get_customer(conn, tenant_id, &device.customer_id)?;
    send_triggered(
        conn,
        tenant_id,
        status,
        &customer,
        Some(device),
        Variables::new(),
        "device_status",
        &device.id,
    )
}

// ---------------------------------------------------------------------------
// Campaigns
// ---------------------------------------------------------------------------

pub const TARGET_TYPES: &[&str] = &["category", "group", "customers"];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignRequest {
    pub name: String,
    #[serde(alias = "template_id")]
    pub template_id: String,
    #[serde(alias = "target_type", alias = "target")]
    pub target_type: String,
    #[serde(default, alias = "target_id")]
    pub target_id: Option<String>,
    #[serde(default, alias = "customer_ids")]
    pub customer_ids: Vec<String>,
    #[serde(default)]
    pub variables: Variables,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub template_id: Option<String>,
    pub target_type: String,
    pub target_id: Option<String>,
    pub total_recipients: i64,
    pub queued_count: i64,
    pub skipped_count: i64,
    pub created_by: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedRecipient {
    pub customer_id: String,
    pub customer_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignResult {
    pub campaign: Campaign,
    pub skipped: Vec<SkippedRecipient>,
}

const CAMPAIGN_COLUMNS: &str = "id, name, template_id, target_type, target_id, total_recipients, \
     queued_count, skipped_count, created_by, created_at";

fn campaign_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Campaign> {
    Ok(Campaign {
        id: row.get(0)?,
        name: row.get(1)?,
        template_id: row.get(2)?,
        target_type: row.get(3)?,
        target_id: row.get(4)?,
        total_recipients: row.get(5)?,
        queued_count: row.get(6)?,
        skipped_count: row.get(7)?,
        created_by: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn campaign_recipients(
    conn: &Connection,
    tenant_id: &str,
    request: &CampaignRequest,
) -> AppResult<(String, Option<String>, Vec<Customer>)> {
    let target_type = request.target_type.trim().to_lowercase();
    let target_id = clean(request.target_id.clone());
    let customers = match target_type.as_str() {
        "category" => {
            let id = target_id.as_deref().ok_or_else(|| AppError::validation("targetId is required"))?;
            recipients::resolve_category(conn, tenant_id, id, None)?.items
        }
        "group" => {
            let id = target_id.as_deref().ok_or_else(|| AppError::validation("targetId is required"))?;
            recipients::list_members(conn, tenant_id, id, None)?.items
        }
        "customers" => {
            if request.customer_ids.len() > MAX_CAMPAIGN_CUSTOMERS {
                return Err(AppError::validation(format!(
                    "At most {MAX_CAMPAIGN_CUSTOMERS} customers per campaign"
                )));
            }
            let mut seen = HashSet::new();
            let mut list = Vec::new();
            for id in request.customer_ids.iter().map(|s| s.trim()) {
                if !seen.insert(id.to_string()) {
                    continue;
                }
                match customers::get_customer(conn, tenant_id, id) {
                    Ok(c) => list.push(c),
                    Err(AppError::NotFound(_)) => {
                        return Err(AppError::validation(format!("Unknown customer {id}")))
                    }
                    Err(e) => return Err(e),
                }
            }
            list
        }
        _ => {
            return Err(AppError::validation(format!(
                "targetType must be one of {}",
                TARGET_TYPES.join(", ")
            )))
        }
    };
    let target_id = if target_type == "customers" { None } else { target_id };
    Ok((target_type, target_id, customers))
}

/// Render a template for every recipient of a target and queue the results.
/// Recipients without a phone or with missing values are skipped.
pub fn create_campaign(
    conn: &Connection,
    tenant_id: &str,
    request: CampaignRequest,
    actor: Option<&str>,
) -> AppResult<CampaignResult> {
    let name = request.name.trim().to_string();
    check_len("name", &name, 1, 100)?;
    let template = get_template(conn, tenant_id, request.template_id.trim())?;
    if !template.is_active {
        return Err(AppError::validation(format!("Template '{}' is inactive", template.name)));
    }
    let (target_type, target_id, recipients) = campaign_recipients(conn, tenant_id, &request)?;
    if recipients.is_empty() {
        return Err(AppError::validation("Campaign has no recipients"));
    }

    let tx = conn.unchecked_transaction()?;
    let campaign_id = new_id("camp");
    let now = now_rfc3339();
    tx.execute(
        "INSERT INTO sms_campaigns (id, tenant_id, name, template_id, target_type, target_id,
                                    total_recipients, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            campaign_id,
            tenant_id,
            name,
            template.id,
            target_type,
            target_id,
            recipients.len() as i64,
            actor,
            now
        ],
    )?;

    let mut skipped = Vec::new();
    let mut queued = 0i64;
    for customer in &recipients {
        let skip = |reason: String| SkippedRecipient {
            customer_id: customer.id.clone(),
            customer_name: customer.full_name.clone(),
            reason,
        };
        if customer.phone.trim().is_empty() {
            skipped.push(skip("no phone number".into()));
            continue;
        }
        let variant = language_variant(&tx, &template, &customer.preferred_language)?;
        let mut vars = context_variables(&tx, tenant_id, Some(customer), None);
        vars.extend(request.variables.clone());
        let rendered = render(&variant.body, &vars)?;
        if !rendered.missing.is_empty() {
            skipped.push(skip(format!("missing {}", rendered.missing.join(", "))));
            continue;
        }
        enqueue(
            &tx,
            tenant_id,
            Outgoing {
                customer_id: Some(customer.id.clone()),
                recipient: customer.phone.clone(),
                body: rendered.text,
                template_id: Some(variant.id),
                campaign_id: Some(campaign_id.clone()),
                context: "campaign",
                reference_id: None,
            },
        )?;
        queued += 1;
    }
    tx.execute(
        "UPDATE sms_campaigns SET queued_count = ?1, skipped_count = ?2 WHERE id = ?3",
        params![queued, skipped.len() as i64, campaign_id],
    )?;
    tx.commit()?;

    info!(tenant_id, campaign_id = %campaign_id, queued, skipped = skipped.len(), "SMS campaign queued");
    Ok(CampaignResult {
        campaign: get_campaign(conn, tenant_id, &campaign_id)?,
        skipped,
    })
}

pub fn get_campaign(conn: &Connection, tenant_id: &str, id: &str) -> AppResult<Campaign> {
    conn.query_row(
        &format!("SELECT {CAMPAIGN_COLUMNS} FROM sms_campaigns WHERE tenant_id = ?1 AND id = ?2"),
        params![tenant_id, id],
        campaign_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("Campaign"))
}

pub fn list_campaigns(conn: &Connection, tenant_id: &str, pagination: Pagination) -> AppResult<Page<Campaign>> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sms_campaigns WHERE tenant_id = ?1",
        params![tenant_id],
        |row| row.get(0),
    )?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM sms_campaigns WHERE tenant_id = ?1
         ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
    ))?;
    let items = stmt
        .query_map(
            params![tenant_id, pagination.page_size, pagination.offset()],
            campaign_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(items, total, pagination))
}

// ---------------------------------------------------------------------------
// Delivery (driven by the background worker)
// ---------------------------------------------------------------------------

/// A claimed message. `attempts` already counts the current try.
#[derive(Debug, Clone)]
pub struct DueMessage {
    pub id: String,
    pub tenant_id: String,
    pub recipient: String,
    pub body: String,
    pub attempts: i64,
    pub sender_id: Option<String>,
}

/// Put messages left in `sending` by a crashed or stalled worker back on
/// the queue.
pub fn recover_stuck(conn: &Connection, now: DateTime<Utc>) -> AppResult<usize> {
    let cutoff = to_rfc3339(now - Duration::minutes(STUCK_AFTER_MINUTES));
    let n = conn.execute(
        "UPDATE sms_messages SET status = 'queued', next_attempt_at = ?1, updated_at = ?1
         WHERE status = 'sending' AND updated_at <= ?2",
        params![to_rfc3339(now), cutoff],
    )?;
    if n > 0 {
        warn!(count = n, "re-queued stuck SMS messages");
    }
    Ok(n)
}

/// Claim up to `limit` due messages across all tenants and mark them
/// `sending`.
pub fn claim_due(conn: &Connection, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<DueMessage>> {
    let now = to_rfc3339(now);
    let tx = conn.unchecked_transaction()?;
    let claimed = {
        let mut stmt = tx.prepare(
            "SELECT m.id, m.tenant_id, m.recipient, m.body, m.attempts,
                    (SELECT s.setting_value FROM tenant_settings s
                     WHERE s.tenant_id = m.tenant_id AND s.setting_category = 'sms'
                       AND s.setting_key = 'sender_id')
             FROM sms_messages m
             WHERE m.status = 'queued' AND (m.next_attempt_at IS NULL OR m.next_attempt_at <= ?1)
             ORDER BY m.created_at, m.rowid
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now, limit], |row| {
            Ok(DueMessage {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                recipient: row.get(2)?,
                body: row.get(3)?,
                attempts: row.get::<_, i64>(4)? + 1,
                sender_id: row.get::<_, Option<String>>(5)?.filter(|s| !s.trim().is_empty()),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    for msg in &claimed {
        tx.execute(
            "UPDATE sms_messages SET status = 'sending', attempts = ?1, updated_at = ?2 WHERE id = ?3",
            params![msg.attempts, now, msg.id],
        )?;
    }
    tx.commit()?;
    Ok(claimed)
}

pub fn mark_sent(conn: &Connection, id: &str, provider_message_id: &str, now: DateTime<Utc>) -> AppResult<()> {
    let now = to_rfc3339(now);
    conn.execute(
        "UPDATE sms_messages SET status = 'sent', provider_message_id = ?1, last_error = NULL,
                next_attempt_at = NULL, sent_at = ?2, updated_at = ?2
         WHERE id = ?3",
        params![provider_message_id, now, id],
    )?;
    Ok(())
}

/// Record a failed attempt: retry later with back-off, or give up once
/// `max_attempts` is reached. Returns true when the message is now failed.
pub fn record_failure(
    conn: &Connection,
    msg: &DueMessage,
    error: &str,
    max_attempts: i64,
    now: DateTime<Utc>,
) -> AppResult<bool> {
    let now_str = to_rfc3339(now);
    if msg.attempts >= max_attempts {
        conn.execute(
            "UPDATE sms_messages SET status = 'failed', last_error = ?1, next_attempt_at = NULL,
                    updated_at = ?2
             WHERE id = ?3",
            params![error, now_str, msg.id],
        )?;
        warn!(message_id = %msg.id, attempts = msg.attempts, error, "SMS delivery failed permanently");
        let event = StaffEvent::new(
            notifications::SMS_FAILED,
            format!("SMS to {} failed", msg.recipient),
            format!("Gave up after {} attempts: {error}", msg.attempts),
        )
        .reference(&msg.id);
        if let Err(e) = notifications::dispatch(conn, &msg.tenant_id, &event) {
            warn!(message_id = %msg.id, error = %e, "sms_failed notification failed");
        }
        return Ok(true);
    }
    let next = to_rfc3339(now + Duration::seconds(msg.attempts * RETRY_BACKOFF_SECS));
    conn.execute(
        "UPDATE sms_messages SET status = 'queued', last_error = ?1, next_attempt_at = ?2,
                updated_at = ?3
         WHERE id = ?4",
        params![error, next, now_str, msg.id],
    )?;
    info!(message_id = %msg.id, attempts = msg.attempts, next_attempt_at = %next, "SMS delivery will be retried");
    Ok(false)
}
