use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

pub(crate) const DEFAULT_PAGE_SIZE: i64 = 20;
pub(crate) const MAX_PAGE_SIZE: i64 = 100;
/// Largest page whose offset still fits in an i64 at any page size.
pub(crate) const MAX_PAGE: i64 = i64::MAX / MAX_PAGE_SIZE;

/// Prefixed random identifier, e.g. `cust-8b1f…`.
pub(crate) fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

pub(crate) fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn now_rfc3339() -> String {
    to_rfc3339(Utc::now())
}

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Trim an optional string, treating blank as absent.
pub(crate) fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn check_len(field: &str, value: &str, min: usize, max: usize) -> AppResult<()> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(AppError::validation(if min <= 1 {
            format!("{field} must be at most {max} characters")
        } else {
            format!("{field} must be between {min} and {max} characters")
        }));
    }
    Ok(())
}

pub(crate) fn check_non_negative(field: &str, value: Option<f64>) -> AppResult<()> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(AppError::validation(format!(
            "{field} must be zero or greater"
        ))),
        _ => Ok(()),
    }
}

/// Normalize a phone number to `+<digits>`.
///
/// A leading `00` is an international prefix; a national number starting
/// with `0` (10 digits) or a bare 9-digit subscriber number gets the
/// tenant country code.
pub(crate) fn normalize_phone(value: &str, country_code: &str) -> Option<String> {
    let mut digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    if let Some(rest) = digits.strip_prefix("00") {
        digits = rest.to_string();
    } else if digits.len() == 10 && digits.starts_with('0') {
        digits = format!("{country_code}{}", &digits[1..]);
    } else if digits.len() == 9 && !value.trim_start().starts_with('+') {
        digits = format!("{country_code}{digits}");
    }
    if (10..=15).contains(&digits.len()) {
        Some(format!("+{digits}"))
    } else {
        None
    }
}

pub(crate) fn is_valid_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !value.chars().any(char::is_whitespace)
        && value.len() <= 254
}

/// Accepts RFC 3339 or a naive `YYYY-MM-DDTHH:MM[:SS]`, read as UTC.
pub(crate) fn parse_timestamp(field: &str, raw: &str) -> AppResult<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(AppError::validation(format!(
        "{field} must be an RFC 3339 timestamp or YYYY-MM-DDTHH:MM"
    )))
}

pub(crate) fn parse_date(field: &str, raw: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::validation(format!("{field} must be a date (YYYY-MM-DD)")))
}

/// A `from`/`to` bound: a timestamp, or a date meaning the start of that
/// day (`from`) or the start of the next day (`to`).
pub(crate) fn range_bound(field: &str, raw: &str, upper: bool) -> AppResult<String> {
    if let Ok(ts) = parse_timestamp(field, raw) {
        return Ok(to_rfc3339(ts));
    }
    let date = parse_date(field, raw)?;
    let date = if upper { date + chrono::Duration::days(1) } else { date };
    Ok(to_rfc3339(date.and_time(NaiveTime::MIN).and_utc()))
}

/// Page/pageSize query parameters after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: i64,
    pub page_size: i64,
}

impl Pagination {
    pub fn new(page: Option<i64>, page_size: Option<i64>) -> AppResult<Self> {
        let page = page.unwrap_or(1);
        let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page < 1 {
            return Err(AppError::validation("page must be at least 1"));
        }
        if page > MAX_PAGE {
            return Err(AppError::validation(format!("page must be at most {MAX_PAGE}")));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(AppError::validation(format!(
                "pageSize must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok(Self { page, page_size })
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.page_size
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, pagination: Pagination) -> Self {
        Self {
            items,
            total,
            page: pagination.page,
            page_size: pagination.page_size,
        }
    }
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
pub(crate) fn like_pattern(term: &str) -> String {
    let mut out = String::with_capacity(term.len() + 2);
    out.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_phone_handles_local_forms() {
        assert_eq!(
            normalize_phone("0911 23 45 67", "251"),
            Some("+251911234567".into())
        );
        assert_eq!(normalize_phone("911234567", "251"), Some("+251911234567".into()));
        assert_eq!(
            normalize_phone("+251-911-234-567", "251"),
            Some("+251911234567".into())
        );
        assert_eq!(
            normalize_phone("00251911234567", "251"),
            Some("+251911234567".into())
        );
        assert_eq!(normalize_phone("12345", "251"), None);
        assert_eq!(normalize_phone("", "251"), None);
    }

    #[test]
    fn email_validation() {
        assert!(is_valid_email("abebe@example.com"));
        assert!(!is_valid_email("abebe@example"));
        assert!(!is_valid_email("abebe example.com"));
        assert!(!is_valid_email("@example.com"));
    }

    #[test]
    fn timestamps_accept_naive_and_offset_forms() {
        let a = parse_timestamp("startsAt", "2026-03-01T09:30").unwrap();
        let b = parse_timestamp("startsAt", "2026-03-01T12:30:00+03:00").unwrap();
        assert_eq!(a, b);
        assert!(parse_timestamp("startsAt", "tomorrow").is_err());
    }

    #[test]
    fn range_bounds_widen_dates_to_whole_days() {
        assert_eq!(range_bound("from", "2026-03-01", false).unwrap(), "2026-03-01T00:00:00Z");
        assert_eq!(range_bound("to", "2026-03-01", true).unwrap(), "2026-03-02T00:00:00Z");
        assert_eq!(range_bound("to", "2026-03-01T10:00", true).unwrap(), "2026-03-01T10:00:00Z");
        assert!(range_bound("to", "March", true).is_err());
    }

    #[test]
    fn pagination_bounds() {
        assert_eq!(Pagination::new(None, None).unwrap(), Pagination::default());
        assert_eq!(Pagination::new(Some(3), Some(10)).unwrap().offset(), 20);
        assert!(Pagination::new(Some(0), None).is_err());
        assert!(Pagination::new(None, Some(101)).is_err());
    }

    #[test]
    fn huge_page_is_rejected_instead_of_overflowing() {
        assert!(matches!(
            Pagination::new(Some(i64::MAX), Some(20)),
            Err(AppError::Validation(_))
        ));
        let last = Pagination::new(Some(MAX_PAGE), Some(MAX_PAGE_SIZE)).unwrap();
        assert_eq!(last.offset(), (MAX_PAGE - 1) * MAX_PAGE_SIZE);
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }

    #[test]
    fn value_str_reads_first_non_blank_key() {
        let v = serde_json::json!({ "name": "  " , "title": "Screen" });
        assert_eq!(value_str(&v, &["name", "title"]), Some("Screen".into()));
        assert_eq!(value_str(&v, &["missing"]), None);
    }
}
