//! Dashboard aggregations: zero-filled time series, categorical breakdowns
//! and headline KPIs over a date range.
//!
//! When a tenant enables `analytics.demo_fallback`, any series or breakdown
//! with no underlying rows is replaced by deterministic synthetic values
//! (seeded from an MD5 of tenant, section and bucket) and marked
//! `"source": "demo"`, so fresh shops see a populated dashboard.

use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::{json, Value};

use crate::data_helpers::{parse_date, to_rfc3339};
use crate::error::{AppError, AppResult};
use crate::settings;

pub const DEFAULT_RANGE_DAYS: i64 = 30;
pub const MAX_RANGE_DAYS: i64 = 366;
pub const SECTIONS: &[&str] = &["kpis", "series", "devices", "technicians", "feedback", "sales"];
const TOP_PARTS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_lowercase().as_str() {
            "day" | "daily" => Ok(Self::Day),
            "week" | "weekly" => Ok(Self::Week),
            "month" | "monthly" => Ok(Self::Month),
            _ => Err(AppError::validation("granularity must be day, week or month")),
        }
    }

    /// First day of the bucket containing `date`. Weeks start on Monday.
    fn bucket_start(self, date: NaiveDate) -> NaiveDate {
        match self {
            Self::Day => date,
            Self::Week => date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
            Self::Month => date.with_day(1).unwrap_or(date),
        }
    }

    fn next(self, bucket: NaiveDate) -> NaiveDate {
        match self {
            Self::Day => bucket + Duration::days(1),
            Self::Week => bucket + Duration::days(7),
            Self::Month => {
                let (y, m) = if bucket.month() == 12 {
                    (bucket.year() + 1, 1)
                } else {
                    (bucket.year(), bucket.month() + 1)
                };
                NaiveDate::from_ymd_opt(y, m, 1).unwrap_or(bucket + Duration::days(31))
            }
        }
    }

    /// SQLite expression mapping a timestamp column to its bucket date.
    fn sql(self, column: &str) -> String {
        match self {
            Self::Day => format!("date({column})"),
            Self::Week => format!("date({column}, '-6 days', 'weekday 1')"),
            Self::Month => format!("strftime('%Y-%m-01', {column})"),
        }
    }

    /// Rough bucket length in days, used to scale demo values.
    fn days(self) -> u32 {
        match self {
            Self::Day => 1,
            Self::Week => 7,
            Self::Month => 30,
        }
    }
}

/// A validated reporting window, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub granularity: Granularity,
}

impl Range {
    pub fn parse(
        from: Option<&str>,
        to: Option<&str>,
        granularity: Option<&str>,
        today: NaiveDate,
    ) -> AppResult<Self> {
        fn present(v: Option<&str>) -> Option<&str> {
            v.map(str::trim).filter(|s| !s.is_empty())
        }
        let to = match present(to) {
            Some(raw) => parse_date("to", raw)?,
            None => today,
        };
        let from = match present(from) {
            Some(raw) => parse_date("from", raw)?,
            None => to - Duration::days(DEFAULT_RANGE_DAYS - 1),
        };
        if to < from {
            return Err(AppError::validation("to must not be before from"));
        }
        if (to - from).num_days() + 1 > MAX_RANGE_DAYS {
            return Err(AppError::validation(format!(
                "The range can span at most {MAX_RANGE_DAYS} days"
            )));
        }
        let granularity = match present(granularity) {
            Some(raw) => Granularity::parse(raw)?,
            None => Granularity::Day,
        };
        Ok(Self { from, to, granularity })
    }

    pub fn buckets(&self) -> Vec<NaiveDate> {
        let mut out = Vec::new();
        let mut bucket = self.granularity.bucket_start(self.from);
        while bucket <= self.to {
            out.push(bucket);
            bucket = self.granularity.next(bucket);
        }
        out
    }

    /// `[start, end)` as RFC 3339 strings for comparisons against stored
    /// timestamps.
    fn bounds(&self) -> (String, String) {
        let start = self.from.and_time(NaiveTime::MIN).and_utc();
        let end = (self.to + Duration::days(1)).and_time(NaiveTime::MIN).and_utc();
        (to_rfc3339(start), to_rfc3339(end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Live,
    Demo,
}

#[derive(Debug, Clone, Serialize)]
pub struct Point {
    pub bucket: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Series {
    pub name: &'static str,
    pub source: Source,
    pub points: Vec<Point>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Slice {
    pub label: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Breakdown<T> {
    pub source: Source,
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TechnicianStats {
    pub technician_id: Option<String>,
    pub name: String,
    pub assigned: i64,
    pub delivered: i64,
    pub average_turnaround_hours: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Kpis {
    pub devices_registered: i64,
    pub devices_delivered: i64,
    pub open_devices: i64,
    pub average_turnaround_hours: Option<f64>,
    pub revenue: f64,
    pub average_rating: Option<f64>,
    pub repeat_customer_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeInfo {
    pub from: String,
    pub to: String,
    pub granularity: Granularity,
    pub buckets: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub range: RangeInfo,
    pub kpis: Kpis,
    pub series: Vec<Series>,
    pub devices_by_type: Breakdown<Slice>,
    pub devices_by_status: Breakdown<Slice>,
    pub devices_by_location: Breakdown<Slice>,
    pub technicians: Breakdown<TechnicianStats>,
    pub rating_distribution: Breakdown<Slice>,
    pub sales_by_payment_method: Breakdown<Slice>,
    pub top_parts: Breakdown<Slice>,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Demo values
// ---------------------------------------------------------------------------

struct Demo<'a> {
    enabled: bool,
    tenant_id: &'a str,
}

impl Demo<'_> {
    /// Stable pseudo-random integer in `lo..=hi`.
    fn value(&self, key: &str, bucket: &str, lo: u32, hi: u32) -> u32 {
        let digest = md5::compute(format!("{}:{key}:{bucket}", self.tenant_id));
        let n = u32::from_be_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]]);
        lo + n % (hi - lo + 1)
    }

    fn slices(&self, key: &str, labels: &[&str], lo: u32, hi: u32) -> Vec<Slice> {
        labels
            .iter()
            .map(|label| Slice {
                label: label.to_string(),
                value: f64::from(self.value(key, label, lo, hi)),
                count: None,
            })
            .collect()
    }
}

fn breakdown<T>(demo: &Demo<'_>, live: Vec<T>, synth: impl FnOnce() -> Vec<T>) -> Breakdown<T> {
    if live.is_empty() && demo.enabled {
        Breakdown {
            source: Source::Demo,
            items: synth(),
        }
    } else {
        Breakdown {
            source: Source::Live,
            items: live,
        }
    }
}

// ---------------------------------------------------------------------------
// Series
// ---------------------------------------------------------------------------

/// `agg` grouped by bucket over `table.column` within the range.
fn grouped(
    conn: &Connection,
    tenant_id: &str,
    range: &Range,
    table: &str,
    column: &str,
    agg: &str,
    extra: &str,
) -> AppResult<BTreeMap<String, f64>> {
    let (start, end) = range.bounds();
    let bucket = range.granularity.sql(column);
    let mut stmt = conn.prepare(&format!(
        "SELECT {bucket} AS b, {agg} FROM {table}
         WHERE tenant_id = ?1 AND {column} >= ?2 AND {column} < ?3 {extra}
         GROUP BY b"
    ))?;
    let rows = stmt.query_map(params![tenant_id, start, end], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
    })?;
    Ok(rows.collect::<Result<BTreeMap<_, _>, _>>()?)
}

struct SeriesDef {
    name: &'static str,
    table: &'static str,
    column: &'static str,
    agg: &'static str,
    extra: &'static str,
    /// Empty buckets are `null` rather than zero.
    sparse: bool,
    /// Per-day demo range.
    demo: (u32, u32),
}

const SERIES: &[SeriesDef] = &[
    SeriesDef {
        name: "devicesRegistered",
        table: "devices",
        column: "created_at",
        agg: "COUNT(*)",
        extra: "",
        sparse: false,
        demo: (1, 12),
    },
    SeriesDef {
        name: "devicesDelivered",
        table: "device_status_history",
        column: "changed_at",
        agg: "COUNT(*)",
        extra: "AND to_status = 'delivered'",
        sparse: false,
        demo: (0, 10),
    },
    SeriesDef {
        name: "revenue",
        table: "sales",
        column: "created_at",
        agg: "SUM(amount)",
        extra: "",
        sparse: false,
        demo: (500, 6000),
    },
    SeriesDef {
        name: "averageRating",
        table: "feedback",
        column: "created_at",
        agg: "AVG(rating)",
        extra: "",
        sparse: true,
        demo: (30, 50),
    },
];

fn build_series(conn: &Connection, tenant_id: &str, range: &Range, demo: &Demo<'_>, def: &SeriesDef) -> AppResult<Series> {
    let rows = grouped(conn, tenant_id, range, def.table, def.column, def.agg, def.extra)?;
    let buckets = range.buckets();
    if rows.is_empty() && demo.enabled {
        let points = buckets
            .iter()
            .map(|b| {
                let label = b.to_string();
                let value = if def.sparse {
                    // Ratings stay per-review, scaled to one decimal.
                    f64::from(demo.value(def.name, &label, def.demo.0, def.demo.1)) / 10.0
                } else {
                    let days = range.granularity.days();
                    f64::from(demo.value(def.name, &label, def.demo.0 * days, def.demo.1 * days))
                };
                Point {
                    bucket: label,
                    value: Some(value),
                }
            })
            .collect();
        return Ok(Series {
            name: def.name,
            source: Source::Demo,
            points,
        });
    }
    let points = buckets
        .iter()
        .map(|b| {
            let label = b.to_string();
            let value = match rows.get(&label) {
                Some(v) => Some(round2(*v)),
                None if def.sparse => None,
                None => Some(0.0),
            };
            Point { bucket: label, value }
        })
        .collect();
    Ok(Series {
        name: def.name,
        source: Source::Live,
        points,
    })
}

pub fn series(conn: &Connection, tenant_id: &str, range: &Range) -> AppResult<Vec<Series>> {
    let demo = demo_for(conn, tenant_id);
    SERIES
        .iter()
        .map(|def| build_series(conn, tenant_id, range, &demo, def))
        .collect()
}

fn demo_for<'a>(conn: &Connection, tenant_id: &'a str) -> Demo<'a> {
    Demo {
        enabled: settings::demo_fallback(conn, tenant_id),
        tenant_id,
    }
}

// ---------------------------------------------------------------------------
// Breakdowns
// ---------------------------------------------------------------------------

fn slices(conn: &Connection, sql: &str, tenant_id: &str, range: &Range) -> AppResult<Vec<Slice>> {
    let (start, end) = range.bounds();
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![tenant_id, start, end], |row| {
        Ok(Slice {
            label: row.get(0)?,
            value: round2(row.get(1)?),
            count: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn devices_by_type(conn: &Connection, tenant_id: &str, range: &Range) -> AppResult<Breakdown<Slice>> {
    let live = slices(
        conn,
        "SELECT device_type, COUNT(*), NULL FROM devices
         WHERE tenant_id = ?1 AND created_at >= ?2 AND created_at < ?3
         GROUP BY device_type ORDER BY COUNT(*) DESC, device_type",
        tenant_id,
        range,
    )?;
    let demo = demo_for(conn, tenant_id);
    Ok(breakdown(&demo, live, || {
        demo.slices("devicesByType", &["phone", "laptop", "tablet", "desktop"], 2, 40)
    }))
}

pub fn devices_by_status(conn: &Connection, tenant_id: &str, range: &Range) -> AppResult<Breakdown<Slice>> {
    let live = slices(
        conn,
        "SELECT status, COUNT(*), NULL FROM devices
         WHERE tenant_id = ?1 AND created_at >= ?2 AND created_at < ?3
         GROUP BY status ORDER BY COUNT(*) DESC, status",
        tenant_id,
        range,
    )?;
    let demo = demo_for(conn, tenant_id);
    Ok(breakdown(&demo, live, || {
        demo.slices(
            "devicesByStatus",
            &["registered", "in_progress", "ready_for_pickup", "delivered"],
            1,
            25,
        )
    }))
}

pub fn devices_by_location(conn: &Connection, tenant_id: &str, range: &Range) -> AppResult<Breakdown<Slice>> {
    let live = slices(
        conn,
        "SELECT COALESCE(NULLIF(TRIM(location), ''), 'Unspecified') AS loc, COUNT(*), NULL FROM devices
         WHERE tenant_id = ?1 AND created_at >= ?2 AND created_at < ?3
         GROUP BY loc ORDER BY COUNT(*) DESC, loc",
        tenant_id,
        range,
    )?;
    let demo = demo_for(conn, tenant_id);
    Ok(breakdown(&demo, live, || {
        demo.slices("devicesByLocation", &["Front desk", "Workbench", "Storage"], 1, 30)
    }))
}

pub fn technicians(conn: &Connection, tenant_id: &str, range: &Range) -> AppResult<Breakdown<TechnicianStats>> {
    let (start, end) = range.bounds();
    let mut stmt = conn.prepare(
        "SELECT u.id, u.full_name,
                (SELECT COUNT(*) FROM devices d
                 WHERE d.tenant_id = ?1 AND d.technician_id = u.id
                   AND d.created_at >= ?2 AND d.created_at < ?3),
                (SELECT COUNT(*) FROM device_status_history h
                 JOIN devices d ON d.id = h.device_id
                 WHERE h.tenant_id = ?1 AND h.to_status = 'delivered' AND d.technician_id = u.id
                   AND h.changed_at >= ?2 AND h.changed_at < ?3),
                (SELECT AVG((julianday(d.delivered_at) - julianday(d.created_at)) * 24) FROM devices d
                 WHERE d.tenant_id = ?1 AND d.technician_id = u.id
                   AND d.delivered_at >= ?2 AND d.delivered_at < ?3)
         FROM users u WHERE u.tenant_id = ?1
         ORDER BY u.full_name COLLATE NOCASE",
    )?;
    let rows = stmt.query_map(params![tenant_id, start, end], |row| {
        Ok(TechnicianStats {
            technician_id: row.get(0)?,
            name: row.get(1)?,
            assigned: row.get(2)?,
            delivered: row.get(3)?,
            average_turnaround_hours: row.get::<_, Option<f64>>(4)?.map(round2),
        })
    })?;
    let mut live: Vec<TechnicianStats> = rows
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|t| t.assigned > 0 || t.delivered > 0)
        .collect();
    live.sort_by(|a, b| b.delivered.cmp(&a.delivered).then(b.assigned.cmp(&a.assigned)));

    let demo = demo_for(conn, tenant_id);
    Ok(breakdown(&demo, live, || {
        ["Demo Technician A", "Demo Technician B"]
            .iter()
            .map(|name| TechnicianStats {
                technician_id: None,
                name: name.to_string(),
                assigned: i64::from(demo.value("technicians.assigned", name, 5, 40)),
                delivered: i64::from(demo.value("technicians.delivered", name, 3, 35)),
                average_turnaround_hours: Some(f64::from(demo.value("technicians.turnaround", name, 12, 96))),
            })
            .collect()
    }))
}

/// Count per star rating, always five entries.
pub fn rating_distribution(conn: &Connection, tenant_id: &str, range: &Range) -> AppResult<Breakdown<Slice>> {
    let (start, end) = range.bounds();
    let mut stmt = conn.prepare(
        "SELECT rating, COUNT(*) FROM feedback
         WHERE tenant_id = ?1 AND created_at >= ?2 AND created_at < ?3
         GROUP BY rating",
    )?;
    let counts = stmt
        .query_map(params![tenant_id, start, end], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    let demo = demo_for(conn, tenant_id);
    let fill = |count: &dyn Fn(i64) -> i64| -> Vec<Slice> {
        (1..=5)
            .map(|stars| Slice {
                label: stars.to_string(),
                value: count(stars) as f64,
                count: None,
            })
            .collect()
    };
    if counts.is_empty() && demo.enabled {
        return Ok(Breakdown {
            source: Source::Demo,
            items: fill(&|stars| i64::from(demo.value("ratingDistribution", &stars.to_string(), 0, 8 * stars as u32))),
        });
    }
    Ok(Breakdown {
        source: Source::Live,
        items: fill(&|stars| counts.get(&stars).copied().unwrap_or(0)),
    })
}

pub fn sales_by_payment_method(conn: &Connection, tenant_id: &str, range: &Range) -> AppResult<Breakdown<Slice>> {
    let live = slices(
        conn,
        "SELECT payment_method, SUM(amount), COUNT(*) FROM sales
         WHERE tenant_id = ?1 AND created_at >= ?2 AND created_at < ?3
         GROUP BY payment_method ORDER BY SUM(amount) DESC, payment_method",
        tenant_id,
        range,
    )?;
    let demo = demo_for(conn, tenant_id);
    Ok(breakdown(&demo, live, || {
        demo.slices("salesByPaymentMethod", &["cash", "mobile_money", "card"], 2000, 60000)
    }))
}

pub fn top_parts(conn: &Connection, tenant_id: &str, range: &Range) -> AppResult<Breakdown<Slice>> {
    let (start, end) = range.bounds();
    let mut stmt = conn.prepare(
        "SELECT i.name, SUM(p.quantity), COUNT(DISTINCT p.device_id) FROM device_parts p
         JOIN inventory_items i ON i.id = p.item_id
         WHERE p.tenant_id = ?1 AND p.created_at >= ?2 AND p.created_at < ?3
         GROUP BY p.item_id ORDER BY SUM(p.quantity) DESC, i.name LIMIT ?4",
    )?;
    let live = stmt
        .query_map(params![tenant_id, start, end, TOP_PARTS], |row| {
            Ok(Slice {
                label: row.get(0)?,
                value: row.get::<_, i64>(1)? as f64,
                count: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let demo = demo_for(conn, tenant_id);
    Ok(breakdown(&demo, live, || {
        demo.slices("topParts", &["Screen", "Battery", "Charging port"], 1, 20)
    }))
}

// ---------------------------------------------------------------------------
// KPIs
// ---------------------------------------------------------------------------

pub fn kpis(conn: &Connection, tenant_id: &str, range: &Range) -> AppResult<Kpis> {
    let (start, end) = range.bounds();
    let p = params![tenant_id, start, end];
    let devices_registered: i64 = conn.query_row(
        "SELECT COUNT(*) FROM devices WHERE tenant_id = ?1 AND created_at >= ?2 AND created_at < ?3",
        p,
        |row| row.get(0),
    )?;
    let devices_delivered: i64 = conn.query_row(
        "SELECT COUNT(*) FROM device_status_history
         WHERE tenant_id = ?1 AND to_status = 'delivered' AND changed_at >= ?2 AND changed_at < ?3",
        p,
        |row| row.get(0),
    )?;
    let open_devices: i64 = conn.query_row(
        "SELECT COUNT(*) FROM devices WHERE tenant_id = ?1 AND status NOT IN ('delivered', 'cancelled')",
        params![tenant_id],
        |row| row.get(0),
    )?;
    let average_turnaround_hours: Option<f64> = conn.query_row(
        "SELECT AVG((julianday(delivered_at) - julianday(created_at)) * 24) FROM devices
         WHERE tenant_id = ?1 AND delivered_at >= ?2 AND delivered_at < ?3",
        p,
        |row| row.get(0),
    )?;
    let revenue: f64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM sales
         WHERE tenant_id = ?1 AND created_at >= ?2 AND created_at < ?3",
        p,
        |row| row.get(0),
    )?;
    let average_rating: Option<f64> = conn.query_row(
        "SELECT AVG(rating) FROM feedback WHERE tenant_id = ?1 AND created_at >= ?2 AND created_at < ?3",
        p,
        |row| row.get(0),
    )?;
    let (customers, repeat): (i64, i64) = conn.query_row(
        "WITH active AS (
             SELECT DISTINCT customer_id FROM devices
             WHERE tenant_id = ?1 AND created_at >= ?2 AND created_at < ?3
         )
         SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN (SELECT COUNT(*) FROM devices d
                                        WHERE d.tenant_id = ?1 AND d.customer_id = a.customer_id) > 1
                                  THEN 1 ELSE 0 END), 0)
         FROM active a",
        p,
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(Kpis {
        devices_registered,
        devices_delivered,
        open_devices,
        average_turnaround_hours: average_turnaround_hours.map(round2),
        revenue: round2(revenue),
        average_rating: average_rating.map(round2),
        repeat_customer_rate: if customers == 0 {
            0.0
        } else {
            round2(repeat as f64 / customers as f64)
        },
    })
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

fn range_info(range: &Range) -> RangeInfo {
    RangeInfo {
        from: range.from.to_string(),
        to: range.to.to_string(),
        granularity: range.granularity,
        buckets: range.buckets().len(),
    }
}

pub fn dashboard(conn: &Connection, tenant_id: &str, range: &Range) -> AppResult<Dashboard> {
    Ok(Dashboard {
        range: range_info(range),
        kpis: kpis(conn, tenant_id, range)?,
        series: series(conn, tenant_id, range)?,
        devices_by_type: devices_by_type(conn, tenant_id, range)?,
        devices_by_status: devices_by_status(conn, tenant_id, range)?,
        devices_by_location: devices_by_location(conn, tenant_id, range)?,
        technicians: technicians(conn, tenant_id, range)?,
        rating_distribution: rating_distribution(conn, tenant_id, range)?,
        sales_by_payment_method: sales_by_payment_method(conn, tenant_id, range)?,
        top_parts: top_parts(conn, tenant_id, range)?,
    })
}

fn series_named(conn: &Connection, tenant_id: &str, range: &Range, names: &[&str]) -> AppResult<Vec<Series>> {
    let demo = demo_for(conn, tenant_id);
    SERIES
        .iter()
        .filter(|def| names.contains(&def.name))
        .map(|def| build_series(conn, tenant_id, range, &demo, def))
        .collect()
}

/// One dashboard section by name.
pub fn section(conn: &Connection, tenant_id: &str, name: &str, range: &Range) -> AppResult<Value> {
    let mut data = match name {
        "kpis" => json!({ "kpis": kpis(conn, tenant_id, range)? }),
        "series" => json!({ "series": series(conn, tenant_id, range)? }),
        "devices" => json!({
            "series": series_named(conn, tenant_id, range, &["devicesRegistered", "devicesDelivered"])?,
            "devicesByType": devices_by_type(conn, tenant_id, range)?,
            "devicesByStatus": devices_by_status(conn, tenant_id, range)?,
            "devicesByLocation": devices_by_location(conn, tenant_id, range)?,
        }),
        "technicians" => json!({ "technicians": technicians(conn, tenant_id, range)? }),
        "feedback" => json!({
            "series": series_named(conn, tenant_id, range, &["averageRating"])?,
            "ratingDistribution": rating_distribution(conn, tenant_id, range)?,
        }),
        "sales" => json!({
            "series": series_named(conn, tenant_id, range, &["revenue"])?,
            "salesByPaymentMethod": sales_by_payment_method(conn, tenant_id, range)?,
            "topParts": top_parts(conn, tenant_id, range)?,
        }),
        _ => {
            return Err(AppError::not_found(format!(
                "Analytics section '{name}' (known: {})",
                SECTIONS.join(", ")
            )))
        }
    };
    if let Value::Object(ref mut map) = data {
        map.insert("range".into(), serde_json::to_value(range_info(range))?);
    }
    Ok(data)
}

/// Today's date in UTC, the default end of a range.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::devices;
    use crate::tenants::fixtures;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn range_defaults_and_limits() {
        let r = Range::parse(None, None, None, date("2026-03-31")).unwrap();
        assert_eq!((r.from, r.to), (date("2026-03-02"), date("2026-03-31")));
        assert_eq!(r.buckets().len(), 30);

        assert!(Range::parse(Some("2026-03-05"), Some("2026-03-01"), None, date("2026-03-31")).is_err());
        assert!(Range::parse(Some("2025-01-01"), Some("2026-01-02"), None, date("2026-03-31")).is_err());
        assert!(Range::parse(Some("2025-01-01"), Some("2026-01-01"), Some("month"), date("2026-03-31")).is_ok());
        assert!(Range::parse(None, None, Some("hourly"), date("2026-03-31")).is_err());
    }

    #[test]
    fn blank_range_bounds_fall_back_to_defaults() {
        let r = Range::parse(Some("  "), Some(""), None, date("2026-03-31")).unwrap();
        assert_eq!((r.from, r.to), (date("2026-03-02"), date("2026-03-31")));
        let r = Range::parse(Some(" 2026-03-20 "), None, None, date("2026-03-31")).unwrap();
        assert_eq!(r.from, date("2026-03-20"));
    }

    #[test]
    fn week_and_month_buckets_align() {
        // 2026-03-04 is a Wednesday.
        let r = Range::parse(Some("2026-03-04"), Some("2026-03-20"), Some("week"), date("2026-03-31")).unwrap();
        let b: Vec<String> = r.buckets().iter().map(|d| d.to_string()).collect();
        assert_eq!(b, vec!["2026-03-02", "2026-03-09", "2026-03-16"]);

        let r = Range::parse(Some("2025-11-15"), Some("2026-02-01"), Some("month"), date("2026-03-31")).unwrap();
        let b: Vec<String> = r.buckets().iter().map(|d| d.to_string()).collect();
        assert_eq!(b, vec!["2025-11-01", "2025-12-01", "2026-01-01", "2026-02-01"]);
    }

    #[test]
    fn sql_week_bucket_matches_rust_bucket() {
        let conn = Connection::open_in_memory().unwrap();
        for (ts, monday) in [
            ("2026-03-04T10:00:00Z", "2026-03-02"),
            ("2026-03-02T00:00:00Z", "2026-03-02"),
            ("2026-03-08T23:59:59Z", "2026-03-02"),
        ] {
            let got: String = conn
                .query_row(&format!("SELECT {}", Granularity::Week.sql("?1")), [ts], |row| row.get(0))
                .unwrap();
            assert_eq!(got, monday, "{ts}");
            assert_eq!(Granularity::Week.bucket_start(date(&ts[..10])).to_string(), monday);
        }
    }

    #[test]
    fn live_series_are_zero_filled() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        let c = fixtures::customer(&conn, tid, "Almaz", "0911000111");
        fixtures::device(&conn, tid, &c.id);
        fixtures::device(&conn, tid, &c.id);

        let today = today();
        let range = Range::parse(None, None, None, today).unwrap();
        let all = series(&conn, tid, &range).unwrap();
        let registered = all.iter().find(|s| s.name == "devicesRegistered").unwrap();
        assert_eq!(registered.source, Source::Live);
        assert_eq!(registered.points.len(), 30);
        assert_eq!(registered.points.last().unwrap().value, Some(2.0));
        assert_eq!(registered.points[0].value, Some(0.0));

        let rating = all.iter().find(|s| s.name == "averageRating").unwrap();
        assert!(rating.points.iter().all(|p| p.value.is_none()));
        assert_eq!(rating.source, Source::Live);
    }

    #[test]
    fn demo_fallback_is_deterministic_and_marked() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        db::set_setting(&conn, tid, "analytics", "demo_fallback", "true").unwrap();
        let range = Range::parse(Some("2026-01-01"), Some("2026-01-31"), Some("week"), date("2026-03-31")).unwrap();

        let first = dashboard(&conn, tid, &range).unwrap();
        let second = dashboard(&conn, tid, &range).unwrap();
        assert!(first.series.iter().all(|s| s.source == Source::Demo));
        assert_eq!(
            serde_json::to_value(&first.series).unwrap(),
            serde_json::to_value(&second.series).unwrap()
        );
        assert_eq!(first.devices_by_type.source, Source::Demo);
        assert_eq!(first.rating_distribution.items.len(), 5);
        let revenue = first.series.iter().find(|s| s.name == "revenue").unwrap();
        assert!(revenue.points.iter().all(|p| p.value.unwrap() >= 3500.0));

        // Real rows switch a section back to live.
        let c = fixtures::customer(&conn, tid, "Almaz", "0911000111");
        let d = fixtures::device(&conn, tid, &c.id);
        conn.execute(
            "UPDATE devices SET created_at = '2026-01-10T09:00:00Z' WHERE id = ?1",
            params![d.id],
        )
        .unwrap();
        let after = dashboard(&conn, tid, &range).unwrap();
        assert_eq!(after.devices_by_type.source, Source::Live);
        assert_eq!(after.devices_by_type.items[0].label, "phone");
        assert_eq!(
            after.series.iter().find(|s| s.name == "devicesRegistered").unwrap().source,
            Source::Live
        );
        assert_eq!(after.sales_by_payment_method.source, Source::Demo);
    }

    #[test]
    fn kpis_and_technician_turnaround() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        let tech = fixtures::staff(&conn, tid, "tech@bole.example", "technician");
        let a = fixtures::customer(&conn, tid, "Almaz", "0911000111");
        let b = fixtures::customer(&conn, tid, "Bekele", "0911000222");
        let d1 = fixtures::device(&conn, tid, &a.id);
        fixtures::device(&conn, tid, &a.id);
        fixtures::device(&conn, tid, &b.id);

        devices::assign_technician(&conn, tid, &d1.id, Some(tech.id.clone()), None).unwrap();
        for status in ["in_progress", "ready_for_pickup", "delivered"] {
            devices::change_status(&conn, tid, &d1.id, status, None, None).unwrap();
        }
        // Registered 30 hours before delivery.
        conn.execute(
            "UPDATE devices SET created_at = strftime('%Y-%m-%dT%H:%M:%SZ', delivered_at, '-30 hours')
             WHERE id = ?1",
            params![d1.id],
        )
        .unwrap();

        let range = Range::parse(Some("2000-01-01"), Some("2000-12-31"), None, today()).unwrap();
        assert_eq!(kpis(&conn, tid, &range).unwrap().devices_registered, 0);

        let from = (today() - Duration::days(10)).to_string();
        let range = Range::parse(Some(&from), None, None, today()).unwrap();
        let k = kpis(&conn, tid, &range).unwrap();
        assert_eq!(k.devices_registered, 3);
        assert_eq!(k.devices_delivered, 1);
        assert_eq!(k.open_devices, 2);
        assert_eq!(k.average_turnaround_hours, Some(30.0));
        assert_eq!(k.repeat_customer_rate, 0.5);
        assert_eq!(k.average_rating, None);

        let techs = technicians(&conn, tid, &range).unwrap();
        assert_eq!(techs.items.len(), 1);
        assert_eq!(techs.items[0].delivered, 1);
        assert_eq!(techs.items[0].average_turnaround_hours, Some(30.0));

        assert!(section(&conn, tid, "feedback", &range).unwrap()["ratingDistribution"]["items"].is_array());
        assert!(matches!(section(&conn, tid, "weather", &range), Err(AppError::NotFound(_))));
    }
}
