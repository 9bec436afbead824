//! Background workers: SMS delivery and the end-of-day summary.
//!
//! Each worker opens its own connection to the database file and stops when
//! the shared cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::analytics::{self, Granularity, Range};
use crate::appointments;
use crate::config::Config;
use crate::db::{self, DbState};
use crate::error::AppResult;
use crate::notifications::{self, StaffEvent};
use crate::settings;
use crate::sms::{self, DueMessage};
use crate::sms_gateway::SmsGateway;
use crate::tenants;

/// Hour (UTC) after which the daily summary is raised.
pub const SUMMARY_HOUR_UTC: u32 = 18;
const SUMMARY_CHECK_INTERVAL: Duration = Duration::from_secs(3600);
const SUMMARY_SETTING: (&str, &str) = ("system", "last_daily_summary");

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub recovered: usize,
    pub reminders: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
}

impl CycleReport {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Spawn both workers on `tracker`.
pub fn spawn(
    tracker: &TaskTracker,
    token: CancellationToken,
    config: Arc<Config>,
    gateway: Arc<SmsGateway>,
) -> AppResult<()> {
    let sms_db = Arc::new(db::init(&config.data_dir)?);
    let summary_db = Arc::new(db::init(&config.data_dir)?);

    let interval = Duration::from_secs(config.worker_interval_secs);
    let max_attempts = config.sms_max_attempts;
    let sms_token = token.clone();
    tracker.spawn(async move {
        info!(interval_secs = interval.as_secs(), live = gateway.is_live(), "SMS worker started");
        loop {
            tokio::select! {
                _ = sms_token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match run_sms_cycle(&sms_db, &gateway, max_attempts).await {
                Ok(report) if !report.is_empty() => info!(?report, "SMS worker cycle"),
                Ok(_) => {}
                Err(e) => error!("SMS worker error: {e}"),
            }
        }
        info!("SMS worker stopped");
    });

    tracker.spawn(async move {
        info!("Summary worker started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(SUMMARY_CHECK_INTERVAL) => {}
            }
            let result = summary_db.lock().and_then(|conn| run_daily_summary(&conn, Utc::now()));
            match result {
                Ok(0) => debug!("no daily summaries due"),
                Ok(n) => info!(tenants = n, "daily summaries raised"),
                Err(e) => error!("Summary worker error: {e}"),
            }
        }
        info!("Summary worker stopped");
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// SMS delivery
// ---------------------------------------------------------------------------

/// Bookkeeping before delivery: recover stuck messages, queue reminders,
/// then claim a batch.
fn prepare_batch(db: &DbState, now: DateTime<Utc>, report: &mut CycleReport) -> AppResult<Vec<DueMessage>> {
    let conn = db.lock()?;
    report.recovered = sms::recover_stuck(&conn, now)?;
    report.reminders = match appointments::queue_due_reminders(&conn, now) {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "appointment reminders could not be queued");
            0
        }
    };
    sms::claim_due(&conn, now, sms::DELIVERY_BATCH_SIZE)
}

fn settle(
    db: &DbState,
    msg: &DueMessage,
    outcome: Result<String, String>,
    max_attempts: i64,
    report: &mut CycleReport,
) -> AppResult<()> {
    let conn = db.lock()?;
    let now = Utc::now();
    match outcome {
        Ok(provider_id) => {
            sms::mark_sent(&conn, &msg.id, &provider_id, now)?;
            debug!(message_id = %msg.id, provider_id = %provider_id, "SMS sent");
            report.sent += 1;
        }
        Err(e) => {
            warn!(message_id = %msg.id, attempt = msg.attempts, error = %e, "SMS delivery attempt failed");
            if sms::record_failure(&conn, msg, &e, max_attempts, now)? {
                report.failed += 1;
            } else {
                report.retried += 1;
            }
        }
    }
    Ok(())
}

/// One delivery pass. The database lock is never held while talking to the
/// gateway.
pub async fn run_sms_cycle(db: &DbState, gateway: &SmsGateway, max_attempts: i64) -> AppResult<CycleReport> {
    let mut report = CycleReport::default();
    let batch = prepare_batch(db, Utc::now(), &mut report)?;
    for msg in &batch {
        let outcome = gateway.send(&msg.recipient, msg.sender_id.as_deref(), &msg.body).await;
        settle(db, msg, outcome, max_attempts, &mut report)?;
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// Daily summary
// ---------------------------------------------------------------------------

fn summary_body(conn: &Connection, tenant_id: &str, kpis: &analytics::Kpis) -> String {
    let currency = settings::get_string(conn, tenant_id, "shop", "currency");
    format!(
        "Registered {}, delivered {}, revenue {:.2} {currency}, open devices {}",
        kpis.devices_registered, kpis.devices_delivered, kpis.revenue, kpis.open_devices
    )
}

/// Raise today's `daily_summary` for every tenant that has not had one yet.
/// Does nothing before `SUMMARY_HOUR_UTC`. Returns the tenants notified.
pub fn run_daily_summary(conn: &Connection, now: DateTime<Utc>) -> AppResult<usize> {
    if now.hour() < SUMMARY_HOUR_UTC {
        return Ok(0);
    }
    let today = now.date_naive();
    let today_str = today.to_string();
    let range = Range {
        from: today,
        to: today,
        granularity: Granularity::Day,
    };

    let mut raised = 0;
    for tenant in tenants::list_tenants(conn)? {
        let (category, key) = SUMMARY_SETTING;
        if db::get_setting(conn, &tenant.id, category, key).as_deref() == Some(today_str.as_str()) {
            continue;
        }
        let kpis = analytics::kpis(conn, &tenant.id, &range)?;
        let event = StaffEvent::new(
            notifications::DAILY_SUMMARY,
            format!("Daily summary for {today_str}"),
            summary_body(conn, &tenant.id, &kpis),
        );
        if let Err(e) = notifications::dispatch(conn, &tenant.id, &event) {
            warn!(tenant_id = %tenant.id, error = %e, "daily summary notification failed");
        }
        db::set_setting(conn, &tenant.id, category, key, &today_str)?;
        raised += 1;
    }
    Ok(raised)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_helpers::Pagination;
    use crate::sms::Outgoing;
    use crate::tenants::fixtures;
    use chrono::TimeZone;

    fn queue_one(conn: &Connection, tenant_id: &str) -> String {
        sms::enqueue(
            conn,
            tenant_id,
            Outgoing {
                customer_id: None,
                recipient: "+251911000111".into(),
                body: "Your device is ready".into(),
                template_id: None,
                campaign_id: None,
                context: "manual",
                reference_id: None,
            },
        )
        .unwrap()
    }

    fn gateway(url: &str) -> SmsGateway {
        let mut config = Config::for_data_dir(std::env::temp_dir());
        config.sms_gateway_url = url.into();
        SmsGateway::from_config(&config).unwrap()
    }

    #[tokio::test]
    async fn log_only_cycle_marks_messages_sent() {
        let state = db::test_state();
        let (tid, id) = {
            let conn = state.lock().unwrap();
            let shop = fixtures::shop(&conn, "bole");
            let id = queue_one(&conn, &shop.tenant.id);
            (shop.tenant.id, id)
        };

        let report = run_sms_cycle(&state, &gateway(""), 3).await.unwrap();
        assert_eq!(report.sent, 1);

        let conn = state.lock().unwrap();
        let msg = sms::get_message(&conn, &tid, &id).unwrap();
        assert_eq!(msg.status, "sent");
        assert_eq!(msg.attempts, 1);
        assert!(msg.provider_message_id.unwrap().starts_with("log-"));
    }

    #[tokio::test]
    async fn unreachable_gateway_retries_then_fails() {
        let state = db::test_state();
        let (tid, id) = {
            let conn = state.lock().unwrap();
            let shop = fixtures::shop(&conn, "bole");
            let id = queue_one(&conn, &shop.tenant.id);
            (shop.tenant.id, id)
        };
        let dead = gateway("http://127.0.0.1:1");

        let report = run_sms_cycle(&state, &dead, 2).await.unwrap();
        assert_eq!(report.retried, 1);
        {
            let conn = state.lock().unwrap();
            let msg = sms::get_message(&conn, &tid, &id).unwrap();
            assert_eq!(msg.status, "queued");
            assert!(msg.last_error.is_some());
            // Skip the back-off.
            conn.execute("UPDATE sms_messages SET next_attempt_at = NULL", []).unwrap();
        }

        let report = run_sms_cycle(&state, &dead, 2).await.unwrap();
        assert_eq!(report.failed, 1);
        let conn = state.lock().unwrap();
        assert_eq!(sms::get_message(&conn, &tid, &id).unwrap().status, "failed");
    }

    #[test]
    fn daily_summary_runs_once_per_day_after_cutoff() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let shop = fixtures::shop(&conn, "bole");
        let tid = &shop.tenant.id;
        let c = fixtures::customer(&conn, tid, "Almaz", "0911000111");
        fixtures::device(&conn, tid, &c.id);

        let today = Utc::now().date_naive();
        let at = |hour: u32| Utc.from_utc_datetime(&today.and_hms_opt(hour, 0, 0).unwrap());
        assert_eq!(run_daily_summary(&conn, at(9)).unwrap(), 0);
        assert_eq!(run_daily_summary(&conn, at(19)).unwrap(), 1);
        assert_eq!(run_daily_summary(&conn, at(22)).unwrap(), 0);

        let inbox = notifications::list_inbox(&conn, &shop.admin.id, true, Pagination::default()).unwrap();
        let summary = inbox
            .items
            .iter()
            .find(|n| n.notification_type == notifications::DAILY_SUMMARY)
            .unwrap();
        assert!(summary.body.contains("Registered 1"));

        let tomorrow = at(19) + chrono::Duration::days(1);
        assert_eq!(run_daily_summary(&conn, tomorrow).unwrap(), 1);

        // The marker stays out of the user-facing settings.
        let all = settings::get_all(&conn, tid).unwrap();
        assert!(all.get("system").is_none());
    }
}
