//! RepairDesk server
//!
//! Multi-tenant backend for device repair shops. `serve` runs the HTTP API
//! together with the SMS and daily-summary workers until Ctrl-C or SIGTERM.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod analytics;
mod appointments;
mod auth;
mod backup;
mod config;
mod customers;
mod data_helpers;
mod db;
mod devices;
mod diagnostics;
mod error;
mod feedback;
mod inventory;
mod notifications;
mod recipients;
mod routes;
mod sales;
mod settings;
mod sms;
mod sms_gateway;
mod state;
mod tenants;
mod workers;

pub use config::Config;
pub use error::{AppError, AppResult};

/// Console plus daily rolling file logging. Keep the returned guard alive
/// for the life of the process; dropping it flushes the file writer.
pub fn init_logging(log_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,repairdesk_lib=debug"));

    std::fs::create_dir_all(log_dir).ok();
    let pruned = diagnostics::prune_old_logs(log_dir);

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if pruned > 0 {
        info!(pruned, "old log files removed");
    }
    guard
}

/// Run the API server and background workers until shutdown.
pub async fn serve(config: Config) -> AppResult<()> {
    diagnostics::mark_started();
    info!("Starting RepairDesk v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(config);
    let db = Arc::new(db::init(&config.data_dir)?);
    let state = state::AppState::new(db, config.clone())?;

    let token = CancellationToken::new();
    let tracker = TaskTracker::new();
    workers::spawn(&tracker, token.clone(), config.clone(), state.sms.clone())?;

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, signup = config.allow_signup, "HTTP server listening");

    axum::serve(listener, routes::build_router(state))
        .with_graceful_shutdown(shutdown_signal(token.clone()))
        .await?;

    token.cancel();
    tracker.close();
    tracker.wait().await;
    info!("RepairDesk stopped");
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl-C handler unavailable: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = token.cancelled() => {}
    }
    info!("Shutdown requested");
}

/// Open the database and apply pending migrations. Returns the schema version.
pub fn migrate(config: &Config) -> AppResult<i32> {
    let state = db::init(&config.data_dir)?;
    let conn = state.lock()?;
    Ok(db::schema_version(&conn))
}

/// Write a consistent copy of the whole database to `output`.
pub fn backup_database(config: &Config, output: &Path) -> AppResult<()> {
    let state = db::init(&config.data_dir)?;
    let conn = state.lock()?;
    backup::snapshot(&conn, output)
}
