use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde_json::{json, Value};

use super::{ok, ApiResponse};
use crate::auth::AuthUser;
use crate::diagnostics;
use crate::state::AppState;

/// Unauthenticated liveness check.
pub async fn liveness() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn about(_user: AuthUser) -> ApiResponse {
    ok(diagnostics::get_about_info())
}

async fn health(State(state): State<AppState>, user: AuthUser) -> ApiResponse {
    user.require("system:view")?;
    let mut report = diagnostics::get_system_health(&state.db, &state.config, &user.tenant_id, Utc::now())?;
    report["activeSessions"] = json!(state.auth.active_count());
    ok(report)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/system/about", get(about))
        .route("/system/health", get(health))
}
