use axum::{
    extract::{Path, State},
    routing::{get, put},
    Router,
};
use serde_json::Value;

use super::{conn, ok, ApiResponse, Body};
use crate::auth::AuthUser;
use crate::settings;
use crate::state::AppState;

async fn get_all(State(state): State<AppState>, user: AuthUser) -> ApiResponse {
    user.require("settings:read")?;
    let conn = conn(&state)?;
    ok(settings::get_all(&conn, &user.tenant_id)?)
}

async fn update_category(
    State(state): State<AppState>,
    user: AuthUser,
    Path(category): Path<String>,
    Body(patch): Body<Value>,
) -> ApiResponse {
    user.require("settings:write")?;
    let conn = conn(&state)?;
    ok(settings::update_category(&conn, &user.tenant_id, &category, &patch)?)
}

async fn reset_category(State(state): State<AppState>, user: AuthUser, Path(category): Path<String>) -> ApiResponse {
    user.require("settings:write")?;
    let conn = conn(&state)?;
    ok(settings::reset_category(&conn, &user.tenant_id, &category)?)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/settings", get(get_all))
        .route("/settings/{category}", put(update_category).delete(reset_category))
}
