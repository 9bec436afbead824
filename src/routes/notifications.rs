use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use super::{conn, done, ok, pagination, ApiResponse, Body, Params};
use crate::auth::AuthUser;
use crate::notifications::{self, PreferenceUpdate};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboxQuery {
    #[serde(default, alias = "unread_only", alias = "unreadOnly")]
    unread: bool,
    #[serde(default)]
    page: Option<i64>,
    #[serde(default, alias = "page_size")]
    page_size: Option<i64>,
}

/// A bare list or `{ "preferences": [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PreferencesPayload {
    List(Vec<PreferenceUpdate>),
    Wrapped { preferences: Vec<PreferenceUpdate> },
}

impl PreferencesPayload {
    fn into_updates(self) -> Vec<PreferenceUpdate> {
        match self {
            Self::List(list) | Self::Wrapped { preferences: list } => list,
        }
    }
}

async fn get_preferences(State(state): State<AppState>, user: AuthUser) -> ApiResponse {
    let conn = conn(&state)?;
    ok(notifications::get_preferences(&conn, &user.user_id)?)
}

async fn update_preferences(
    State(state): State<AppState>,
    user: AuthUser,
    Body(payload): Body<PreferencesPayload>,
) -> ApiResponse {
    let conn = conn(&state)?;
    ok(notifications::update_preferences(
        &conn,
        &user.tenant_id,
        &user.user_id,
        payload.into_updates(),
    )?)
}

async fn reset_preferences(State(state): State<AppState>, user: AuthUser) -> ApiResponse {
    let conn = conn(&state)?;
    ok(notifications::reset_preferences(&conn, &user.user_id)?)
}

async fn inbox(State(state): State<AppState>, user: AuthUser, Params(query): Params<InboxQuery>) -> ApiResponse {
    let pagination = pagination(query.page, query.page_size)?;
    let conn = conn(&state)?;
    let page = notifications::list_inbox(&conn, &user.user_id, query.unread, pagination)?;
    let unread = notifications::unread_count(&conn, &user.user_id)?;
    Ok(Json(json!({
        "success": true,
        "data": serde_json::to_value(page.items)?,
        "total": page.total,
        "page": page.page,
        "pageSize": page.page_size,
        "unreadCount": unread,
    })))
}

async fn mark_read(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    let conn = conn(&state)?;
    notifications::mark_read(&conn, &user.user_id, &id)?;
    done()
}

async fn mark_all_read(State(state): State<AppState>, user: AuthUser) -> ApiResponse {
    let conn = conn(&state)?;
    let updated = notifications::mark_all_read(&conn, &user.user_id)?;
    ok(json!({ "updated": updated }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/notifications/preferences",
            get(get_preferences).put(update_preferences).delete(reset_preferences),
        )
        .route("/notifications", get(inbox))
        .route("/notifications/read-all", post(mark_all_read))
        .route("/notifications/{id}/read", post(mark_read))
}

#[cfg(test)]
mod dto_tests {
    use super::*;

    #[test]
    fn preferences_payload_accepts_both_shapes() {
        let bare: PreferencesPayload =
            serde_json::from_value(json!([{ "type": "low_stock", "email": false }])).unwrap();
        assert_eq!(bare.into_updates().len(), 1);
        let wrapped: PreferencesPayload =
            serde_json::from_value(json!({ "preferences": [{ "notificationType": "low_stock" }] })).unwrap();
        assert_eq!(wrapped.into_updates()[0].notification_type, "low_stock");
    }
}
