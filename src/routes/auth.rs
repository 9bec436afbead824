use axum::{
    extract::{Path, State},
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::json;

use super::{blocking, conn, created, done, ok, ApiResponse, Body, Created};
use crate::auth::{self, AuthUser, LoginRequest, NewUser, UserUpdate};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordPayload {
    #[serde(alias = "current_password", alias = "oldPassword", alias = "old_password")]
    current_password: String,
    #[serde(alias = "new_password")]
    new_password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResetPasswordPayload {
    #[serde(alias = "new_password", alias = "newPassword")]
    password: String,
}

async fn login(State(state): State<AppState>, Body(request): Body<LoginRequest>) -> ApiResponse {
    let (db, sessions) = (state.db.clone(), state.auth.clone());
    ok(blocking("login", move || auth::login(&db, &sessions, request)).await?)
}

async fn logout(State(state): State<AppState>, user: AuthUser) -> ApiResponse {
    let removed = state.auth.logout(&user.token)?;
    ok(json!({ "loggedOut": removed }))
}

async fn session(user: AuthUser) -> ApiResponse {
    ok(user.session.to_json())
}

async fn change_password(
    State(state): State<AppState>,
    user: AuthUser,
    Body(payload): Body<ChangePasswordPayload>,
) -> ApiResponse {
    let db = state.db.clone();
    blocking("password change", move || {
        auth::change_own_password(
            &db,
            &user.tenant_id,
            &user.user_id,
            payload.current_password,
            payload.new_password,
        )
    })
    .await?;
    done()
}

async fn list_users(State(state): State<AppState>, user: AuthUser) -> ApiResponse {
    user.require("users:manage")?;
    let conn = conn(&state)?;
    ok(auth::list_users(&conn, &user.tenant_id)?)
}

async fn create_user(State(state): State<AppState>, user: AuthUser, Body(input): Body<NewUser>) -> Created {
    user.require("users:manage")?;
    let db = state.db.clone();
    created(blocking("user create", move || auth::create_user(&db, &user.tenant_id, input)).await?)
}

async fn update_user(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Body(update): Body<UserUpdate>,
) -> ApiResponse {
    user.require("users:manage")?;
    let conn = conn(&state)?;
    ok(auth::update_user(&conn, &state.auth, &user.tenant_id, &id, update)?)
}

async fn reset_password(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Body(payload): Body<ResetPasswordPayload>,
) -> ApiResponse {
    user.require("users:manage")?;
    let (db, sessions) = (state.db.clone(), state.auth.clone());
    blocking("password reset", move || {
        auth::reset_password(&db, &sessions, &user.tenant_id, &id, payload.password)
    })
    .await?;
    done()
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/session", get(session))
        .route("/auth/password", post(change_password))
        .route("/users", get(list_users).post(create_user))
        .route("/users/{id}", put(update_user))
        .route("/users/{id}/password", post(reset_password))
}
