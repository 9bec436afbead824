use axum::{
    extract::{Path, State},
    routing::{delete, get},
    Router,
};
use serde::Deserialize;

use super::{conn, created, done, ok, page, ApiResponse, Body, Created, PageQuery, Params};
use crate::auth::AuthUser;
use crate::recipients::{self, CategoryInput, CategoryUpdate, GroupInput, GroupUpdate};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembersPayload {
    #[serde(alias = "customer_ids", alias = "members")]
    customer_ids: Vec<String>,
}

// Categories

async fn list_categories(State(state): State<AppState>, user: AuthUser) -> ApiResponse {
    user.require("customers:read")?;
    let conn = conn(&state)?;
    ok(recipients::list_categories(&conn, &user.tenant_id)?)
}

async fn create_category(State(state): State<AppState>, user: AuthUser, Body(input): Body<CategoryInput>) -> Created {
    user.require("customers:write")?;
    let conn = conn(&state)?;
    created(recipients::create_category(&conn, &user.tenant_id, input)?)
}

async fn get_category(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    user.require("customers:read")?;
    let conn = conn(&state)?;
    ok(recipients::get_category(&conn, &user.tenant_id, &id)?)
}

async fn update_category(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Body(update): Body<CategoryUpdate>,
) -> ApiResponse {
    user.require("customers:write")?;
    let conn = conn(&state)?;
    ok(recipients::update_category(&conn, &user.tenant_id, &id, update)?)
}

async fn delete_category(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    user.require("customers:write")?;
    let conn = conn(&state)?;
    recipients::delete_category(&conn, &user.tenant_id, &id)?;
    done()
}

async fn category_customers(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Params(query): Params<PageQuery>,
) -> ApiResponse {
    user.require("customers:read")?;
    let pagination = query.optional()?;
    let conn = conn(&state)?;
    page(recipients::resolve_category(&conn, &user.tenant_id, &id, pagination)?)
}

// Groups

async fn list_groups(State(state): State<AppState>, user: AuthUser) -> ApiResponse {
    user.require("customers:read")?;
    let conn = conn(&state)?;
    ok(recipients::list_groups(&conn, &user.tenant_id)?)
}

async fn create_group(State(state): State<AppState>, user: AuthUser, Body(input): Body<GroupInput>) -> Created {
    user.require("customers:write")?;
    let conn = conn(&state)?;
    created(recipients::create_group(&conn, &user.tenant_id, input)?)
}

async fn get_group(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    user.require("customers:read")?;
    let conn = conn(&state)?;
    ok(recipients::get_group(&conn, &user.tenant_id, &id)?)
}

async fn update_group(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Body(update): Body<GroupUpdate>,
) -> ApiResponse {
    user.require("customers:write")?;
    let conn = conn(&state)?;
    ok(recipients::update_group(&conn, &user.tenant_id, &id, update)?)
}

async fn delete_group(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    user.require("customers:write")?;
    let conn = conn(&state)?;
    recipients::delete_group(&conn, &user.tenant_id, &id)?;
    done()
}

async fn list_members(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Params(query): Params<PageQuery>,
) -> ApiResponse {
    user.require("customers:read")?;
    let pagination = query.optional()?;
    let conn = conn(&state)?;
    page(recipients::list_members(&conn, &user.tenant_id, &id, pagination)?)
}

async fn add_members(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Body(payload): Body<MembersPayload>,
) -> ApiResponse {
    user.require("customers:write")?;
    let conn = conn(&state)?;
    ok(recipients::add_members(&conn, &user.tenant_id, &id, &payload.customer_ids)?)
}

async fn remove_member(
    State(state): State<AppState>,
    user: AuthUser,
    Path((id, customer_id)): Path<(String, String)>,
) -> ApiResponse {
    user.require("customers:write")?;
    let conn = conn(&state)?;
    recipients::remove_member(&conn, &user.tenant_id, &id, &customer_id)?;
    done()
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/customer-categories", get(list_categories).post(create_category))
        .route(
            "/customer-categories/{id}",
            get(get_category).put(update_category).delete(delete_category),
        )
        .route("/customer-categories/{id}/customers", get(category_customers))
        .route("/recipient-groups", get(list_groups).post(create_group))
        .route("/recipient-groups/{id}", get(get_group).put(update_group).delete(delete_group))
        .route("/recipient-groups/{id}/members", get(list_members).post(add_members))
        .route("/recipient-groups/{id}/members/{customer_id}", delete(remove_member))
}
