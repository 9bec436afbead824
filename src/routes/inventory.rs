use axum::{
    extract::{Path, State},
    routing::{get, post},
    Router,
};
use serde::Deserialize;

use super::{conn, created, done, ok, page, pagination, ApiResponse, Body, Created, PageQuery, Params};
use crate::auth::AuthUser;
use crate::error::AppResult;
use crate::inventory::{self, ItemFilter, ItemUpdate, NewItem, StockAdjustment};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ItemQuery {
    #[serde(default, alias = "q")]
    search: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default, alias = "low_stock")]
    low_stock: bool,
    #[serde(default, alias = "include_inactive")]
    include_inactive: bool,
    #[serde(default)]
    page: Option<i64>,
    #[serde(default, alias = "page_size")]
    page_size: Option<i64>,
}

impl ItemQuery {
    fn into_filter(self) -> AppResult<ItemFilter> {
        Ok(ItemFilter {
            search: self.search,
            category: self.category,
            low_stock: self.low_stock,
            include_inactive: self.include_inactive,
            pagination: pagination(self.page, self.page_size)?,
        })
    }
}

async fn list(State(state): State<AppState>, user: AuthUser, Params(query): Params<ItemQuery>) -> ApiResponse {
    user.require("inventory:read")?;
    let filter = query.into_filter()?;
    let conn = conn(&state)?;
    page(inventory::list_items(&conn, &user.tenant_id, &filter)?)
}

async fn create(State(state): State<AppState>, user: AuthUser, Body(input): Body<NewItem>) -> Created {
    user.require("inventory:write")?;
    let conn = conn(&state)?;
    created(inventory::create_item(&conn, &user.tenant_id, input, Some(&user.user_id))?)
}

async fn low_stock(State(state): State<AppState>, user: AuthUser) -> ApiResponse {
    user.require("inventory:read")?;
    let conn = conn(&state)?;
    ok(inventory::low_stock_items(&conn, &user.tenant_id)?)
}

async fn get_one(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    user.require("inventory:read")?;
    let conn = conn(&state)?;
    ok(inventory::get_item(&conn, &user.tenant_id, &id)?)
}

async fn update(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Body(update): Body<ItemUpdate>,
) -> ApiResponse {
    user.require("inventory:write")?;
    let conn = conn(&state)?;
    ok(inventory::update_item(&conn, &user.tenant_id, &id, update)?)
}

async fn remove(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    user.require("inventory:write")?;
    let conn = conn(&state)?;
    inventory::delete_item(&conn, &user.tenant_id, &id)?;
    done()
}

async fn adjust(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Body(adjustment): Body<StockAdjustment>,
) -> ApiResponse {
    user.require("inventory:write")?;
    let conn = conn(&state)?;
    ok(inventory::adjust_stock(&conn, &user.tenant_id, &id, adjustment, Some(&user.user_id))?)
}

async fn movements(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Params(query): Params<PageQuery>,
) -> ApiResponse {
    user.require("inventory:read")?;
    let pagination = query.required()?;
    let conn = conn(&state)?;
    page(inventory::list_movements(&conn, &user.tenant_id, &id, pagination)?)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/inventory", get(list).post(create))
        .route("/inventory/low-stock", get(low_stock))
        .route("/inventory/{id}", get(get_one).put(update).delete(remove))
        .route("/inventory/{id}/adjust", post(adjust))
        .route("/inventory/{id}/movements", get(movements))
}
