use axum::{
    extract::{Path, State},
    routing::get,
    Router,
};
use serde::Deserialize;

use super::{conn, created, done, ok, page, pagination, ApiResponse, Body, Created, Params};
use crate::auth::AuthUser;
use crate::customers::{self, CustomerFilter, CustomerUpdate, NewCustomer};
use crate::devices;
use crate::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CustomerQuery {
    #[serde(default, alias = "q")]
    search: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default, alias = "preferredLanguage")]
    language: Option<String>,
    #[serde(default)]
    page: Option<i64>,
    #[serde(default, alias = "page_size")]
    page_size: Option<i64>,
}

impl CustomerQuery {
    fn into_filter(self) -> AppResult<CustomerFilter> {
        Ok(CustomerFilter {
            search: self.search,
            city: self.city,
            language: self.language,
            pagination: pagination(self.page, self.page_size)?,
        })
    }
}

async fn list(State(state): State<AppState>, user: AuthUser, Params(query): Params<CustomerQuery>) -> ApiResponse {
    user.require("customers:read")?;
    let filter = query.into_filter()?;
    let conn = conn(&state)?;
    page(customers::list_customers(&conn, &user.tenant_id, &filter)?)
}

async fn create(State(state): State<AppState>, user: AuthUser, Body(input): Body<NewCustomer>) -> Created {
    user.require("customers:write")?;
    let conn = conn(&state)?;
    created(customers::create_customer(&conn, &user.tenant_id, input)?)
}

async fn get_one(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    user.require("customers:read")?;
    let conn = conn(&state)?;
    ok(customers::get_customer_detail(&conn, &user.tenant_id, &id)?)
}

async fn update(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Body(update): Body<CustomerUpdate>,
) -> ApiResponse {
    user.require("customers:write")?;
    let conn = conn(&state)?;
    ok(customers::update_customer(&conn, &user.tenant_id, &id, update)?)
}

async fn remove(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    user.require("customers:write")?;
    let conn = conn(&state)?;
    customers::delete_customer(&conn, &user.tenant_id, &id)?;
    done()
}

async fn customer_devices(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    user.require("devices:read")?;
    let conn = conn(&state)?;
    ok(devices::devices_for_customer(&conn, &user.tenant_id, &id)?)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/customers", get(list).post(create))
        .route("/customers/{id}", get(get_one).put(update).delete(remove))
        .route("/customers/{id}/devices", get(customer_devices))
}

#[cfg(test)]
mod dto_tests {
    use super::*;

    #[test]
    fn query_accepts_short_search_alias() {
        let q: CustomerQuery = serde_json::from_value(serde_json::json!({ "q": "alm", "pageSize": 5 })).unwrap();
        let filter = q.into_filter().unwrap();
        assert_eq!(filter.search.as_deref(), Some("alm"));
        assert_eq!(filter.pagination.page_size, 5);
    }

    #[test]
    fn query_rejects_oversized_pages() {
        let q = CustomerQuery {
            page_size: Some(500),
            ..Default::default()
        };
        assert!(q.into_filter().is_err());
    }
}
