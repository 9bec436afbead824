//! HTTP surface. One file per resource; each exposes a `router()` that is
//! merged under `/api` here.
//!
//! Successful responses are `{ "success": true, "data": ... }`; listings add
//! `total`, `page` and `pageSize`. Errors go through `AppError`.

pub mod analytics;
pub mod appointments;
pub mod auth;
pub mod backup;
pub mod customers;
pub mod devices;
pub mod inventory;
pub mod notifications;
pub mod recipients;
pub mod sales;
pub mod settings;
pub mod sms;
pub mod system;
pub mod tenants;

use axum::{
    extract::{FromRequest, FromRequestParts, Query, Request},
    http::{request::Parts, HeaderValue, Method, StatusCode},
    routing::get,
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::MutexGuard;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::Config;
use crate::data_helpers::{Page, Pagination};
use crate::error::{AppError, AppResult};
use crate::state::AppState;

pub type ApiResponse = AppResult<Json<Value>>;
pub type Created = AppResult<(StatusCode, Json<Value>)>;

pub fn ok<T: Serialize>(data: T) -> ApiResponse {
    Ok(Json(json!({ "success": true, "data": serde_json::to_value(data)? })))
}

pub fn created<T: Serialize>(data: T) -> Created {
    Ok((StatusCode::CREATED, ok(data)?))
}

pub fn page<T: Serialize>(page: Page<T>) -> ApiResponse {
    Ok(Json(json!({
        "success": true,
        "data": serde_json::to_value(page.items)?,
        "total": page.total,
        "page": page.page,
        "pageSize": page.page_size,
    })))
}

pub fn done() -> ApiResponse {
    Ok(Json(json!({ "success": true })))
}

/// JSON body whose parse failures are reported as validation errors.
pub struct Body<T>(pub T);

impl<S, T> FromRequest<S> for Body<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        Json::<T>::from_request(req, state)
            .await
            .map(|Json(value)| Body(value))
            .map_err(|e| AppError::validation(e.body_text()))
    }
}

/// Query string with the same error mapping as `Body`.
pub struct Params<T>(pub T);

impl<S, T> FromRequestParts<S> for Params<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Query::<T>::from_request_parts(parts, state)
            .await
            .map(|Query(value)| Params(value))
            .map_err(|e| AppError::validation(e.body_text()))
    }
}

pub(crate) fn pagination(page: Option<i64>, page_size: Option<i64>) -> AppResult<Pagination> {
    Pagination::new(page, page_size)
}

/// `?page=&pageSize=` on its own.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PageQuery {
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default, alias = "page_size")]
    pub page_size: Option<i64>,
}

impl PageQuery {
    pub fn required(&self) -> AppResult<Pagination> {
        pagination(self.page, self.page_size)
    }

    /// `None` when the caller asked for neither field.
    pub fn optional(&self) -> AppResult<Option<Pagination>> {
        if self.page.is_none() && self.page_size.is_none() {
            return Ok(None);
        }
        self.required().map(Some)
    }
}

/// Lock the shared connection for one handler.
pub(crate) fn conn(state: &AppState) -> AppResult<MutexGuard<'_, rusqlite::Connection>> {
    state.db.lock()
}

/// Run blocking work (bcrypt, zipping) on the blocking pool.
pub(crate) async fn blocking<T, F>(task: &'static str, work: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AppError::internal(format!("{task} task failed: {e}")))?
}

fn cors_layer(config: &Config) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);
    if config.cors_origins.is_empty() {
        return base.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(origins)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .merge(tenants::router())
        .merge(auth::router())
        .merge(customers::router())
        .merge(recipients::router())
        .merge(devices::router())
        .merge(inventory::router())
        .merge(appointments::router())
        .merge(sms::router())
        .merge(notifications::router())
        .merge(sales::router())
        .merge(analytics::router())
        .merge(system::router())
        .merge(settings::router())
        .merge(backup::router())
}

/// The complete application router.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .route("/health", get(system::liveness))
        .nest("/api", api_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}


#[cfg(test)]
mod tests {
    use super::test_support::TestApp;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn health_needs_no_auth() {
        let app = TestApp::new().await;
        let (status, body) = app.call("GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));
    }

    #[tokio::test]
    async fn api_requires_bearer_token() {
        let app = TestApp::new().await;
        let (status, body) = app.call("GET", "/api/customers", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["code"], json!("unauthorized"));

        let (status, _) = app.call("GET", "/api/customers", Some("bogus"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_json_is_a_validation_error() {
        let app = TestApp::new().await;
        let (status, body) = app
            .admin("POST", "/api/customers", Some(json!({ "fullName": 12 })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("validation"));
    }

    #[tokio::test]
    async fn out_of_range_page_is_a_validation_error() {
        let app = TestApp::new().await;
        let (status, body) = app
            .admin("GET", "/api/customers?page=9223372036854775807&pageSize=20", None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        assert_eq!(body["code"], json!("validation"));
    }
}
