use axum::{extract::State, routing::get, Json, Router};
use serde::Deserialize;
use serde_json::json;

use super::{conn, created, page, pagination, ApiResponse, Body, Created, Params};
use crate::auth::AuthUser;
use crate::error::AppResult;
use crate::feedback::{self, FeedbackFilter, NewFeedback};
use crate::sales::{self, NewSale, SaleFilter};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleQuery {
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default, alias = "payment_method", alias = "method")]
    payment_method: Option<String>,
    #[serde(default)]
    page: Option<i64>,
    #[serde(default, alias = "page_size")]
    page_size: Option<i64>,
}

impl SaleQuery {
    fn into_filter(self) -> AppResult<SaleFilter> {
        Ok(SaleFilter {
            from: self.from,
            to: self.to,
            payment_method: self.payment_method,
            pagination: pagination(self.page, self.page_size)?,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedbackQuery {
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    rating: Option<i64>,
    #[serde(default)]
    page: Option<i64>,
    #[serde(default, alias = "page_size")]
    page_size: Option<i64>,
}

impl FeedbackQuery {
    fn into_filter(self) -> AppResult<FeedbackFilter> {
        Ok(FeedbackFilter {
            from: self.from,
            to: self.to,
            rating: self.rating,
            pagination: pagination(self.page, self.page_size)?,
        })
    }
}

async fn list_sales(State(state): State<AppState>, user: AuthUser, Params(query): Params<SaleQuery>) -> ApiResponse {
    user.require("sales:read")?;
    let filter = query.into_filter()?;
    let conn = conn(&state)?;
    let result = sales::list_sales(&conn, &user.tenant_id, &filter)?;
    Ok(Json(json!({
        "success": true,
        "data": serde_json::to_value(result.page.items)?,
        "total": result.page.total,
        "page": result.page.page,
        "pageSize": result.page.page_size,
        "totalAmount": result.total_amount,
    })))
}

async fn record_sale(State(state): State<AppState>, user: AuthUser, Body(input): Body<NewSale>) -> Created {
    user.require("sales:write")?;
    let conn = conn(&state)?;
    created(sales::create_sale(&conn, &user.tenant_id, input, Some(&user.user_id))?)
}

async fn list_feedback(
    State(state): State<AppState>,
    user: AuthUser,
    Params(query): Params<FeedbackQuery>,
) -> ApiResponse {
    user.require("sales:read")?;
    let filter = query.into_filter()?;
    let conn = conn(&state)?;
    page(feedback::list_feedback(&conn, &user.tenant_id, &filter)?)
}

async fn record_feedback(State(state): State<AppState>, user: AuthUser, Body(input): Body<NewFeedback>) -> Created {
    user.require("customers:write")?;
    let conn = conn(&state)?;
    created(feedback::create_feedback(&conn, &user.tenant_id, input)?)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sales", get(list_sales).post(record_sale))
        .route("/feedback", get(list_feedback).post(record_feedback))
}
