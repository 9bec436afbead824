use axum::{
    extract::{Path, State},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;

use super::{conn, created, done, ok, page, pagination, ApiResponse, Body, Created, PageQuery, Params};
use crate::auth::AuthUser;
use crate::error::AppResult;
use crate::sms::{
    self, CampaignRequest, MessageFilter, PreviewRequest, SendRequest, TemplateFilter, TemplateInput,
    TemplateUpdate,
};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateQuery {
    #[serde(default)]
    language: Option<String>,
    #[serde(default, alias = "triggerEvent")]
    trigger: Option<String>,
    #[serde(default, alias = "active_only", alias = "active")]
    active_only: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "customer_id")]
    customer_id: Option<String>,
    #[serde(default, alias = "campaign_id")]
    campaign_id: Option<String>,
    #[serde(default)]
    page: Option<i64>,
    #[serde(default, alias = "page_size")]
    page_size: Option<i64>,
}

impl MessageQuery {
    fn into_filter(self) -> AppResult<MessageFilter> {
        Ok(MessageFilter {
            status: self.status,
            customer_id: self.customer_id,
            campaign_id: self.campaign_id,
            pagination: pagination(self.page, self.page_size)?,
        })
    }
}

/// Context for rendering a stored template.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplatePreviewPayload {
    #[serde(default, alias = "customer_id")]
    customer_id: Option<String>,
    #[serde(default, alias = "device_id")]
    device_id: Option<String>,
    #[serde(default)]
    variables: sms::Variables,
}

async fn placeholders(user: AuthUser) -> ApiResponse {
    user.require("sms:read")?;
    let list: Vec<_> = sms::PLACEHOLDERS
        .iter()
        .map(|(name, description)| json!({ "name": name, "description": description }))
        .collect();
    ok(list)
}

async fn list_templates(
    State(state): State<AppState>,
    user: AuthUser,
    Params(query): Params<TemplateQuery>,
) -> ApiResponse {
    user.require("sms:read")?;
    let filter = TemplateFilter {
        language: query.language,
        trigger: query.trigger,
        active_only: query.active_only,
    };
    let conn = conn(&state)?;
    ok(sms::list_templates(&conn, &user.tenant_id, &filter)?)
}

async fn create_template(State(state): State<AppState>, user: AuthUser, Body(input): Body<TemplateInput>) -> Created {
    user.require("sms:manage")?;
    let conn = conn(&state)?;
    created(sms::create_template(&conn, &user.tenant_id, input)?)
}

async fn get_template(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    user.require("sms:read")?;
    let conn = conn(&state)?;
    ok(sms::get_template(&conn, &user.tenant_id, &id)?)
}

async fn update_template(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Body(update): Body<TemplateUpdate>,
) -> ApiResponse {
    user.require("sms:manage")?;
    let conn = conn(&state)?;
    ok(sms::update_template(&conn, &user.tenant_id, &id, update)?)
}

async fn delete_template(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    user.require("sms:manage")?;
    let conn = conn(&state)?;
    sms::delete_template(&conn, &user.tenant_id, &id)?;
    done()
}

async fn preview_template(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Body(payload): Body<TemplatePreviewPayload>,
) -> ApiResponse {
    user.require("sms:read")?;
    let request = PreviewRequest {
        template_id: Some(id),
        body: None,
        customer_id: payload.customer_id,
        device_id: payload.device_id,
        variables: payload.variables,
    };
    let conn = conn(&state)?;
    ok(sms::preview(&conn, &user.tenant_id, request)?)
}

async fn preview(State(state): State<AppState>, user: AuthUser, Body(request): Body<PreviewRequest>) -> ApiResponse {
    user.require("sms:read")?;
    let conn = conn(&state)?;
    ok(sms::preview(&conn, &user.tenant_id, request)?)
}

async fn send(State(state): State<AppState>, user: AuthUser, Body(request): Body<SendRequest>) -> Created {
    user.require("sms:send")?;
    let conn = conn(&state)?;
    created(sms::send_message(&conn, &user.tenant_id, request)?)
}

async fn list_messages(
    State(state): State<AppState>,
    user: AuthUser,
    Params(query): Params<MessageQuery>,
) -> ApiResponse {
    user.require("sms:read")?;
    let filter = query.into_filter()?;
    let conn = conn(&state)?;
    page(sms::list_messages(&conn, &user.tenant_id, &filter)?)
}

async fn list_campaigns(State(state): State<AppState>, user: AuthUser, Params(query): Params<PageQuery>) -> ApiResponse {
    user.require("sms:read")?;
    let pagination = query.required()?;
    let conn = conn(&state)?;
    page(sms::list_campaigns(&conn, &user.tenant_id, pagination)?)
}

async fn create_campaign(
    State(state): State<AppState>,
    user: AuthUser,
    Body(request): Body<CampaignRequest>,
) -> Created {
    user.require("sms:send")?;
    let conn = conn(&state)?;
    created(sms::create_campaign(&conn, &user.tenant_id, request, Some(&user.user_id))?)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sms/placeholders", get(placeholders))
        .route("/sms/templates", get(list_templates).post(create_template))
        .route(
            "/sms/templates/{id}",
            get(get_template).put(update_template).delete(delete_template),
        )
        .route("/sms/templates/{id}/preview", post(preview_template))
        .route("/sms/preview", post(preview))
        .route("/sms/send", post(send))
        .route("/sms/messages", get(list_messages))
        .route("/sms/campaigns", get(list_campaigns).post(create_campaign))
}
