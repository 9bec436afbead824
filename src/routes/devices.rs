use axum::{
    extract::{Path, State},
    routing::{get, post},
    Router,
};
use serde::Deserialize;

use super::{conn, created, done, ok, page, pagination, ApiResponse, Body, Created, Params};
use crate::auth::AuthUser;
use crate::devices::{self, DeviceFilter, DeviceUpdate, NewDevice, PartUsage};
use crate::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeviceQuery {
    /// One status or a comma-separated list.
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "customer_id")]
    customer_id: Option<String>,
    #[serde(default, alias = "technician_id")]
    technician_id: Option<String>,
    #[serde(default, alias = "device_type", alias = "type")]
    device_type: Option<String>,
    #[serde(default, alias = "q")]
    search: Option<String>,
    #[serde(default)]
    overdue: bool,
    #[serde(default)]
    page: Option<i64>,
    #[serde(default, alias = "page_size")]
    page_size: Option<i64>,
}

impl DeviceQuery {
    fn into_filter(self) -> AppResult<DeviceFilter> {
        let statuses = self
            .status
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Ok(DeviceFilter {
            statuses,
            customer_id: self.customer_id,
            technician_id: self.technician_id,
            device_type: self.device_type,
            search: self.search,
            overdue: self.overdue,
            pagination: pagination(self.page, self.page_size)?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    status: String,
    #[serde(default, alias = "notes")]
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignPayload {
    #[serde(default, alias = "technician_id", alias = "userId")]
    technician_id: Option<String>,
}

async fn list(State(state): State<AppState>, user: AuthUser, Params(query): Params<DeviceQuery>) -> ApiResponse {
    user.require("devices:read")?;
    let filter = query.into_filter()?;
    let conn = conn(&state)?;
    page(devices::list_devices(&conn, &user.tenant_id, &filter)?)
}

async fn register(State(state): State<AppState>, user: AuthUser, Body(input): Body<NewDevice>) -> Created {
    user.require("devices:write")?;
    let conn = conn(&state)?;
    created(devices::register_device(&conn, &user.tenant_id, Some(&user.user_id), input)?)
}

async fn get_one(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    user.require("devices:read")?;
    let conn = conn(&state)?;
    ok(devices::get_device(&conn, &user.tenant_id, &id)?)
}

async fn update(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Body(update): Body<DeviceUpdate>,
) -> ApiResponse {
    user.require("devices:write")?;
    let conn = conn(&state)?;
    ok(devices::update_device(&conn, &user.tenant_id, &id, update)?)
}

async fn remove(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    user.require("devices:write")?;
    let conn = conn(&state)?;
    devices::delete_device(&conn, &user.tenant_id, &id)?;
    done()
}

async fn change_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Body(payload): Body<StatusPayload>,
) -> ApiResponse {
    user.require("devices:write")?;
    let conn = conn(&state)?;
    ok(devices::change_status(
        &conn,
        &user.tenant_id,
        &id,
        &payload.status,
        payload.note,
        Some(&user.user_id),
    )?)
}

async fn assign(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Body(payload): Body<AssignPayload>,
) -> ApiResponse {
    user.require("devices:assign")?;
    let conn = conn(&state)?;
    ok(devices::assign_technician(
        &conn,
        &user.tenant_id,
        &id,
        payload.technician_id,
        Some(&user.user_id),
    )?)
}

async fn history(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    user.require("devices:read")?;
    let conn = conn(&state)?;
    ok(devices::history(&conn, &user.tenant_id, &id)?)
}

async fn list_parts(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    user.require("devices:read")?;
    let conn = conn(&state)?;
    ok(devices::list_parts(&conn, &user.tenant_id, &id)?)
}

async fn record_part(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Body(usage): Body<PartUsage>,
) -> Created {
    user.require("inventory:use")?;
    let conn = conn(&state)?;
    created(devices::record_part(&conn, &user.tenant_id, &id, usage, Some(&user.user_id))?)
}

async fn public_track(State(state): State<AppState>, Path((slug, code)): Path<(String, String)>) -> ApiResponse {
    let conn = conn(&state)?;
    ok(devices::public_track(&conn, &slug, &code)?)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/devices", get(list).post(register))
        .route("/devices/{id}", get(get_one).put(update).delete(remove))
        .route("/devices/{id}/status", post(change_status))
        .route("/devices/{id}/assign", post(assign))
        .route("/devices/{id}/history", get(history))
        .route("/devices/{id}/parts", get(list_parts).post(record_part))
        .route("/public/{slug}/track/{code}", get(public_track))
}


#[cfg(test)]
mod tests {
    use super::super::test_support::TestApp;
    use crate::tenants::fixtures;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn repair_workflow_over_http() {
        let app = TestApp::new().await;
        let (customer_id, tech_id) = {
            let conn = app.state.db.lock().unwrap();
            let c = fixtures::customer(&conn, &app.tenant_id, "Almaz", "0911000111");
            let tech = fixtures::staff(&conn, &app.tenant_id, "tech@bole.example", "technician");
            (c.id, tech.id)
        };

        let (status, body) = app
            .admin(
                "POST",
                "/api/devices",
                Some(json!({
                    "customerId": customer_id,
                    "deviceType": "phone",
                    "brand": "Tecno",
                    "issueDescription": "Cracked screen",
                    "estimatedCost": 1800
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        let id = body["data"]["id"].as_str().unwrap().to_string();
        let code = body["data"]["trackingCode"].as_str().unwrap().to_string();

        let (status, body) = app
            .admin("POST", &format!("/api/devices/{id}/assign"), Some(json!({ "technicianId": tech_id })))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["technicianId"], json!(tech_id));

        let (status, _) = app
            .admin("POST", &format!("/api/devices/{id}/status"), Some(json!({ "status": "delivered" })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .admin(
                "POST",
                &format!("/api/devices/{id}/status"),
                Some(json!({ "status": "in_progress", "note": "Opened" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["status"], json!("in_progress"));

        let (_, body) = app.admin("GET", "/api/devices?status=registered,in_progress", None).await;
        assert_eq!(body["total"], json!(1));
        let (_, body) = app.admin("GET", "/api/devices?status=delivered", None).await;
        assert_eq!(body["total"], json!(0));

        let (_, body) = app.admin("GET", &format!("/api/devices/{id}/history"), None).await;
        assert!(body["data"].as_array().unwrap().len() >= 2);

        let (status, body) = app
            .call("GET", &format!("/api/public/bole/track/{}", code.to_lowercase()), None, None)
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["status"], json!("in_progress"));
        assert!(body["data"].get("customerName").is_none());

        let (status, _) = app.call("GET", "/api/public/nowhere/track/ABCDEF", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn parts_draw_down_inventory() {
        let app = TestApp::new().await;
        let device_id = {
            let conn = app.state.db.lock().unwrap();
            let c = fixtures::customer(&conn, &app.tenant_id, "Almaz", "0911000111");
            fixtures::device(&conn, &app.tenant_id, &c.id).id
        };
        let (status, body) = app
            .admin(
                "POST",
                "/api/inventory",
                Some(json!({ "sku": "scr-a52", "name": "A52 screen", "quantity": 3, "unitPrice": 1500 })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        let item_id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = app
            .admin(
                "POST",
                &format!("/api/devices/{device_id}/parts"),
                Some(json!({ "itemId": item_id, "quantity": 2 })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        assert_eq!(body["data"]["lineTotal"], json!(3000.0));

        let (status, _) = app
            .admin(
                "POST",
                &format!("/api/devices/{device_id}/parts"),
                Some(json!({ "itemId": item_id, "quantity": 2 })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = app.admin("GET", &format!("/api/devices/{device_id}/parts"), None).await;
        assert_eq!(body["data"]["totalCost"], json!(3000.0));
        let (_, body) = app.admin("GET", &format!("/api/inventory/{item_id}"), None).await;
        assert_eq!(body["data"]["quantity"], json!(1));
    }
}
