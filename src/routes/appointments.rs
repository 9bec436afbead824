use axum::{
    extract::{Path, State},
    routing::{get, post},
    Router,
};
use serde::Deserialize;

use super::{conn, created, done, ok, page, pagination, ApiResponse, Body, Created, Params};
use crate::appointments::{self, AppointmentFilter, AppointmentUpdate, NewAppointment};
use crate::auth::AuthUser;
use crate::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AppointmentQuery {
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "technician_id")]
    technician_id: Option<String>,
    #[serde(default, alias = "customer_id")]
    customer_id: Option<String>,
    #[serde(default)]
    page: Option<i64>,
    #[serde(default, alias = "page_size")]
    page_size: Option<i64>,
}

impl AppointmentQuery {
    fn into_filter(self) -> AppResult<AppointmentFilter> {
        Ok(AppointmentFilter {
            from: self.from,
            to: self.to,
            status: self.status,
            technician_id: self.technician_id,
            customer_id: self.customer_id,
            pagination: pagination(self.page, self.page_size)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    status: String,
}

async fn list(State(state): State<AppState>, user: AuthUser, Params(query): Params<AppointmentQuery>) -> ApiResponse {
    user.require("appointments:read")?;
    let filter = query.into_filter()?;
    let conn = conn(&state)?;
    page(appointments::list_appointments(&conn, &user.tenant_id, &filter)?)
}

async fn create(State(state): State<AppState>, user: AuthUser, Body(input): Body<NewAppointment>) -> Created {
    user.require("appointments:write")?;
    let conn = conn(&state)?;
    created(appointments::create_appointment(&conn, &user.tenant_id, input, Some(&user.user_id))?)
}

async fn get_one(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    user.require("appointments:read")?;
    let conn = conn(&state)?;
    ok(appointments::get_appointment(&conn, &user.tenant_id, &id)?)
}

async fn update(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Body(update): Body<AppointmentUpdate>,
) -> ApiResponse {
    user.require("appointments:write")?;
    let conn = conn(&state)?;
    ok(appointments::update_appointment(&conn, &user.tenant_id, &id, update)?)
}

async fn remove(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResponse {
    user.require("appointments:write")?;
    let conn = conn(&state)?;
    appointments::delete_appointment(&conn, &user.tenant_id, &id)?;
    done()
}

async fn change_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Body(payload): Body<StatusPayload>,
) -> ApiResponse {
    user.require("appointments:write")?;
    let conn = conn(&state)?;
    ok(appointments::change_status(&conn, &user.tenant_id, &id, &payload.status)?)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/appointments", get(list).post(create))
        .route("/appointments/{id}", get(get_one).put(update).delete(remove))
        .route("/appointments/{id}/status", post(change_status))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::TestApp;
    use crate::tenants::fixtures;
    use axum::http::StatusCode;
    use chrono::{Duration, SecondsFormat, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn booking_and_status_flow() {
        let app = TestApp::new().await;
        let (customer_id, tech_id) = {
            let conn = app.state.db.lock().unwrap();
            let c = fixtures::customer(&conn, &app.tenant_id, "Almaz", "0911000111");
            let t = fixtures::staff(&conn, &app.tenant_id, "tech@bole.example", "technician");
            (c.id, t.id)
        };
        let start = (Utc::now() + Duration::days(2)).to_rfc3339_opts(SecondsFormat::Secs, true);

        let (status, body) = app
            .admin(
                "POST",
                "/api/appointments",
                Some(json!({
                    "customerId": customer_id,
                    "technicianId": tech_id,
                    "purpose": "Screen replacement",
                    "startsAt": start
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        assert_eq!(body["data"]["status"], json!("scheduled"));
        let id = body["data"]["id"].as_str().unwrap().to_string();

        // Same technician, same slot.
        let (status, _) = app
            .admin(
                "POST",
                "/api/appointments",
                Some(json!({
                    "customerId": customer_id,
                    "technicianId": tech_id,
                    "purpose": "Battery",
                    "startsAt": start
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) = app.admin("GET", "/api/appointments?status=scheduled", None).await;
        assert_eq!(body["total"], json!(1));

        let (status, body) = app
            .admin("POST", &format!("/api/appointments/{id}/status"), Some(json!({ "status": "completed" })))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");

        let (status, _) = app
            .admin("POST", &format!("/api/appointments/{id}/status"), Some(json!({ "status": "confirmed" })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
