use axum::{
    extract::State,
    routing::{get, post},
    Router,
};

use super::{blocking, conn, created, ok, ApiResponse, Body, Created};
use crate::auth::AuthUser;
use crate::error::AppError;
use crate::state::AppState;
use crate::tenants::{self, NewTenant};

async fn signup(State(state): State<AppState>, Body(input): Body<NewTenant>) -> Created {
    if !state.config.allow_signup {
        return Err(AppError::Forbidden("Signup is disabled on this server".into()));
    }
    let prepared = blocking("signup", move || tenants::prepare_tenant(input)).await?;
    let conn = conn(&state)?;
    created(tenants::create_tenant(&conn, prepared)?)
}

async fn current(State(state): State<AppState>, user: AuthUser) -> ApiResponse {
    let conn = conn(&state)?;
    ok(tenants::get_tenant(&conn, &user.tenant_id)?)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tenants", post(signup))
        .route("/tenant", get(current))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::TestApp;
    use axum::http::StatusCode;
    use serde_json::json;

    fn signup_body(slug: &str) -> serde_json::Value {
        json!({
            "shopName": "Piassa Phones",
            "slug": slug,
            "admin": { "name": "Owner", "email": "owner@piassa.example", "password": "secret123" }
        })
    }

    #[tokio::test]
    async fn signup_then_duplicate_slug() {
        let app = TestApp::new().await;
        let (status, body) = app.call("POST", "/api/tenants", None, Some(signup_body("piassa"))).await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        assert_eq!(body["data"]["tenant"]["slug"], json!("piassa"));
        assert!(body["data"]["admin"].get("passwordHash").is_none());

        let (status, _) = app.call("POST", "/api/tenants", None, Some(signup_body("piassa"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn signup_can_be_disabled() {
        let mut app = TestApp::new().await;
        let mut config = (*app.state.config).clone();
        config.allow_signup = false;
        app.state.config = std::sync::Arc::new(config);
        let (status, _) = app.call("POST", "/api/tenants", None, Some(signup_body("kazanchis"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn current_tenant_follows_the_session() {
        let app = TestApp::new().await;
        let (status, body) = app.admin("GET", "/api/tenant", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["id"], json!(app.tenant_id));
    }
}
