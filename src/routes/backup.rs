use axum::{
    body::Body as HttpBody,
    extract::{Path, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;

use super::{blocking, conn, created, ok, ApiResponse, Created};
use crate::auth::AuthUser;
use crate::backup;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::tenants;

async fn export(State(state): State<AppState>, user: AuthUser) -> Created {
    user.require("backup:export")?;
    let db = state.db.clone();
    let export_dir = state.config.export_dir.clone();
    let tenant_id = user.tenant_id.clone();
    let summary = blocking("export", move || {
        let conn = db.lock()?;
        let tenant = tenants::get_tenant(&conn, &tenant_id)?;
        backup::export_tenant(&conn, &tenant, &export_dir, Utc::now())
    })
    .await?;
    created(summary)
}

async fn list(State(state): State<AppState>, user: AuthUser) -> ApiResponse {
    user.require("backup:export")?;
    let slug = {
        let conn = conn(&state)?;
        tenants::get_tenant(&conn, &user.tenant_id)?.slug
    };
    ok(backup::list_exports(&state.config.export_dir, &slug)?)
}

async fn download(State(state): State<AppState>, user: AuthUser, Path(file): Path<String>) -> AppResult<Response> {
    user.require("backup:export")?;
    let slug = {
        let conn = conn(&state)?;
        tenants::get_tenant(&conn, &user.tenant_id)?.slug
    };
    let path = backup::export_path(&state.config.export_dir, &slug, &file)?;
    let bytes = tokio::fs::read(&path).await?;
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{file}\""))
        .map_err(|_| AppError::not_found("Export"))?;
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/zip")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        HttpBody::from(bytes),
    )
        .into_response())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/backup/export", post(export))
        .route("/backup/exports", get(list))
        .route("/backup/exports/{file}", get(download))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::TestApp;
    use crate::tenants::fixtures;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn export_list_and_download() {
        let app = TestApp::new().await;
        {
            let conn = app.state.db.lock().unwrap();
            fixtures::customer(&conn, &app.tenant_id, "Almaz", "0911000111");
        }

        let (status, body) = app.admin("POST", "/api/backup/export", None).await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        assert_eq!(body["data"]["tables"]["customers"], json!(1));
        let file = body["data"]["fileName"].as_str().unwrap().to_string();
        assert!(file.starts_with("bole-export-"));

        let (_, body) = app.admin("GET", "/api/backup/exports", None).await;
        assert_eq!(body["data"][0]["fileName"], json!(file));

        let (status, body) = app.admin("GET", &format!("/api/backup/exports/{file}"), None).await;
        assert_eq!(status, StatusCode::OK);
        // Zip payloads are not JSON; the helper hands them back as a string.
        assert!(body.as_str().unwrap().starts_with("PK"));

        let (status, _) = app
            .admin("GET", "/api/backup/exports/other-export-20260101-000000-000.zip", None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let _ = std::fs::remove_dir_all(&app.state.config.data_dir);
    }

    #[tokio::test]
    async fn technicians_cannot_export() {
        let app = TestApp::new().await;
        {
            let conn = app.state.db.lock().unwrap();
            fixtures::staff(&conn, &app.tenant_id, "tech@bole.example", "technician");
        }
        let token = app.login("tech@bole.example", "secret123").await;
        let (status, _) = app.call("POST", "/api/backup/export", Some(&token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
