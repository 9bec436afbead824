use axum::{
    extract::{Path, State},
    routing::get,
    Router,
};
use serde::Deserialize;

use super::{conn, ok, ApiResponse, Params};
use crate::analytics::{self, Range};
use crate::auth::AuthUser;
use crate::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RangeQuery {
    #[serde(default, alias = "start")]
    from: Option<String>,
    #[serde(default, alias = "end")]
    to: Option<String>,
    #[serde(default, alias = "interval")]
    granularity: Option<String>,
}

impl RangeQuery {
    fn range(&self) -> AppResult<Range> {
        Range::parse(
            self.from.as_deref(),
            self.to.as_deref(),
            self.granularity.as_deref(),
            analytics::today(),
        )
    }
}

async fn dashboard(State(state): State<AppState>, user: AuthUser, Params(query): Params<RangeQuery>) -> ApiResponse {
    user.require("analytics:view")?;
    let range = query.range()?;
    let conn = conn(&state)?;
    ok(analytics::dashboard(&conn, &user.tenant_id, &range)?)
}

async fn section(
    State(state): State<AppState>,
    user: AuthUser,
    Path(name): Path<String>,
    Params(query): Params<RangeQuery>,
) -> ApiResponse {
    user.require("analytics:view")?;
    let range = query.range()?;
    let conn = conn(&state)?;
    ok(analytics::section(&conn, &user.tenant_id, &name, &range)?)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/analytics/dashboard", get(dashboard))
        .route("/analytics/{section}", get(section))
}
