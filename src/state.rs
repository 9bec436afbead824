use std::sync::Arc;

use crate::auth::AuthState;
use crate::config::Config;
use crate::db::DbState;
use crate::error::AppResult;
use crate::sms_gateway::SmsGateway;

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbState>,
    pub auth: Arc<AuthState>,
    pub config: Arc<Config>,
    pub sms: Arc<SmsGateway>,
}

impl AppState {
    pub fn new(db: Arc<DbState>, config: Arc<Config>) -> AppResult<Self> {
        let sms = Arc::new(SmsGateway::from_config(&config)?);
        Ok(Self {
            db,
            auth: Arc::new(AuthState::new()),
            config,
            sms,
        })
    }

    /// In-memory database, temp directories, log-only SMS.
    #[cfg(test)]
    pub fn for_test() -> Self {
        let dir = std::env::temp_dir().join(format!("repairdesk_test_{}", uuid::Uuid::new_v4()));
        let config = Arc::new(Config::for_data_dir(dir));
        Self::new(Arc::new(crate::db::test_state()), config).expect("test state")
    }
}
