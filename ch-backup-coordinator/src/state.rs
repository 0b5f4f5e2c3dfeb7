use crate::config::AppConfig;
use ch_backup::coordination::SqliteCoordinator;
use std::sync::Arc;

pub struct AppState {
    pub coordinator: Arc<SqliteCoordinator>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(coordinator: Arc<SqliteCoordinator>, config: AppConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }
}
