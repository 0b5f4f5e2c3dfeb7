use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    /// Bearer token required on every API call when set
    pub token: Option<String>,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8480);
        let bind = std::env::var("BIND_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], port)));

        Self {
            bind,
            db_path: PathBuf::from(
                std::env::var("COORDINATOR_DB")
                    .unwrap_or_else(|_| "/var/lib/ch-backup/coordinator.db".into()),
            ),
            token: std::env::var("COORDINATOR_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        }
    }
}
