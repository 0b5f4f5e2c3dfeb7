//! Utility modules shared by the library and the CLI.

pub mod errors;
pub mod logger;
pub mod privileges;
pub mod shutdown;

pub use errors::{BackupError, Result};

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Wall-clock instant `d` from now. Durations too large for chrono saturate at
/// a century.
pub fn deadline_after(d: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(d)
        .ok()
        .filter(|delta| *delta < chrono::Duration::days(36_500))
        .unwrap_or_else(|| chrono::Duration::days(36_500));
    Utc::now() + delta
}

/// Fresh opaque token for leases, reservations and deletion claims.
pub fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
