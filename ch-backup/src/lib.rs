//! ClickHouse backup library
//!
//! Cluster-aware backup and restore with content-addressed deduplication
//! shared between nodes through a coordination backend.

pub mod catalog;
pub mod config;
pub mod coordination;
pub mod database;
pub mod dedup;
pub mod fs;
pub mod lock;
pub mod orchestrator;
pub mod retention;
pub mod retry;
pub mod storage;
pub mod transfer;
pub mod utils;

#[cfg(test)]
mod testutil;

// Re-export commonly used types
pub use config::Config;
pub use orchestrator::Orchestrator;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
