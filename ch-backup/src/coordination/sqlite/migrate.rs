use super::connection::DbPool;
use crate::utils::errors::Result;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS locks (
  resource TEXT PRIMARY KEY,
  holder TEXT NOT NULL,
  token TEXT NOT NULL,
  expires_at INTEGER NOT NULL,
  acquired_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS dedup_records (
  hash TEXT PRIMARY KEY,
  state TEXT NOT NULL CHECK(state IN ('reserved','present','deleting')),
  token TEXT,
  lease_expires_at INTEGER,
  location_key TEXT,
  compressed INTEGER NOT NULL DEFAULT 0,
  stored_size INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL,
  last_referenced_at INTEGER
);

CREATE TABLE IF NOT EXISTS dedup_refs (
  hash TEXT NOT NULL REFERENCES dedup_records(hash) ON DELETE CASCADE,
  backup_id TEXT NOT NULL,
  entry TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  PRIMARY KEY (hash, backup_id, entry)
);

CREATE INDEX IF NOT EXISTS idx_dedup_refs_backup_id ON dedup_refs(backup_id);
CREATE INDEX IF NOT EXISTS idx_dedup_records_state ON dedup_records(state);
"#;

pub fn migrate(pool: &DbPool) -> Result<()> {
    let conn = pool.get()?;
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }

    tracing::info!("[DB] Migrating coordination schema {} -> {}", version, SCHEMA_VERSION);
    conn.execute_batch(SCHEMA)?;
    conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
    Ok(())
}
