//! ClickHouse over its HTTP interface.
//!
//! Queries go through `POST /` with the statement as the body. Frozen parts are
//! read straight from `<data_path>/shadow/<tag>/data/<db>/<table>/`, and
//! restored parts are moved into `<data_path>/data/<db>/<table>/detached/`
//! before `ATTACH PART`.

use super::{
    create_if_not_exists, move_dir, DatabaseClient, FrozenPart, FrozenTable, PartInfo,
    RestoredPart, TableRef,
};
use crate::config::ClickHouseConfig;
use crate::fs::walker::list_subdirs;
use crate::utils::errors::{BackupError, Result};
use crate::utils::privileges::chown_tree;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

pub struct ClickHouseClient {
    client: reqwest::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
    data_path: PathBuf,
    owner: Option<(String, String)>,
}

#[derive(Deserialize)]
struct JsonRows<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct TableRow {
    database: String,
    name: String,
}

#[derive(Deserialize)]
struct PartRow {
    name: String,
    #[serde(default)]
    hash_of_all_files: String,
    // UInt64 is quoted in JSON output by default.
    #[serde(deserialize_with = "u64_from_any")]
    bytes_on_disk: u64,
}

fn u64_from_any<'de, D: serde::Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom("negative size")),
        serde_json::Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!("unexpected value {other}"))),
    }
}

/// Backtick-quote an identifier.
pub fn quote_ident(s: &str) -> String {
    format!("`{}`", s.replace('\\', "\\\\").replace('`', "\\`"))
}

/// Single-quote a string literal.
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Directory name ClickHouse uses for a database or table on disk.
pub fn escape_path_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

impl ClickHouseClient {
    pub fn new(config: &ClickHouseConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}://{}:{}/", config.protocol, config.host, config.port),
            user: config.user.clone(),
            password: config.password.clone(),
            data_path: config.data_path.clone(),
            owner: Some((config.owner_user.clone(), config.owner_group.clone())),
        })
    }

    /// Skip chown of attached parts (when not running as root).
    pub fn without_chown(mut self) -> Self {
        self.owner = None;
        self
    }

    async fn query(&self, sql: &str) -> Result<String> {
        debug!(sql, "ClickHouse query");
        let mut req = self.client.post(&self.url).body(sql.to_string());
        if let Some(user) = &self.user {
            req = req.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            req = req.header("X-ClickHouse-Key", password);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(BackupError::Database(format!(
                "HTTP {status}: {}",
                text.trim()
            )));
        }
        Ok(text)
    }

    async fn query_rows<T: serde::de::DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        let text = self.query(sql).await?;
        let rows: JsonRows<T> = serde_json::from_str(&text)?;
        Ok(rows.data)
    }

    fn table_dir(&self, table: &TableRef) -> PathBuf {
        self.data_path
            .join("data")
            .join(escape_path_component(&table.database))
            .join(escape_path_component(&table.name))
    }

    fn shadow_dir(&self, tag: &str) -> PathBuf {
        self.data_path.join("shadow").join(tag)
    }
}

#[async_trait]
impl DatabaseClient for ClickHouseClient {
    async fn list_tables(&self, exclude_dbs: &[String]) -> Result<Vec<TableRef>> {
        let rows: Vec<TableRow> = self
            .query_rows(
                "SELECT database, name FROM system.tables \
                 WHERE engine LIKE '%MergeTree%' AND NOT is_temporary \
                 ORDER BY database, metadata_modification_time \
                 FORMAT JSON",
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter(|r| !exclude_dbs.contains(&r.database))
            .map(|r| TableRef::new(r.database, r.name))
            .collect())
    }

    async fn table_schema(&self, table: &TableRef) -> Result<String> {
        let sql = format!(
            "SHOW CREATE TABLE {}.{} FORMAT TSVRaw",
            quote_ident(&table.database),
            quote_ident(&table.name)
        );
        Ok(self.query(&sql).await?.trim_end().to_string())
    }

    async fn database_schema(&self, database: &str) -> Result<String> {
        let sql = format!("SHOW CREATE DATABASE {} FORMAT TSVRaw", quote_ident(database));
        Ok(self.query(&sql).await?.trim_end().to_string())
    }

    async fn access_entities(&self) -> Result<Vec<String>> {
        let out = self.query("SHOW ACCESS FORMAT TSVRaw").await?;
        Ok(access_statements(&out))
    }

    async fn list_parts(&self, table: &TableRef) -> Result<Vec<PartInfo>> {
        let sql = format!(
            "SELECT name, hash_of_all_files, bytes_on_disk FROM system.parts \
             WHERE active AND database = {} AND table = {} ORDER BY name FORMAT JSON",
            quote_literal(&table.database),
            quote_literal(&table.name)
        );
        let rows: Vec<PartRow> = self.query_rows(&sql).await?;
        Ok(rows
            .into_iter()
            .map(|r| PartInfo {
                name: r.name,
                checksum: r.hash_of_all_files,
                bytes_on_disk: r.bytes_on_disk,
            })
            .collect())
    }

    async fn freeze(&self, table: &TableRef, tag: &str) -> Result<FrozenTable> {
        let sql = format!(
            "ALTER TABLE {}.{} FREEZE WITH NAME {}",
            quote_ident(&table.database),
            quote_ident(&table.name),
            quote_literal(tag)
        );
        self.query(&sql).await?;

        // Parts merged away between FREEZE and this listing keep an empty
        // checksum and are never reused incrementally.
        let checksums: HashMap<String, String> = self
            .list_parts(table)
            .await?
            .into_iter()
            .map(|p| (p.name, p.checksum))
            .collect();

        let frozen_dir = self
            .shadow_dir(tag)
            .join("data")
            .join(escape_path_component(&table.database))
            .join(escape_path_component(&table.name));
        let dir = frozen_dir.clone();
        let names = tokio::task::spawn_blocking(move || list_subdirs(&dir)).await??;

        let parts = names
            .into_iter()
            .map(|name| FrozenPart {
                checksum: checksums.get(&name).cloned().unwrap_or_default(),
                path: frozen_dir.join(&name),
                name,
            })
            .collect::<Vec<_>>();
        info!(table = %table, tag, parts = parts.len(), "Table frozen");
        Ok(FrozenTable {
            table: table.clone(),
            tag: tag.to_string(),
            parts,
        })
    }

    async fn unfreeze(&self, tag: &str) -> Result<()> {
        let dir = self.shadow_dir(tag);
        if tag.is_empty() || tag.contains('/') || tag == ".." {
            return Err(BackupError::Database(format!("refusing to remove {}", dir.display())));
        }
        tokio::task::spawn_blocking(move || match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        })
        .await??;
        debug!(tag, "Removed frozen data");
        Ok(())
    }

    async fn ensure_database(&self, database: &str, schema: &str) -> Result<()> {
        let sql = if schema.trim().is_empty() {
            format!("CREATE DATABASE IF NOT EXISTS {}", quote_ident(database))
        } else {
            create_if_not_exists(schema)
        };
        self.query(&sql).await?;
        Ok(())
    }

    async fn ensure_table(&self, table: &TableRef, schema: &str) -> Result<()> {
        self.query(&format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            quote_ident(&table.database)
        ))
        .await?;
        self.query(&create_if_not_exists(schema)).await?;
        Ok(())
    }

    async fn attach(&self, table: &TableRef, parts: &[RestoredPart]) -> Result<()> {
        let detached = self.table_dir(table).join("detached");
        for part in parts {
            let target = detached.join(&part.name);
            let (from, to) = (part.path.clone(), target.clone());
            let owner = self.owner.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                move_dir(&from, &to)?;
                if let Some((user, group)) = owner {
                    chown_tree(&to, &user, &group)?;
                }
                Ok(())
            })
            .await??;

            let sql = format!(
                "ALTER TABLE {}.{} ATTACH PART {}",
                quote_ident(&table.database),
                quote_ident(&table.name),
                quote_literal(&part.name)
            );
            self.query(&sql).await?;
            debug!(table = %table, part = %part.name, "Part attached");
        }
        Ok(())
    }

    async fn restore_access_entity(&self, statement: &str) -> Result<()> {
        self.query(&create_if_not_exists(statement)).await?;
        Ok(())
    }
}

/// `SHOW ACCESS` prints one statement per line.
fn access_statements(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
