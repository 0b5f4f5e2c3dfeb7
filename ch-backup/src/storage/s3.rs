//! S3-compatible object store.
//!
//! Requests are presigned with `rusty_s3` and sent with reqwest. Listing uses
//! ListObjectsV2, with the continuation token as the page token.

use super::{validate_key, ListPage, StorageBackend, LIST_PAGE_SIZE};
use crate::config::StorageConfig;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{RequestBuilder, Response, StatusCode};
use rusty_s3::actions::{ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};
use std::time::Duration;

/// Validity of presigned URLs.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

pub struct S3Backend {
    bucket: Bucket,
    credentials: Credentials,
    client: reqwest::Client,
    /// Prefix prepended to every key, without slashes at either end
    root: String,
}

impl S3Backend {
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| BackupError::Config("storage.endpoint is not set".into()))?;
        let bucket_name = config
            .bucket
            .as_deref()
            .ok_or_else(|| BackupError::Config("storage.bucket is not set".into()))?;

        let base_url = endpoint.parse().map_err(|e| {
            BackupError::Config(format!("invalid storage.endpoint '{endpoint}': {e}"))
        })?;
        // Endpoints are always explicit, so path-style addressing works everywhere.
        let bucket = Bucket::new(
            base_url,
            UrlStyle::Path,
            bucket_name.to_string(),
            config.region.clone(),
        )
        .map_err(|e| BackupError::Config(format!("invalid S3 bucket: {e}")))?;

        let credentials = Credentials::new(
            config.access_key_id.clone().unwrap_or_default(),
            config.secret_access_key.clone().unwrap_or_default(),
        );

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            bucket,
            credentials,
            client,
            root: config.root.trim_matches('/').to_string(),
        })
    }

    fn full_key(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        Ok(if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        })
    }

    /// Inverse of `full_key` for listed keys. `None` for keys outside the root.
    fn relative_key<'k>(&self, full: &'k str) -> Option<&'k str> {
        if self.root.is_empty() {
            return Some(full);
        }
        full.strip_prefix(self.root.as_str())?.strip_prefix('/')
    }

    async fn send(&self, op: &str, key: &str, req: RequestBuilder) -> Result<Response> {
        req.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() || e.is_request() {
                BackupError::TransientStorage(format!("S3 {op} {key}: {e}"))
            } else {
                BackupError::Http(e)
            }
        })
    }
}

/// 429, 5xx and S3's 409 for racing conditional writes are worth retrying.
fn status_error(op: &str, key: &str, status: StatusCode) -> BackupError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::CONFLICT
        || status.is_server_error()
    {
        BackupError::TransientStorage(format!("S3 {op} {key}: HTTP {status}"))
    } else {
        BackupError::Storage(format!("S3 {op} {key}: HTTP {status}"))
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn label(&self) -> &str {
        "s3"
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let url = self
            .bucket
            .put_object(Some(&self.credentials), &self.full_key(key)?)
            .sign(PRESIGN_DURATION);
        let resp = self
            .send("PUT", key, self.client.put(url.as_str()).body(data))
            .await?;
        if !resp.status().is_success() {
            return Err(status_error("PUT", key, resp.status()));
        }
        Ok(())
    }

    /// Conditional write with `If-None-Match: *`.
    async fn put_new(&self, key: &str, data: Bytes) -> Result<bool> {
        let full_key = self.full_key(key)?;
        let mut action = self.bucket.put_object(Some(&self.credentials), &full_key);
        action.headers_mut().insert("if-none-match", "*");
        let url = action.sign(PRESIGN_DURATION);

        let req = self
            .client
            .put(url.as_str())
            .header("if-none-match", "*")
            .body(data);
        let resp = self.send("PUT", key, req).await?;
        match resp.status() {
            StatusCode::PRECONDITION_FAILED => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(status_error("PUT", key, s)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &self.full_key(key)?)
            .sign(PRESIGN_DURATION);
        let resp = self.send("GET", key, self.client.get(url.as_str())).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body = resp
                    .bytes()
                    .await
                    .map_err(|e| BackupError::TransientStorage(format!("S3 GET {key} body: {e}")))?;
                Ok(Some(body))
            }
            s => Err(status_error("GET", key, s)),
        }
    }

    /// S3 answers 204 whether or not the key existed, so existence is
    /// probed first.
    async fn delete(&self, key: &str) -> Result<bool> {
        if !self.exists(key).await? {
            return Ok(false);
        }
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), &self.full_key(key)?)
            .sign(PRESIGN_DURATION);
        let resp = self
            .send("DELETE", key, self.client.delete(url.as_str()))
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(status_error("DELETE", key, s)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let url = self
            .bucket
            .head_object(Some(&self.credentials), &self.full_key(key)?)
            .sign(PRESIGN_DURATION);
        let resp = self.send("HEAD", key, self.client.head(url.as_str())).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(status_error("HEAD", key, s)),
        }
    }

    async fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        let full_prefix = if self.root.is_empty() {
            prefix.to_string()
        } else {
            format!("{}/{}", self.root, prefix)
        };
        let max_keys = LIST_PAGE_SIZE.to_string();

        let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
        action.query_mut().insert("prefix", full_prefix.as_str());
        action.query_mut().insert("max-keys", max_keys.as_str());
        if let Some(token) = token {
            action.query_mut().insert("continuation-token", token);
        }
        let url = action.sign(PRESIGN_DURATION);

        let resp = self.send("LIST", prefix, self.client.get(url.as_str())).await?;
        if !resp.status().is_success() {
            return Err(status_error("LIST", prefix, resp.status()));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| BackupError::TransientStorage(format!("S3 LIST {prefix} body: {e}")))?;
        let parsed = ListObjectsV2::parse_response(&body[..])
            .map_err(|e| BackupError::Storage(format!("S3 LIST {prefix}: bad response: {e}")))?;

        let keys = parsed
            .contents
            .iter()
            // Directory markers created by other tools
            .filter(|obj| !obj.key.ends_with('/'))
            .filter_map(|obj| self.relative_key(&obj.key))
            .map(str::to_string)
            .collect();
        Ok(ListPage {
            keys,
            next_token: parsed.next_continuation_token,
        })
    }
}
