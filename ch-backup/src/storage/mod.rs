//! Object storage abstraction.
//!
//! Content objects live under `data/<hash[0..2]>/<hash>` and manifests under
//! `backups/<backup_id>/manifest.json`. Every backend operation is idempotent so
//! callers can retry freely.

pub mod local;
pub mod memory;
pub mod retrying;
pub mod s3;

use crate::config::{Config, StorageKind};
use crate::retry::RetryPolicy;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use retrying::RetryingBackend;
pub use s3::S3Backend;

/// Prefix of content-addressed objects.
pub const CONTENT_PREFIX: &str = "data/";

/// Prefix of backup manifests.
pub const BACKUPS_PREFIX: &str = "backups/";

/// Keys returned per `list_page` call.
pub const LIST_PAGE_SIZE: usize = 1000;

/// One page of a listing. `next_token` is `None` on the last page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub next_token: Option<String>,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name used in log lines.
    fn label(&self) -> &str;

    /// Store `data` under `key`, replacing any previous value.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Store `data` only if `key` does not exist yet. Returns `false` when it
    /// already exists. The default is not atomic; backends that can make it
    /// conditional override it.
    async fn put_new(&self, key: &str, data: Bytes) -> Result<bool> {
        if self.exists(key).await? {
            return Ok(false);
        }
        self.put(key, data).await?;
        Ok(true)
    }

    /// Fetch the object, `None` when it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Remove the object. Returns `false` when it did not exist.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Keys starting with `prefix`, in lexicographic order, continuing from
    /// the `next_token` of the previous page when given.
    async fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage>;
}

/// Lazily list every key under `prefix`, one page at a time.
pub fn list_keys<'a>(
    storage: &'a dyn StorageBackend,
    prefix: &'a str,
) -> BoxStream<'a, Result<String>> {
    // State: None = finished, Some(token) = fetch the page after token.
    stream::try_unfold(Some(None::<String>), move |state| async move {
        let Some(token) = state else {
            return Ok(None);
        };
        let page = storage.list_page(prefix, token.as_deref()).await?;
        let next = page.next_token.map(Some);
        Ok::<_, BackupError>(Some((
            stream::iter(page.keys.into_iter().map(Ok::<_, BackupError>)),
            next,
        )))
    })
    .try_flatten()
    .boxed()
}

/// Reject keys that could escape a backend root.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(BackupError::Storage("empty storage key".into()));
    }
    if key.starts_with('/') || key.contains('\\') || key.contains('\0') {
        return Err(BackupError::Storage(format!("invalid storage key: {key}")));
    }
    if key.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
        return Err(BackupError::Storage(format!("invalid storage key: {key}")));
    }
    Ok(())
}

/// Paginate an in-memory sorted key list, shared by the local and memory backends.
pub(crate) fn paginate(mut keys: Vec<String>, prefix: &str, token: Option<&str>) -> ListPage {
    keys.retain(|k| k.starts_with(prefix) && token.map_or(true, |t| k.as_str() > t));
    keys.sort();
    if keys.len() > LIST_PAGE_SIZE {
        keys.truncate(LIST_PAGE_SIZE);
        let next_token = keys.last().cloned();
        ListPage { keys, next_token }
    } else {
        ListPage {
            keys,
            next_token: None,
        }
    }
}

/// Build the configured backend, wrapped in the retry policy.
pub fn backend_from_config(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let policy = RetryPolicy::from_config(&config.retry);
    let backend: Arc<dyn StorageBackend> = match config.storage.kind {
        StorageKind::Local => Arc::new(RetryingBackend::new(
            LocalBackend::new(&config.storage.path)?,
            policy,
        )),
        StorageKind::S3 => Arc::new(RetryingBackend::new(
            S3Backend::from_config(&config.storage)?,
            policy,
        )),
    };
    tracing::debug!(backend = backend.label(), "Storage backend ready");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_key_rejects_unsafe_keys() {
        for key in ["", "/abs", "a/../b", "a//b", "./a", "a\\b", "a/"] {
            assert!(validate_key(key).is_err(), "{key:?} should be rejected");
        }
    }

    #[test]
    fn validate_key_accepts_layout_keys() {
        for key in ["data/ab/abcdef", "backups/20240101T000000-1a2b/manifest.json"] {
            assert!(validate_key(key).is_ok(), "{key:?} should be accepted");
        }
    }

    #[test]
    fn paginate_resumes_after_token() {
        let keys: Vec<String> = (0..LIST_PAGE_SIZE + 5).map(|i| format!("k/{i:05}")).collect();
        let first = paginate(keys.clone(), "k/", None);
        assert_eq!(first.keys.len(), LIST_PAGE_SIZE);
        let token = first.next_token.clone().unwrap();

        let second = paginate(keys, "k/", Some(&token));
        assert_eq!(second.keys.len(), 5);
        assert!(second.next_token.is_none());
        assert!(second.keys[0] > token);
    }

    #[tokio::test]
    async fn list_keys_walks_all_pages() {
        let storage = MemoryBackend::new();
        for i in 0..(LIST_PAGE_SIZE * 2 + 3) {
            storage
                .put(&format!("data/{i:06}"), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        storage
            .put("backups/b1/manifest.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let keys: Vec<String> = list_keys(&storage, CONTENT_PREFIX).try_collect().await.unwrap();
        assert_eq!(keys.len(), LIST_PAGE_SIZE * 2 + 3);
        assert!(keys.iter().all(|k| k.starts_with(CONTENT_PREFIX)));
    }
}
