//! In-process object store for tests and dry runs.

use super::{paginate, validate_key, ListPage, StorageBackend};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<String, Bytes>>,
    puts: AtomicU64,
    /// Number of upcoming `put` calls that fail with a transient error.
    failing_puts: AtomicU32,
    /// Keys whose `get` always fails.
    broken_keys: Mutex<HashSet<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful `put` calls so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Make the next `n` puts fail with a transient error.
    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Make every `get` of `key` fail permanently.
    pub fn break_key(&self, key: &str) {
        if let Ok(mut broken) = self.broken_keys.lock() {
            broken.insert(key.to_string());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Bytes>> {
        // A poisoned map is still structurally valid.
        self.objects.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn label(&self) -> &str {
        "memory"
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        validate_key(key)?;
        let should_fail = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BackupError::TransientStorage(format!("injected failure for {key}")));
        }
        self.lock().insert(key.to_string(), data);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn put_new(&self, key: &str, data: Bytes) -> Result<bool> {
        validate_key(key)?;
        let mut objects = self.lock();
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(key.to_string(), data);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        validate_key(key)?;
        let broken = self
            .broken_keys
            .lock()
            .map(|b| b.contains(key))
            .unwrap_or(false);
        if broken {
            return Err(BackupError::Storage(format!("injected read failure for {key}")));
        }
        Ok(self.lock().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.lock().remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.lock().contains_key(key))
    }

    async fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        let keys = self
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(paginate(keys, prefix, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn injected_put_failures_are_transient() {
        let backend = MemoryBackend::new();
        backend.fail_next_puts(2);

        for _ in 0..2 {
            let err = backend.put("data/aa/aa", Bytes::new()).await.unwrap_err();
            assert!(err.is_transient());
        }
        backend.put("data/aa/aa", Bytes::new()).await.unwrap();
        assert_eq!(backend.put_count(), 1);
    }

    #[tokio::test]
    async fn broken_key_fails_reads() {
        let backend = MemoryBackend::new();
        backend.put("data/aa/aa", Bytes::from_static(b"x")).await.unwrap();
        backend.break_key("data/aa/aa");
        assert!(backend.get("data/aa/aa").await.is_err());
        assert!(backend.exists("data/aa/aa").await.unwrap());
    }
}
