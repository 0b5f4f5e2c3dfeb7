//! Decorator that applies a [`RetryPolicy`] to every backend call.

use super::{ListPage, StorageBackend};
use crate::retry::RetryPolicy;
use crate::utils::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub struct RetryingBackend<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B: StorageBackend> RetryingBackend<B> {
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

#[async_trait]
impl<B: StorageBackend> StorageBackend for RetryingBackend<B> {
    fn label(&self) -> &str {
        self.inner.label()
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.policy
            .run(&format!("put {key}"), || self.inner.put(key, data.clone()))
            .await
    }

    async fn put_new(&self, key: &str, data: Bytes) -> Result<bool> {
        self.policy
            .run(&format!("put_new {key}"), || self.inner.put_new(key, data.clone()))
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.policy
            .run(&format!("get {key}"), || self.inner.get(key))
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.policy
            .run(&format!("delete {key}"), || self.inner.delete(key))
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.policy
            .run(&format!("exists {key}"), || self.inner.exists(key))
            .await
    }

    async fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        self.policy
            .run(&format!("list {prefix}"), || self.inner.list_page(prefix, token))
            .await
    }
}
