//! 写入变慢的热层，用于制造锁竞争。

use crate::error::Result;
use crate::store::{HotStore, InMemoryHotStore, Meta};
use async_trait::async_trait;
use std::time::Duration;

/// 包装 [`InMemoryHotStore`]，每次 `set_bucket` 前先等待 `write_delay`
pub struct SlowHotStore {
    inner: InMemoryHotStore,
    write_delay: Duration,
}

impl SlowHotStore {
    pub fn new(write_delay: Duration) -> Self {
        Self {
            inner: InMemoryHotStore::new(),
            write_delay,
        }
    }

    pub fn inner(&self) -> &InMemoryHotStore {
        &self.inner
    }
}

#[async_trait]
impl HotStore for SlowHotStore {
    async fn get_bucket(&self, conversation_id: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get_bucket(conversation_id).await
    }

    async fn set_bucket(
        &self,
        conversation_id: &str,
        content: Vec<u8>,
        ttl: Duration,
    ) -> Result<()> {
        tokio::time::sleep(self.write_delay).await;
        self.inner.set_bucket(conversation_id, content, ttl).await
    }

    async fn delete_bucket(&self, conversation_id: &str) -> Result<()> {
        self.inner.delete_bucket(conversation_id).await
    }

    async fn get_meta(&self, conversation_id: &str) -> Result<Option<Meta>> {
        self.inner.get_meta(conversation_id).await
    }

    async fn put_meta(&self, conversation_id: &str, key: &str, value: &str) -> Result<()> {
        self.inner.put_meta(conversation_id, key, value).await
    }

    async fn expire_meta(&self, conversation_id: &str, ttl: Duration) -> Result<()> {
        self.inner.expire_meta(conversation_id, ttl).await
    }

    async fn delete_meta(&self, conversation_id: &str) -> Result<()> {
        self.inner.delete_meta(conversation_id).await
    }
}
