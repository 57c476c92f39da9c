//! 可注入写失败的冷层，用于测试"先写冷层、后删热层"的顺序保证。

use crate::error::{Result, StoreError};
use crate::store::{ColdRecord, ColdStore, InMemoryColdStore};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// 包装 [`InMemoryColdStore`]，写操作可被切换为失败
#[derive(Default)]
pub struct FlakyColdStore {
    inner: InMemoryColdStore,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl FlakyColdStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后的写操作全部返回 `ColdWrite` 错误
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// 成功或失败的写入尝试次数
    pub fn write_attempts(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryColdStore {
        &self.inner
    }

    fn check_write(&self) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::ColdWrite("injected write failure".to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl ColdStore for FlakyColdStore {
    async fn find_by_id(&self, conversation_id: &str) -> Result<Option<ColdRecord>> {
        self.inner.find_by_id(conversation_id).await
    }

    async fn upsert(&self, record: &ColdRecord) -> Result<()> {
        self.check_write()?;
        self.inner.upsert(record).await
    }

    async fn find_owner(&self, conversation_id: &str) -> Result<Option<String>> {
        self.inner.find_owner(conversation_id).await
    }

    async fn save_owner_association(&self, owner_id: &str, conversation_id: &str) -> Result<()> {
        self.check_write()?;
        self.inner.save_owner_association(owner_id, conversation_id).await
    }

    async fn insert_with_owner(&self, record: &ColdRecord, owner_id: &str) -> Result<()> {
        self.check_write()?;
        self.inner.insert_with_owner(record, owner_id).await
    }

    async fn conversations_of(&self, owner_id: &str) -> Result<Vec<String>> {
        self.inner.conversations_of(owner_id).await
    }
}
