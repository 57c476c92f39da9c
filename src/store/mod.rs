//! 热层与冷层存储
//!
//! | 层 | 接口 | 实现 |
//! |----|------|------|
//! | 热层（KV） | [`HotStore`] | [`InMemoryHotStore`] / [`RedisHotStore`] |
//! | 冷层（关系型） | [`ColdStore`] | [`InMemoryColdStore`] / [`SqliteColdStore`] |
//!
//! 热层对每个会话保存两样东西：
//! - bucket：编码后的 checkpoint 列表，带兜底 TTL
//! - 元数据 map：目前只有归属者一个字段，独立的兜底 TTL
//!
//! 兜底 TTL 只是安全网，正常情况下会话由过期调度器主动落冷。

pub mod cold;
pub mod redis;
pub mod sqlite;

pub use self::redis::RedisHotStore;
pub use cold::{ColdRecord, ColdStore, InMemoryColdStore};
pub use sqlite::SqliteColdStore;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// 元数据中记录归属者的字段名
pub const OWNER_ID_FIELD: &str = "owner_id";

/// 会话元数据
pub type Meta = HashMap<String, String>;

/// 热层 KV 存储接口
#[async_trait]
pub trait HotStore: Send + Sync {
    async fn get_bucket(&self, conversation_id: &str) -> Result<Option<Vec<u8>>>;

    /// 写入 bucket 并重置 TTL
    async fn set_bucket(&self, conversation_id: &str, content: Vec<u8>, ttl: Duration)
    -> Result<()>;

    async fn delete_bucket(&self, conversation_id: &str) -> Result<()>;

    /// 不存在或为空时返回 `None`
    async fn get_meta(&self, conversation_id: &str) -> Result<Option<Meta>>;

    async fn put_meta(&self, conversation_id: &str, key: &str, value: &str) -> Result<()>;

    /// 为元数据设置 TTL；元数据不存在时无效果
    async fn expire_meta(&self, conversation_id: &str, ttl: Duration) -> Result<()>;

    async fn delete_meta(&self, conversation_id: &str) -> Result<()>;
}

// ── InMemoryHotStore ──────────────────────────────────────────────────────────

struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// 进程内热层，按 TTL 惰性过期，适合测试
#[derive(Default)]
pub struct InMemoryHotStore {
    buckets: RwLock<HashMap<String, Expiring<Vec<u8>>>>,
    metas: RwLock<HashMap<String, Expiring<Meta>>>,
}

impl InMemoryHotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// bucket 剩余存活时间（不存在或无 TTL 时为 `None`）
    pub async fn bucket_ttl(&self, conversation_id: &str) -> Option<Duration> {
        let now = Instant::now();
        self.buckets
            .read()
            .await
            .get(conversation_id)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at - now)
    }

    pub async fn meta_ttl(&self, conversation_id: &str) -> Option<Duration> {
        let now = Instant::now();
        self.metas
            .read()
            .await
            .get(conversation_id)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at - now)
    }
}

#[async_trait]
impl HotStore for InMemoryHotStore {
    async fn get_bucket(&self, conversation_id: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        Ok(self
            .buckets
            .read()
            .await
            .get(conversation_id)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set_bucket(
        &self,
        conversation_id: &str,
        content: Vec<u8>,
        ttl: Duration,
    ) -> Result<()> {
        self.buckets.write().await.insert(
            conversation_id.to_string(),
            Expiring {
                value: content,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete_bucket(&self, conversation_id: &str) -> Result<()> {
        self.buckets.write().await.remove(conversation_id);
        Ok(())
    }

    async fn get_meta(&self, conversation_id: &str) -> Result<Option<Meta>> {
        let now = Instant::now();
        Ok(self
            .metas
            .read()
            .await
            .get(conversation_id)
            .filter(|e| e.is_live(now) && !e.value.is_empty())
            .map(|e| e.value.clone()))
    }

    async fn put_meta(&self, conversation_id: &str, key: &str, value: &str) -> Result<()> {
        let now = Instant::now();
        let mut metas = self.metas.write().await;
        let entry = metas
            .entry(conversation_id.to_string())
            .or_insert_with(|| Expiring {
                value: Meta::new(),
                expires_at: None,
            });
        // 已过期的旧条目等同于不存在
        if !entry.is_live(now) {
            entry.value.clear();
            entry.expires_at = None;
        }
        entry.value.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn expire_meta(&self, conversation_id: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        if let Some(entry) = self.metas.write().await.get_mut(conversation_id) {
            if entry.is_live(now) {
                entry.expires_at = Some(now + ttl);
            }
        }
        Ok(())
    }

    async fn delete_meta(&self, conversation_id: &str) -> Result<()> {
        self.metas.write().await.remove(conversation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_expires_after_ttl() {
        let store = InMemoryHotStore::new();
        store
            .set_bucket("c1", vec![1, 2, 3], Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(store.get_bucket("c1").await.unwrap(), Some(vec![1, 2, 3]));
        assert!(store.bucket_ttl("c1").await.unwrap() <= Duration::from_millis(30));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get_bucket("c1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_meta_fields_and_expiry() {
        let store = InMemoryHotStore::new();
        assert!(store.get_meta("c1").await.unwrap().is_none());

        store.put_meta("c1", OWNER_ID_FIELD, "42").await.unwrap();
        assert!(store.meta_ttl("c1").await.is_none());
        store.expire_meta("c1", Duration::from_millis(30)).await.unwrap();

        let meta = store.get_meta("c1").await.unwrap().unwrap();
        assert_eq!(meta.get(OWNER_ID_FIELD).map(String::as_str), Some("42"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get_meta("c1").await.unwrap().is_none());

        // 过期后重新写入不会带回旧字段或旧 TTL
        store.put_meta("c1", "other", "x").await.unwrap();
        let meta = store.get_meta("c1").await.unwrap().unwrap();
        assert_eq!(meta.len(), 1);
        assert!(store.meta_ttl("c1").await.is_none());
    }

    #[tokio::test]
    async fn test_expire_missing_meta_is_noop_and_delete() {
        let store = InMemoryHotStore::new();
        store.expire_meta("ghost", Duration::from_secs(1)).await.unwrap();
        assert!(store.get_meta("ghost").await.unwrap().is_none());

        store.put_meta("c1", OWNER_ID_FIELD, "7").await.unwrap();
        store.set_bucket("c1", vec![0], Duration::from_secs(1)).await.unwrap();
        store.delete_meta("c1").await.unwrap();
        store.delete_bucket("c1").await.unwrap();
        assert!(store.get_meta("c1").await.unwrap().is_none());
        assert!(store.get_bucket("c1").await.unwrap().is_none());
    }
}
