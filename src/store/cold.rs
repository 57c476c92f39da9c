//! 冷层：会话 checkpoint 列表的持久化存储

use crate::error::{Result, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// 冷层中的一条会话记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColdRecord {
    pub conversation_id: String,
    /// 文本信封，见 [`CheckpointCodec::encode_envelope`](crate::checkpoint::CheckpointCodec::encode_envelope)
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ColdRecord {
    pub fn new(conversation_id: impl Into<String>, content: String, now: DateTime<Utc>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            content,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 冷层访问接口
#[async_trait]
pub trait ColdStore: Send + Sync {
    async fn find_by_id(&self, conversation_id: &str) -> Result<Option<ColdRecord>>;

    /// 按 ID 更新，不存在则插入
    async fn upsert(&self, record: &ColdRecord) -> Result<()>;

    async fn find_owner(&self, conversation_id: &str) -> Result<Option<String>>;

    async fn save_owner_association(&self, owner_id: &str, conversation_id: &str) -> Result<()>;

    /// 在同一事务中插入新记录与归属关系
    async fn insert_with_owner(&self, record: &ColdRecord, owner_id: &str) -> Result<()>;

    /// 某个归属者名下的全部会话 ID
    async fn conversations_of(&self, owner_id: &str) -> Result<Vec<String>>;
}

// ── InMemoryColdStore ─────────────────────────────────────────────────────────

#[derive(Default)]
struct ColdTables {
    records: HashMap<String, ColdRecord>,
    /// (owner_id, conversation_id)，按插入顺序
    owners: Vec<(String, String)>,
}

impl ColdTables {
    fn associate(&mut self, owner_id: &str, conversation_id: &str) {
        let exists = self
            .owners
            .iter()
            .any(|(o, c)| o == owner_id && c == conversation_id);
        if !exists {
            self.owners
                .push((owner_id.to_string(), conversation_id.to_string()));
        }
    }
}

/// 进程内冷层，适合测试
#[derive(Default)]
pub struct InMemoryColdStore {
    tables: RwLock<ColdTables>,
}

impl InMemoryColdStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_count(&self) -> usize {
        self.tables.read().await.records.len()
    }
}

#[async_trait]
impl ColdStore for InMemoryColdStore {
    async fn find_by_id(&self, conversation_id: &str) -> Result<Option<ColdRecord>> {
        Ok(self.tables.read().await.records.get(conversation_id).cloned())
    }

    async fn upsert(&self, record: &ColdRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.records.get_mut(&record.conversation_id) {
            Some(existing) => {
                existing.content = record.content.clone();
                existing.updated_at = record.updated_at;
            }
            None => {
                tables
                    .records
                    .insert(record.conversation_id.clone(), record.clone());
            }
        }
        Ok(())
    }

    async fn find_owner(&self, conversation_id: &str) -> Result<Option<String>> {
        Ok(self
            .tables
            .read()
            .await
            .owners
            .iter()
            .find(|(_, c)| c == conversation_id)
            .map(|(o, _)| o.clone()))
    }

    async fn save_owner_association(&self, owner_id: &str, conversation_id: &str) -> Result<()> {
        self.tables.write().await.associate(owner_id, conversation_id);
        Ok(())
    }

    async fn insert_with_owner(&self, record: &ColdRecord, owner_id: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.records.contains_key(&record.conversation_id) {
            return Err(StoreError::ColdWrite(format!(
                "conversation '{}' already exists",
                record.conversation_id
            ))
            .into());
        }
        tables
            .records
            .insert(record.conversation_id.clone(), record.clone());
        tables.associate(owner_id, &record.conversation_id);
        Ok(())
    }

    async fn conversations_of(&self, owner_id: &str) -> Result<Vec<String>> {
        Ok(self
            .tables
            .read()
            .await
            .owners
            .iter()
            .filter(|(o, _)| o == owner_id)
            .map(|(_, c)| c.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_keeps_created_at() {
        let store = InMemoryColdStore::new();
        let t0 = Utc::now();
        store
            .upsert(&ColdRecord::new("c1", "v1".to_string(), t0))
            .await
            .unwrap();

        let t1 = t0 + chrono::Duration::seconds(5);
        let mut update = ColdRecord::new("c1", "v2".to_string(), t1);
        update.created_at = t1;
        store.upsert(&update).await.unwrap();

        let stored = store.find_by_id("c1").await.unwrap().unwrap();
        assert_eq!(stored.content, "v2");
        assert_eq!(stored.created_at, t0);
        assert_eq!(stored.updated_at, t1);
    }

    #[tokio::test]
    async fn test_insert_with_owner_is_all_or_nothing() {
        let store = InMemoryColdStore::new();
        let record = ColdRecord::new("c1", "v".to_string(), Utc::now());
        store.insert_with_owner(&record, "42").await.unwrap();
        assert_eq!(store.find_owner("c1").await.unwrap().as_deref(), Some("42"));

        let err = store.insert_with_owner(&record, "43").await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::CacheError::Store(StoreError::ColdWrite(_))
        ));
        assert_eq!(store.conversations_of("43").await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_owner_listing() {
        let store = InMemoryColdStore::new();
        store.save_owner_association("42", "a").await.unwrap();
        store.save_owner_association("42", "b").await.unwrap();
        store.save_owner_association("42", "a").await.unwrap();
        store.save_owner_association("7", "c").await.unwrap();
        assert_eq!(store.conversations_of("42").await.unwrap(), vec!["a", "b"]);
        assert!(store.find_owner("missing").await.unwrap().is_none());
    }
}
