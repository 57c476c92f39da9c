//! Redis 热层
//!
//! key 布局见 [`KeyLayout`]：
//! - `content_prefix + id`：二进制字符串，`SET ... PX`
//! - `meta_prefix + id`：hash，`HSET` + `PEXPIRE`

use super::{HotStore, Meta};
use crate::config::KeyLayout;
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::info;

/// 建立带自动重连的连接，锁、热层和延迟队列可共享同一个管理器
pub async fn connect(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url).map_err(|e| StoreError::Hot(e.to_string()))?;
    let conn = client
        .get_connection_manager()
        .await
        .map_err(|e| StoreError::Hot(e.to_string()))?;
    info!(url = %url, "🔌 已连接 Redis");
    Ok(conn)
}

pub struct RedisHotStore {
    conn: ConnectionManager,
    keys: KeyLayout,
}

impl RedisHotStore {
    pub fn new(conn: ConnectionManager, keys: KeyLayout) -> Self {
        Self { conn, keys }
    }
}

fn hot_err(e: redis::RedisError) -> crate::error::CacheError {
    StoreError::Hot(e.to_string()).into()
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl HotStore for RedisHotStore {
    async fn get_bucket(&self, conversation_id: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(self.keys.content_key(conversation_id))
            .query_async::<Option<Vec<u8>>>(&mut conn)
            .await
            .map_err(hot_err)
    }

    async fn set_bucket(
        &self,
        conversation_id: &str,
        content: Vec<u8>,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.keys.content_key(conversation_id))
            .arg(content)
            .arg("PX")
            .arg(millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(hot_err)
    }

    async fn delete_bucket(&self, conversation_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(self.keys.content_key(conversation_id))
            .query_async::<()>(&mut conn)
            .await
            .map_err(hot_err)
    }

    async fn get_meta(&self, conversation_id: &str) -> Result<Option<Meta>> {
        let mut conn = self.conn.clone();
        let meta: Meta = redis::cmd("HGETALL")
            .arg(self.keys.meta_key(conversation_id))
            .query_async(&mut conn)
            .await
            .map_err(hot_err)?;
        Ok((!meta.is_empty()).then_some(meta))
    }

    async fn put_meta(&self, conversation_id: &str, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(self.keys.meta_key(conversation_id))
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(hot_err)
    }

    async fn expire_meta(&self, conversation_id: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PEXPIRE")
            .arg(self.keys.meta_key(conversation_id))
            .arg(millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(hot_err)
    }

    async fn delete_meta(&self, conversation_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(self.keys.meta_key(conversation_id))
            .query_async::<()>(&mut conn)
            .await
            .map_err(hot_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OWNER_ID_FIELD;

    async fn redis_store() -> Option<RedisHotStore> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let conn = tokio::time::timeout(Duration::from_secs(1), connect(&url))
            .await
            .ok()?
            .ok()?;
        let prefix = format!("test:{}:", uuid::Uuid::new_v4());
        let keys = KeyLayout {
            content_prefix: format!("{prefix}content:"),
            meta_prefix: format!("{prefix}meta:"),
            lock_prefix: format!("{prefix}lock:"),
            queue_key: format!("{prefix}queue"),
        };
        Some(RedisHotStore::new(conn, keys))
    }

    #[tokio::test]
    async fn test_redis_bucket_and_meta_round_trip() {
        let Some(store) = redis_store().await else {
            eprintln!("Redis 不可用，跳过");
            return;
        };
        let ttl = Duration::from_secs(10);

        assert!(store.get_bucket("c1").await.unwrap().is_none());
        store.set_bucket("c1", vec![0, 0, 0, 0], ttl).await.unwrap();
        assert_eq!(store.get_bucket("c1").await.unwrap(), Some(vec![0, 0, 0, 0]));

        assert!(store.get_meta("c1").await.unwrap().is_none());
        store.put_meta("c1", OWNER_ID_FIELD, "42").await.unwrap();
        store.expire_meta("c1", ttl).await.unwrap();
        let meta = store.get_meta("c1").await.unwrap().unwrap();
        assert_eq!(meta[OWNER_ID_FIELD], "42");

        store.delete_bucket("c1").await.unwrap();
        store.delete_meta("c1").await.unwrap();
        assert!(store.get_bucket("c1").await.unwrap().is_none());
        assert!(store.get_meta("c1").await.unwrap().is_none());
    }
}
