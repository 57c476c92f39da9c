//! Redis 锁：`SET key token NX PX lease` 获取，Lua 比较后删除释放。

use super::{LockGateway, LockToken};
use crate::error::{LockError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// 仅当值仍为自己的令牌时才删除，避免误删租约过期后被他人重新获取的锁
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

pub struct RedisLock {
    conn: ConnectionManager,
    lease: Duration,
}

impl RedisLock {
    pub fn new(conn: ConnectionManager, lease: Duration) -> Self {
        Self { conn, lease }
    }

    async fn set_nx(&self, token: &LockToken) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(&token.name)
            .arg(&token.owner)
            .arg("NX")
            .arg("PX")
            .arg(self.lease.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl LockGateway for RedisLock {
    async fn try_lock(&self, name: &str, timeout: Duration) -> Result<Option<LockToken>> {
        let token = LockToken::new(name);
        let deadline = Instant::now() + timeout;
        loop {
            if self.set_nx(&token).await? {
                debug!(lock = %name, "🔒 获取锁");
                return Ok(Some(token));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RETRY_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn unlock(&self, token: &LockToken) -> Result<()> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::cmd("EVAL")
            .arg(RELEASE_SCRIPT)
            .arg(1)
            .arg(&token.name)
            .arg(&token.owner)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        if deleted == 0 {
            debug!(lock = %token.name, "锁已不属于当前持有者（租约可能已过期）");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::redis::connect;

    async fn redis_lock() -> Option<RedisLock> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let conn = tokio::time::timeout(Duration::from_secs(1), connect(&url))
            .await
            .ok()?
            .ok()?;
        Some(RedisLock::new(conn, Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_redis_lock_excludes_second_holder() {
        let Some(lock) = redis_lock().await else {
            eprintln!("Redis 不可用，跳过");
            return;
        };
        let name = format!("test:lock:{}", uuid::Uuid::new_v4());
        let token = lock.try_lock(&name, Duration::from_millis(100)).await.unwrap().unwrap();
        assert!(lock.try_lock(&name, Duration::from_millis(100)).await.unwrap().is_none());

        lock.unlock(&token).await.unwrap();
        let again = lock.try_lock(&name, Duration::from_millis(100)).await.unwrap().unwrap();
        lock.unlock(&again).await.unwrap();
    }
}
