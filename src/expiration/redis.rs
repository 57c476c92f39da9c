//! Redis 延迟队列
//!
//! 有序集合，score 为到期时间（Unix 毫秒），成员为 `<job uuid>:<conversation id>`，
//! 因此同一会话的多个任务可以共存。取出通过 Lua 脚本原子完成，
//! 多个进程同时消费时每个任务只会被一个消费者拿到。

use super::DelayQueue;
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use std::time::Duration;

const TAKE_DUE_SCRIPT: &str = r#"
local items = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
if #items > 0 then
    redis.call('ZREM', KEYS[1], unpack(items))
end
return items
"#;

pub struct RedisDelayQueue {
    conn: ConnectionManager,
    queue_key: String,
}

impl RedisDelayQueue {
    pub fn new(conn: ConnectionManager, queue_key: impl Into<String>) -> Self {
        Self {
            conn,
            queue_key: queue_key.into(),
        }
    }
}

fn queue_err(e: redis::RedisError) -> crate::error::CacheError {
    StoreError::Queue(e.to_string()).into()
}

/// 去掉成员前缀的任务 ID，得到会话 ID
fn conversation_of(member: &str) -> &str {
    member.split_once(':').map_or(member, |(_, id)| id)
}

#[async_trait]
impl DelayQueue for RedisDelayQueue {
    async fn offer(&self, conversation_id: &str, delay: Duration) -> Result<()> {
        let fire_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let member = format!("{}:{}", uuid::Uuid::new_v4().simple(), conversation_id);
        let mut conn = self.conn.clone();
        redis::cmd("ZADD")
            .arg(&self.queue_key)
            .arg(fire_at)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await
            .map_err(queue_err)
    }

    async fn take_due(&self, limit: usize) -> Result<Vec<String>> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("EVAL")
            .arg(TAKE_DUE_SCRIPT)
            .arg(1)
            .arg(&self.queue_key)
            .arg(now)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(queue_err)?;
        Ok(members
            .iter()
            .map(|m| conversation_of(m).to_string())
            .collect())
    }

    async fn pending(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        redis::cmd("ZCARD")
            .arg(&self.queue_key)
            .query_async::<usize>(&mut conn)
            .await
            .map_err(queue_err)
    }
}
