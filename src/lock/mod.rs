//! 会话级分布式锁
//!
//! 每个会话 ID 对应一把带前缀的锁，获取时最多等待 `timeout`，
//! 不存在跨会话的锁。调用方通过 [`with_lock`] 使用锁：
//! 获取 → 执行 → 无论成功、失败还是 panic 都释放。
//!
//! | 类型 | 说明 |
//! |------|------|
//! | [`InMemoryLock`] | 进程内实现，适合测试与单机部署 |
//! | [`RedisLock`] | `SET NX PX` + 持有者令牌，可跨进程 |

pub mod redis;

pub use self::redis::RedisLock;

use crate::error::Result;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

/// 一次成功获取的凭证，释放时用于校验持有者
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub name: String,
    pub owner: String,
}

impl LockToken {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            owner: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// 分布式互斥锁能力集
#[async_trait]
pub trait LockGateway: Send + Sync {
    /// 最多等待 `timeout` 尝试获取锁；超时返回 `None`
    async fn try_lock(&self, name: &str, timeout: Duration) -> Result<Option<LockToken>>;

    /// 释放锁；仅当令牌仍是当前持有者时生效
    async fn unlock(&self, token: &LockToken) -> Result<()>;
}

/// 在锁保护下执行 `op`，未获取到锁时返回 `Ok(None)`
///
/// `op` 的所有退出路径（包括 panic）都会先释放锁。
pub async fn with_lock<T, F, Fut>(
    gateway: &dyn LockGateway,
    name: &str,
    timeout: Duration,
    op: F,
) -> Result<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let Some(token) = gateway.try_lock(name, timeout).await? else {
        return Ok(None);
    };

    let outcome = AssertUnwindSafe(op()).catch_unwind().await;

    if let Err(e) = gateway.unlock(&token).await {
        warn!(lock = %name, error = %e, "⚠️ 释放锁失败，等待租约过期");
    }

    match outcome {
        Ok(result) => result.map(Some),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

// ── InMemoryLock ──────────────────────────────────────────────────────────────

/// 进程内锁，语义与 Redis 实现一致
#[derive(Default)]
pub struct InMemoryLock {
    held: Mutex<HashMap<String, String>>,
    released: Notify,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).contains_key(name)
    }

    fn acquire_now(&self, token: &LockToken) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.contains_key(&token.name) {
            return false;
        }
        held.insert(token.name.clone(), token.owner.clone());
        true
    }
}

#[async_trait]
impl LockGateway for InMemoryLock {
    async fn try_lock(&self, name: &str, timeout: Duration) -> Result<Option<LockToken>> {
        let token = LockToken::new(name);
        let deadline = Instant::now() + timeout;
        loop {
            // 先登记等待再检查，避免错过检查与等待之间的释放通知
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.acquire_now(&token) {
                return Ok(Some(token));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn unlock(&self, token: &LockToken) -> Result<()> {
        let removed = {
            let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            match held.get(&token.name) {
                Some(owner) if *owner == token.owner => held.remove(&token.name).is_some(),
                _ => false,
            }
        };
        if removed {
            self.released.notify_waiters();
        }
        Ok(())
    }
}
