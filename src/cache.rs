//! 会话生命周期控制器
//!
//! 调用方唯一直接使用的组件。每个操作都在会话级锁内完成"读-改-写"：
//!
//! ```text
//!             put / get（首次接触）                 close（手动或过期任务）
//!   ABSENT ───────────────────────────▶ HOT ───────────────────────────▶ 冷层
//!     ▲                                  ▲                                │
//!     └──────── close 后从缓存视角消失    └──────── reload ◀──────────────┘
//! ```
//!
//! 锁超时的降级策略：
//!
//! | 操作 | 锁超时时 |
//! |------|----------|
//! | `list` | 返回空列表 |
//! | `get` | 返回 `None` |
//! | `put` | 丢弃写入，返回 [`PutOutcome::LockBusy`] |
//! | `close_conversation` | 空操作，返回 [`CloseOutcome::LockBusy`] |
//! | `reload_conversation` | 报错 [`LockError::Timeout`] |

use crate::checkpoint::{
    CheckpointCodec, CheckpointSelector, CheckpointSerializer, LatestCheckpoint, RunContext,
};
use crate::config::{CacheConfig, CacheSettings, KeyLayout};
use crate::error::{ConfigError, ConversationError, LockError, Result};
use crate::expiration::{
    DelayQueue, ExpirationHandler, ExpirationScheduler, ExpirationWorker, WorkerHandle,
};
use crate::lock::{LockGateway, with_lock};
use crate::store::{ColdRecord, ColdStore, HotStore, OWNER_ID_FIELD};
use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// `put` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// 已写入热层；`first_admission` 表示本次写入让会话首次进入热层并安排了过期任务
    Stored { first_admission: bool },
    /// 未能在超时内获取锁，本次写入被丢弃
    LockBusy,
}

/// `close_conversation` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// 已落冷并清除热层
    Flushed { checkpoints: usize },
    /// 热层中没有该会话
    NotCached,
    /// 未能获取锁，本次不做任何事
    LockBusy,
}

/// `reload_conversation` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Reloaded { checkpoints: usize },
    /// 会话已在热层，未覆盖
    AlreadyHot,
}

fn require_id(conversation_id: &str) -> Result<()> {
    if conversation_id.trim().is_empty() {
        return Err(ConversationError::EmptyId.into());
    }
    Ok(())
}

// ── ConversationCache ─────────────────────────────────────────────────────────

/// 热层 + 冷层的会话 checkpoint 缓存
pub struct ConversationCache<S: CheckpointSerializer> {
    codec: CheckpointCodec<S>,
    hot: Arc<dyn HotStore>,
    cold: Arc<dyn ColdStore>,
    locks: Arc<dyn LockGateway>,
    queue: Arc<dyn DelayQueue>,
    scheduler: ExpirationScheduler,
    selector: Arc<dyn CheckpointSelector<S::Checkpoint>>,
    settings: CacheSettings,
    keys: KeyLayout,
}

impl<S: CheckpointSerializer> ConversationCache<S> {
    pub fn builder(serializer: S) -> ConversationCacheBuilder<S> {
        ConversationCacheBuilder {
            serializer,
            hot: None,
            cold: None,
            locks: None,
            queue: None,
            selector: None,
            settings: CacheSettings::default(),
            keys: KeyLayout::default(),
        }
    }

    pub fn settings(&self) -> CacheSettings {
        self.settings
    }

    /// 返回会话在热层中的完整列表（最新在前）
    pub async fn list(&self, conversation_id: &str) -> Result<Vec<S::Checkpoint>> {
        require_id(conversation_id)?;
        let listed = self
            .locked(conversation_id, || self.read_bucket(conversation_id))
            .await?;
        Ok(listed.unwrap_or_else(|| {
            warn!(conversation_id = %conversation_id, "⚠️ list 获取锁超时，返回空列表");
            Vec::new()
        }))
    }

    /// 按选择器返回一个 checkpoint
    ///
    /// 热层中没有该会话时视为首次接触：记录归属者，返回 `None`。
    pub async fn get(&self, ctx: &RunContext) -> Result<Option<S::Checkpoint>> {
        let id = ctx.conversation_id.as_str();
        require_id(id)?;
        debug!(conversation_id = %id, "get");

        let Some(selected) = self.locked(id, || self.get_locked(ctx)).await? else {
            warn!(conversation_id = %id, "⚠️ get 获取锁超时，视为无 checkpoint");
            return Ok(None);
        };
        Ok(selected)
    }

    /// 将 checkpoint 插入列表头部
    pub async fn put(&self, ctx: &RunContext, checkpoint: S::Checkpoint) -> Result<PutOutcome> {
        let id = ctx.conversation_id.as_str();
        require_id(id)?;
        debug!(conversation_id = %id, "put");

        match self
            .locked(id, move || self.put_locked(ctx, checkpoint))
            .await?
        {
            Some(first_admission) => Ok(PutOutcome::Stored { first_admission }),
            None => {
                warn!(conversation_id = %id, "⚠️ put 获取锁超时，本次写入被丢弃");
                Ok(PutOutcome::LockBusy)
            }
        }
    }

    /// 热层 → 冷层：先写冷层，成功后再删除热层数据
    pub async fn close_conversation(&self, conversation_id: &str) -> Result<CloseOutcome> {
        require_id(conversation_id)?;
        let outcome = self
            .locked(conversation_id, || self.close_locked(conversation_id))
            .await?;
        Ok(outcome.unwrap_or_else(|| {
            warn!(conversation_id = %conversation_id, "⚠️ close 获取锁超时，跳过本次落冷");
            CloseOutcome::LockBusy
        }))
    }

    /// 冷层 → 热层，并安排新的过期任务
    pub async fn reload_conversation(&self, conversation_id: &str) -> Result<ReloadOutcome> {
        require_id(conversation_id)?;

        let record = self
            .cold
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| ConversationError::NotFound(conversation_id.to_string()))?;
        let owner_id = self
            .cold
            .find_owner(conversation_id)
            .await?
            .ok_or_else(|| ConversationError::OwnerNotFound(conversation_id.to_string()))?;
        let checkpoints = self.codec.decode_envelope(&record.content)?;

        let owner = owner_id.as_str();
        let outcome = self
            .locked(conversation_id, move || {
                self.reload_locked(conversation_id, owner, checkpoints)
            })
            .await?;
        outcome.ok_or_else(|| LockError::Timeout(self.keys.lock_key(conversation_id)).into())
    }

    /// 归属者名下的全部会话 ID（来自冷层关联表）
    pub async fn conversations_of(&self, owner_id: &str) -> Result<Vec<String>> {
        self.cold.conversations_of(owner_id).await
    }

    /// 延迟队列中尚未触发的过期任务数
    pub async fn pending_expirations(&self) -> Result<usize> {
        self.scheduler.pending().await
    }

    /// 启动唯一的过期消费者，到期任务回调本控制器的 `close_conversation`
    pub fn spawn_expiration_worker(
        self: &Arc<Self>,
        poll_interval: Duration,
        batch: usize,
    ) -> WorkerHandle {
        let handler: Arc<dyn ExpirationHandler> = self.clone();
        ExpirationWorker::new(self.queue.clone(), handler)
            .poll_interval(poll_interval)
            .batch(batch)
            .spawn()
    }

    // ── 锁内逻辑 ──

    async fn locked<T, F, Fut>(&self, conversation_id: &str, op: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let name = self.keys.lock_key(conversation_id);
        with_lock(self.locks.as_ref(), &name, self.settings.lock_timeout, op).await
    }

    async fn read_bucket(&self, conversation_id: &str) -> Result<Vec<S::Checkpoint>> {
        match self.hot.get_bucket(conversation_id).await? {
            Some(bytes) => self.codec.decode(&bytes),
            None => Ok(Vec::new()),
        }
    }

    async fn get_locked(&self, ctx: &RunContext) -> Result<Option<S::Checkpoint>> {
        let id = ctx.conversation_id.as_str();
        match self.hot.get_bucket(id).await? {
            None => {
                self.record_owner(id, ctx.owner_id.as_deref()).await?;
                debug!(conversation_id = %id, "首次接触，尚无 checkpoint");
                Ok(None)
            }
            Some(bytes) => {
                let checkpoints = self.codec.decode(&bytes)?;
                Ok(self.selector.select(&checkpoints, ctx))
            }
        }
    }

    async fn put_locked(&self, ctx: &RunContext, checkpoint: S::Checkpoint) -> Result<bool> {
        let id = ctx.conversation_id.as_str();
        let existing = self.hot.get_bucket(id).await?;
        let first_admission = existing.is_none();
        let mut checkpoints = match existing {
            Some(bytes) => self.codec.decode(&bytes)?,
            None => Vec::new(),
        };

        if first_admission {
            self.scheduler.schedule(id).await?;
            info!(
                conversation_id = %id,
                window_secs = self.settings.window.as_secs(),
                "📥 会话进入热层"
            );
        }
        self.record_owner(id, ctx.owner_id.as_deref()).await?;

        checkpoints.insert(0, checkpoint);
        let bytes = self.codec.encode(&checkpoints)?;
        self.hot
            .set_bucket(id, bytes, self.settings.backup_ttl)
            .await?;
        debug!(conversation_id = %id, checkpoints = checkpoints.len(), "checkpoint 已写入热层");
        Ok(first_admission)
    }

    async fn close_locked(&self, conversation_id: &str) -> Result<CloseOutcome> {
        let Some(bytes) = self.hot.get_bucket(conversation_id).await? else {
            debug!(conversation_id = %conversation_id, "热层无此会话，close 为空操作");
            return Ok(CloseOutcome::NotCached);
        };
        let checkpoints = self.codec.decode(&bytes)?;
        let content = self.codec.encode_envelope(&checkpoints)?;
        let now = Utc::now();

        match self.cold.find_by_id(conversation_id).await? {
            Some(mut record) => {
                record.content = content;
                record.updated_at = now;
                self.cold.upsert(&record).await?;
            }
            None => {
                let owner_id = self
                    .hot
                    .get_meta(conversation_id)
                    .await?
                    .and_then(|mut meta| meta.remove(OWNER_ID_FIELD))
                    .ok_or_else(|| ConversationError::MissingOwner(conversation_id.to_string()))?;
                let record = ColdRecord::new(conversation_id, content, now);
                self.cold.insert_with_owner(&record, &owner_id).await?;
            }
        }

        self.hot.delete_bucket(conversation_id).await?;
        self.hot.delete_meta(conversation_id).await?;
        info!(
            conversation_id = %conversation_id,
            checkpoints = checkpoints.len(),
            "📤 会话已落冷"
        );
        Ok(CloseOutcome::Flushed {
            checkpoints: checkpoints.len(),
        })
    }

    async fn reload_locked(
        &self,
        conversation_id: &str,
        owner_id: &str,
        checkpoints: Vec<S::Checkpoint>,
    ) -> Result<ReloadOutcome> {
        if self.hot.get_bucket(conversation_id).await?.is_some() {
            warn!(conversation_id = %conversation_id, "⚠️ 会话已在热层，跳过重载");
            return Ok(ReloadOutcome::AlreadyHot);
        }

        let ttl = self.settings.backup_ttl;
        let bytes = self.codec.encode(&checkpoints)?;
        self.hot.set_bucket(conversation_id, bytes, ttl).await?;
        self.hot
            .put_meta(conversation_id, OWNER_ID_FIELD, owner_id)
            .await?;
        self.hot.expire_meta(conversation_id, ttl).await?;
        self.scheduler.schedule(conversation_id).await?;

        info!(
            conversation_id = %conversation_id,
            checkpoints = checkpoints.len(),
            "🔄 会话已从冷层重载"
        );
        Ok(ReloadOutcome::Reloaded {
            checkpoints: checkpoints.len(),
        })
    }

    /// 本次驻留尚未记录归属者时写入；每次都刷新元数据的备份 TTL
    async fn record_owner(&self, conversation_id: &str, owner_id: Option<&str>) -> Result<()> {
        let recorded = self
            .hot
            .get_meta(conversation_id)
            .await?
            .is_some_and(|meta| meta.contains_key(OWNER_ID_FIELD));

        match (recorded, owner_id) {
            (true, _) => {}
            (false, Some(owner_id)) => {
                self.hot
                    .put_meta(conversation_id, OWNER_ID_FIELD, owner_id)
                    .await?;
            }
            (false, None) => {
                warn!(conversation_id = %conversation_id, "⚠️ 首次接触未提供归属者");
                return Ok(());
            }
        }
        self.hot
            .expire_meta(conversation_id, self.settings.backup_ttl)
            .await
    }
}

#[async_trait]
impl<S: CheckpointSerializer> ExpirationHandler for ConversationCache<S> {
    async fn on_expire(&self, conversation_id: &str) -> Result<()> {
        // 锁被占用时本次触发直接丢弃，不重试
        if self.close_conversation(conversation_id).await? == CloseOutcome::LockBusy {
            debug!(conversation_id = %conversation_id, "过期任务因锁占用被丢弃");
        }
        Ok(())
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// [`ConversationCache`] 的构建器，存储、锁、队列四个后端必须全部提供
pub struct ConversationCacheBuilder<S: CheckpointSerializer> {
    serializer: S,
    hot: Option<Arc<dyn HotStore>>,
    cold: Option<Arc<dyn ColdStore>>,
    locks: Option<Arc<dyn LockGateway>>,
    queue: Option<Arc<dyn DelayQueue>>,
    selector: Option<Arc<dyn CheckpointSelector<S::Checkpoint>>>,
    settings: CacheSettings,
    keys: KeyLayout,
}

impl<S: CheckpointSerializer> ConversationCacheBuilder<S> {
    pub fn hot_store(mut self, hot: Arc<dyn HotStore>) -> Self {
        self.hot = Some(hot);
        self
    }

    pub fn cold_store(mut self, cold: Arc<dyn ColdStore>) -> Self {
        self.cold = Some(cold);
        self
    }

    pub fn lock(mut self, locks: Arc<dyn LockGateway>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn delay_queue(mut self, queue: Arc<dyn DelayQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// `get` 使用的选择规则，默认 [`LatestCheckpoint`]
    pub fn selector(mut self, selector: impl CheckpointSelector<S::Checkpoint> + 'static) -> Self {
        self.selector = Some(Arc::new(selector));
        self
    }

    pub fn settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 同时应用时长参数与锁的 key 前缀
    pub fn config(mut self, config: &CacheConfig) -> Self {
        self.settings = config.settings();
        self.keys = config.keys.clone();
        self
    }

    pub fn build(self) -> Result<ConversationCache<S>> {
        let hot = self.hot.ok_or_else(|| missing("hot_store"))?;
        let cold = self.cold.ok_or_else(|| missing("cold_store"))?;
        let locks = self.locks.ok_or_else(|| missing("lock"))?;
        let queue = self.queue.ok_or_else(|| missing("delay_queue"))?;
        let selector = self
            .selector
            .unwrap_or_else(|| Arc::new(LatestCheckpoint));

        Ok(ConversationCache {
            codec: CheckpointCodec::new(self.serializer),
            scheduler: ExpirationScheduler::new(queue.clone(), self.settings.window),
            hot,
            cold,
            locks,
            queue,
            selector,
            settings: self.settings,
            keys: self.keys,
        })
    }
}

fn missing(field: &str) -> crate::error::CacheError {
    ConfigError::MissingField(field.to_string()).into()
}
