//! 会话过期调度
//!
//! 热层原生 TTL 过期没有回调，因此会话首次进入热层时向延迟队列投递一个
//! 一次性任务，静默窗口到期后由唯一的后台消费者取出，并调用
//! [`ExpirationHandler::on_expire`]（即落冷逻辑）。
//!
//! ```text
//! put/reload ──schedule──▶ DelayQueue ──take_due──▶ ExpirationWorker ──▶ on_expire(id)
//! ```
//!
//! 同一会话可能同时存在多个任务，落冷是幂等的，多余的任务只是空操作。

pub mod redis;

pub use self::redis::RedisDelayQueue;

use crate::error::Result;
use async_trait::async_trait;
use futures::FutureExt;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 共享延迟队列
#[async_trait]
pub trait DelayQueue: Send + Sync {
    /// 投递一个在 `delay` 之后到期的会话 ID
    async fn offer(&self, conversation_id: &str, delay: Duration) -> Result<()>;

    /// 原子地取出最多 `limit` 个已到期的会话 ID（按到期时间先后）
    async fn take_due(&self, limit: usize) -> Result<Vec<String>>;

    /// 队列中尚未被取出的任务数
    async fn pending(&self) -> Result<usize>;
}

/// 到期回调
#[async_trait]
pub trait ExpirationHandler: Send + Sync {
    async fn on_expire(&self, conversation_id: &str) -> Result<()>;
}

// ── ExpirationScheduler ───────────────────────────────────────────────────────

/// 投递端：生命周期控制器通过它安排过期任务
#[derive(Clone)]
pub struct ExpirationScheduler {
    queue: Arc<dyn DelayQueue>,
    window: Duration,
}

impl ExpirationScheduler {
    pub fn new(queue: Arc<dyn DelayQueue>, window: Duration) -> Self {
        Self { queue, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// 按静默窗口安排
    pub async fn schedule(&self, conversation_id: &str) -> Result<()> {
        self.schedule_in(conversation_id, self.window).await
    }

    pub async fn schedule_in(&self, conversation_id: &str, delay: Duration) -> Result<()> {
        self.queue.offer(conversation_id, delay).await?;
        debug!(conversation_id = %conversation_id, delay_secs = delay.as_secs(), "⏳ 已投递过期任务");
        Ok(())
    }

    pub async fn pending(&self) -> Result<usize> {
        self.queue.pending().await
    }
}

// ── ExpirationWorker ──────────────────────────────────────────────────────────

/// 消费端：唯一的后台任务，轮询到期条目并逐个回调
pub struct ExpirationWorker {
    queue: Arc<dyn DelayQueue>,
    handler: Arc<dyn ExpirationHandler>,
    poll_interval: Duration,
    batch: usize,
}

/// 后台任务句柄，`shutdown` 发出停止信号并等待退出
pub struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "过期处理线程异常退出");
        }
    }
}

impl ExpirationWorker {
    pub fn new(queue: Arc<dyn DelayQueue>, handler: Arc<dyn ExpirationHandler>) -> Self {
        Self {
            queue,
            handler,
            poll_interval: Duration::from_secs(1),
            batch: 64,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn spawn(self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(self.run(cancel.clone()));
        WorkerHandle { cancel, join }
    }

    async fn run(self, cancel: CancellationToken) {
        info!(poll_ms = self.poll_interval.as_millis() as u64, "🕰️ 会话过期处理线程已启动");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            self.drain(&cancel).await;
        }
        info!("🛑 会话过期处理线程已停止");
    }

    /// 取空当前所有到期任务；批次取满说明可能还有积压，继续取
    async fn drain(&self, cancel: &CancellationToken) {
        loop {
            let due = match self.queue.take_due(self.batch).await {
                Ok(due) => due,
                Err(e) => {
                    warn!(error = %e, "⚠️ 读取过期队列失败，下轮重试");
                    return;
                }
            };
            let full = due.len() >= self.batch;
            for conversation_id in due {
                self.fire(&conversation_id).await;
            }
            if !full || cancel.is_cancelled() {
                return;
            }
        }
    }

    /// 单个任务的失败（错误或 panic）只记录日志，不影响消费者继续运行
    async fn fire(&self, conversation_id: &str) {
        let outcome = AssertUnwindSafe(self.handler.on_expire(conversation_id))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => debug!(conversation_id = %conversation_id, "过期任务处理完成"),
            Ok(Err(e)) => {
                error!(conversation_id = %conversation_id, error = %e, "❌ 会话过期处理失败")
            }
            Err(_) => error!(conversation_id = %conversation_id, "❌ 会话过期处理发生 panic"),
        }
    }
}

// ── InMemoryDelayQueue ────────────────────────────────────────────────────────

/// 进程内延迟队列（最小堆），适合测试与单机部署
#[derive(Default)]
pub struct InMemoryDelayQueue {
    heap: Mutex<BinaryHeap<Reverse<(Instant, u64, String)>>>,
    seq: std::sync::atomic::AtomicU64,
}

impl InMemoryDelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 队列中某会话的任务数
    pub fn scheduled_for(&self, conversation_id: &str) -> usize {
        self.heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|Reverse((_, _, id))| id == conversation_id)
            .count()
    }
}

#[async_trait]
impl DelayQueue for InMemoryDelayQueue {
    async fn offer(&self, conversation_id: &str, delay: Duration) -> Result<()> {
        let seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Reverse((Instant::now() + delay, seq, conversation_id.to_string())));
        Ok(())
    }

    async fn take_due(&self, limit: usize) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        let mut due = Vec::new();
        while due.len() < limit {
            let ready = matches!(heap.peek(), Some(Reverse((at, _, _))) if *at <= now);
            if !ready {
                break;
            }
            if let Some(Reverse((_, _, id))) = heap.pop() {
                due.push(id);
            }
        }
        Ok(due)
    }

    async fn pending(&self) -> Result<usize> {
        Ok(self.heap.lock().unwrap_or_else(|e| e.into_inner()).len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingHandler;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_queue_releases_in_due_order() {
        let queue = InMemoryDelayQueue::new();
        queue.offer("late", Duration::from_millis(40)).await.unwrap();
        queue.offer("early", Duration::ZERO).await.unwrap();
        queue.offer("early", Duration::ZERO).await.unwrap();

        assert_eq!(queue.take_due(10).await.unwrap(), vec!["early", "early"]);
        assert_eq!(queue.pending().await.unwrap(), 1);
        assert_eq!(queue.scheduled_for("late"), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(queue.take_due(10).await.unwrap(), vec!["late"]);
        assert!(queue.take_due(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_take_due_respects_limit() {
        let queue = InMemoryDelayQueue::new();
        for id in ["a", "b", "c"] {
            queue.offer(id, Duration::ZERO).await.unwrap();
        }
        assert_eq!(queue.take_due(2).await.unwrap(), vec!["a", "b"]);
        assert_eq!(queue.take_due(2).await.unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_scheduler_uses_window() {
        let queue = Arc::new(InMemoryDelayQueue::new());
        let scheduler = ExpirationScheduler::new(queue.clone(), Duration::from_secs(3600));
        scheduler.schedule("c1").await.unwrap();
        assert_eq!(scheduler.pending().await.unwrap(), 1);
        assert!(queue.take_due(10).await.unwrap().is_empty());

        scheduler.schedule_in("c2", Duration::ZERO).await.unwrap();
        assert_eq!(queue.take_due(10).await.unwrap(), vec!["c2"]);
    }

    #[tokio::test]
    async fn test_worker_survives_failures_and_panics() {
        let queue = Arc::new(InMemoryDelayQueue::new());
        let handler = Arc::new(
            RecordingHandler::new()
                .failing_on("bad")
                .panicking_on("worse"),
        );
        for id in ["bad", "worse", "good"] {
            queue.offer(id, Duration::ZERO).await.unwrap();
        }

        let worker = ExpirationWorker::new(queue.clone(), handler.clone())
            .poll_interval(Duration::from_millis(10))
            .spawn();

        wait_until(|| handler.calls().len() == 3).await;
        assert_eq!(handler.calls(), vec!["bad", "worse", "good"]);
        assert!(!worker.is_finished());

        // 失败之后仍然能处理新任务
        queue.offer("later", Duration::ZERO).await.unwrap();
        wait_until(|| handler.calls().len() == 4).await;

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_drains_backlog_beyond_batch() {
        let queue = Arc::new(InMemoryDelayQueue::new());
        let handler = Arc::new(RecordingHandler::new());
        for i in 0..10 {
            queue.offer(&format!("c{i}"), Duration::ZERO).await.unwrap();
        }
        let worker = ExpirationWorker::new(queue.clone(), handler.clone())
            .poll_interval(Duration::from_millis(10))
            .batch(3)
            .spawn();

        wait_until(|| handler.calls().len() == 10).await;
        assert_eq!(queue.pending().await.unwrap(), 0);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_consumer() {
        let queue = Arc::new(InMemoryDelayQueue::new());
        let handler = Arc::new(RecordingHandler::new());
        let worker = ExpirationWorker::new(queue.clone(), handler.clone())
            .poll_interval(Duration::from_millis(10))
            .spawn();
        let token = worker.cancel_token();
        worker.shutdown().await;
        assert!(token.is_cancelled());

        queue.offer("after", Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handler.calls().is_empty());
        assert_eq!(queue.pending().await.unwrap(), 1);
    }
}
