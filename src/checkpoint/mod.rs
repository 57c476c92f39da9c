//! Checkpoint 与选择规则
//!
//! 对缓存子系统而言 checkpoint 是不透明、有序、可序列化的数据块；
//! 这里的 [`Checkpoint`] 只是 Agent 运行时产出的一种参考形态，
//! 控制器对任意实现了 [`CheckpointSerializer`](codec::CheckpointSerializer) 的类型都适用。
//!
//! `get` 返回哪一个 checkpoint 由 [`CheckpointSelector`] 决定：
//!
//! | 类型 | 规则 |
//! |------|------|
//! | [`LatestCheckpoint`] | 列表头部（最新） |
//! | [`ResumeTagSelector`] | 调用方指定 `checkpoint_id` 时按 ID 查找，否则最新 |
//! | [`FnSelector`] | 任意闭包 |

pub mod codec;

pub use codec::{CheckpointCodec, CheckpointSerializer, JsonCheckpointSerializer};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Checkpoint ────────────────────────────────────────────────────────────────

/// 单次图执行状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// 快照唯一 ID（UUID v4）
    pub id: String,
    /// 产出该快照的节点
    pub node_id: Option<String>,
    /// 恢复执行时的下一个节点
    pub next_node_id: Option<String>,
    /// 该时刻的完整状态
    pub state: Value,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(state: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            node_id: None,
            next_node_id: None,
            state,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_nodes(mut self, node_id: impl Into<String>, next_node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self.next_node_id = Some(next_node_id.into());
        self
    }
}

// ── RunContext ────────────────────────────────────────────────────────────────

/// 调用方随每次操作传入的上下文
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunContext {
    pub conversation_id: String,
    /// 首次接触时记录的归属者（如用户 ID）
    pub owner_id: Option<String>,
    /// 恢复标签：指定要恢复的 checkpoint ID
    pub checkpoint_id: Option<String>,
}

impl RunContext {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            ..Default::default()
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_checkpoint(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }
}

// ── CheckpointSelector ────────────────────────────────────────────────────────

/// 从有序列表（最新在前）中挑选 `get` 要返回的 checkpoint
pub trait CheckpointSelector<C>: Send + Sync {
    fn select(&self, checkpoints: &[C], ctx: &RunContext) -> Option<C>;
}

/// 总是返回最新的 checkpoint
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestCheckpoint;

impl<C: Clone> CheckpointSelector<C> for LatestCheckpoint {
    fn select(&self, checkpoints: &[C], _ctx: &RunContext) -> Option<C> {
        checkpoints.first().cloned()
    }
}

/// 按恢复标签选择；未指定标签时退化为最新
#[derive(Debug, Clone, Copy, Default)]
pub struct ResumeTagSelector;

impl CheckpointSelector<Checkpoint> for ResumeTagSelector {
    fn select(&self, checkpoints: &[Checkpoint], ctx: &RunContext) -> Option<Checkpoint> {
        match ctx.checkpoint_id.as_deref() {
            Some(tag) => checkpoints.iter().find(|c| c.id == tag).cloned(),
            None => checkpoints.first().cloned(),
        }
    }
}

/// 闭包选择器，便于运行时注入自定义规则
pub struct FnSelector<F>(pub F);

impl<C, F> CheckpointSelector<C> for FnSelector<F>
where
    F: Fn(&[C], &RunContext) -> Option<C> + Send + Sync,
{
    fn select(&self, checkpoints: &[C], ctx: &RunContext) -> Option<C> {
        (self.0)(checkpoints, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn history() -> Vec<Checkpoint> {
        vec![
            Checkpoint::new(json!({"step": 3})).with_id("c3"),
            Checkpoint::new(json!({"step": 2})).with_id("c2"),
            Checkpoint::new(json!({"step": 1})).with_id("c1"),
        ]
    }

    #[test]
    fn test_latest_picks_head() {
        let ctx = RunContext::new("conv");
        let picked = LatestCheckpoint.select(&history(), &ctx).unwrap();
        assert_eq!(picked.id, "c3");
        assert!(CheckpointSelector::<Checkpoint>::select(&LatestCheckpoint, &[], &ctx).is_none());
    }

    #[test]
    fn test_resume_tag_selects_by_id() {
        let ctx = RunContext::new("conv").with_checkpoint("c2");
        assert_eq!(ResumeTagSelector.select(&history(), &ctx).unwrap().id, "c2");

        let missing = RunContext::new("conv").with_checkpoint("nope");
        assert!(ResumeTagSelector.select(&history(), &missing).is_none());

        let untagged = RunContext::new("conv");
        assert_eq!(ResumeTagSelector.select(&history(), &untagged).unwrap().id, "c3");
    }

    #[test]
    fn test_fn_selector_sees_context() {
        let oldest = FnSelector(|list: &[Checkpoint], ctx: &RunContext| {
            assert_eq!(ctx.owner_id.as_deref(), Some("42"));
            list.last().cloned()
        });
        let ctx = RunContext::new("conv").with_owner("42");
        assert_eq!(oldest.select(&history(), &ctx).unwrap().id, "c1");
    }
}
