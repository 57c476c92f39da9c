//! 可脚本化的过期回调，用于在不依赖真实控制器的情况下测试 [`ExpirationWorker`]。
//!
//! # 示例
//!
//! ```rust
//! use echo_checkpoint::expiration::ExpirationHandler;
//! use echo_checkpoint::testing::RecordingHandler;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let handler = RecordingHandler::new().failing_on("broken");
//!
//! assert!(handler.on_expire("ok").await.is_ok());
//! assert!(handler.on_expire("broken").await.is_err());
//! assert_eq!(handler.calls(), vec!["ok", "broken"]);
//! # }
//! ```
//!
//! [`ExpirationWorker`]: crate::expiration::ExpirationWorker

use crate::error::{CacheError, Result};
use crate::expiration::ExpirationHandler;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// 记录每次 `on_expire` 调用，并可对指定会话返回错误或 panic
#[derive(Default)]
pub struct RecordingHandler {
    calls: Arc<Mutex<Vec<String>>>,
    failing: HashSet<String>,
    panicking: HashSet<String>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 对该会话返回错误
    pub fn failing_on(mut self, conversation_id: impl Into<String>) -> Self {
        self.failing.insert(conversation_id.into());
        self
    }

    /// 对该会话直接 panic（用于测试消费者的隔离边界）
    pub fn panicking_on(mut self, conversation_id: impl Into<String>) -> Self {
        self.panicking.insert(conversation_id.into());
        self
    }

    /// 所有历史调用（按时序排列）
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExpirationHandler for RecordingHandler {
    async fn on_expire(&self, conversation_id: &str) -> Result<()> {
        self.calls.lock().unwrap().push(conversation_id.to_string());

        if self.panicking.contains(conversation_id) {
            panic!("scripted panic for {conversation_id}");
        }
        if self.failing.contains(conversation_id) {
            return Err(CacheError::Other(format!("scripted failure for {conversation_id}")));
        }
        Ok(())
    }
}
