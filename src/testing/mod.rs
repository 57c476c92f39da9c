//! 测试基础设施
//!
//! 提供在不依赖 Redis / 数据库的情况下测试缓存各组件的工具集。
//!
//! | 类型 | 用途 |
//! |------|------|
//! | [`RecordingHandler`] | 替代生命周期控制器，测试过期消费者的容错行为 |
//! | [`FlakyColdStore`] | 冷层写入可注入失败，测试落冷的顺序保证 |
//! | [`SlowHotStore`] | 热层写入变慢，制造同一会话上的锁竞争 |
//!
//! 所有 Mock 都完全在内存中运行，可安全地在多任务测试中共享。

mod mock_cold;
mod mock_handler;
mod mock_hot;

pub use mock_cold::FlakyColdStore;
pub use mock_handler::RecordingHandler;
pub use mock_hot::SlowHotStore;
