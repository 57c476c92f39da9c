pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod expiration;
pub mod lock;
pub mod store;
pub mod testing;

pub mod prelude {
    pub use crate::cache::{
        CloseOutcome, ConversationCache, ConversationCacheBuilder, PutOutcome, ReloadOutcome,
    };
    pub use crate::checkpoint::{
        Checkpoint, CheckpointCodec, CheckpointSelector, CheckpointSerializer, FnSelector,
        JsonCheckpointSerializer, LatestCheckpoint, ResumeTagSelector, RunContext,
    };
    pub use crate::config::{CacheConfig, CacheSettings, KeyLayout};
    pub use crate::error::{CacheError, Result};
    pub use crate::expiration::{
        DelayQueue, ExpirationHandler, ExpirationScheduler, ExpirationWorker,
        InMemoryDelayQueue, RedisDelayQueue, WorkerHandle,
    };
    pub use crate::lock::{InMemoryLock, LockGateway, RedisLock, with_lock};
    pub use crate::store::{
        ColdRecord, ColdStore, HotStore, InMemoryColdStore, InMemoryHotStore, RedisHotStore,
        SqliteColdStore,
    };
}
