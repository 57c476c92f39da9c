use std::fmt;

/// 会话 Checkpoint 缓存的统一错误类型
#[derive(Debug)]
pub enum CacheError {
    /// 编解码错误
    Codec(CodecError),
    /// 分布式锁错误
    Lock(LockError),
    /// 热层 / 冷层 / 延迟队列访问错误
    Store(StoreError),
    /// 会话生命周期错误
    Conversation(ConversationError),
    /// 配置错误
    Config(ConfigError),
    /// IO 错误
    Io(std::io::Error),
    /// 其他错误
    Other(String),
}

/// Checkpoint 编解码错误
#[derive(Debug)]
pub enum CodecError {
    /// 负载损坏：数量与可用字节不符、单个 checkpoint 解码失败、信封格式错误等
    CorruptPayload(String),
    /// 单个 checkpoint 序列化失败
    Serialization(String),
}

/// 分布式锁错误
#[derive(Debug)]
pub enum LockError {
    /// 在超时时间内未能获取锁
    Timeout(String),
    /// 锁后端不可用
    Backend(String),
}

/// 存储访问错误
#[derive(Debug)]
pub enum StoreError {
    /// 热层（KV）读写失败
    Hot(String),
    /// 冷层读取失败
    ColdRead(String),
    /// 冷层写入失败（此时热层数据保持不变）
    ColdWrite(String),
    /// 延迟队列读写失败
    Queue(String),
}

/// 会话生命周期错误
#[derive(Debug)]
pub enum ConversationError {
    /// 会话 ID 为空
    EmptyId,
    /// 冷层中不存在该会话
    NotFound(String),
    /// 冷层中不存在该会话的归属记录
    OwnerNotFound(String),
    /// 首次落冷时热层元数据中缺少归属者
    MissingOwner(String),
}

/// 配置错误
#[derive(Debug)]
pub enum ConfigError {
    /// 配置文件未找到
    FileNotFound(String),
    /// 配置解析失败
    ParseFailed(String),
    /// 缺少必需的配置项
    MissingField(String),
    /// 配置值无效
    InvalidValue { field: String, message: String },
    /// 环境变量格式错误
    EnvFormatError(String),
}

impl CacheError {
    /// 是否为锁超时（热路径上据此降级而非报错）
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, CacheError::Lock(LockError::Timeout(_)))
    }

    pub fn is_corrupt_payload(&self) -> bool {
        matches!(self, CacheError::Codec(CodecError::CorruptPayload(_)))
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Codec(e) => write!(f, "Codec Error: {}", e),
            CacheError::Lock(e) => write!(f, "Lock Error: {}", e),
            CacheError::Store(e) => write!(f, "Store Error: {}", e),
            CacheError::Conversation(e) => write!(f, "Conversation Error: {}", e),
            CacheError::Config(e) => write!(f, "Config Error: {}", e),
            CacheError::Io(e) => write!(f, "IO Error: {}", e),
            CacheError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::CorruptPayload(msg) => write!(f, "Corrupt payload: {}", msg),
            CodecError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Timeout(name) => write!(f, "Timed out acquiring lock '{}'", name),
            LockError::Backend(msg) => write!(f, "Lock backend error: {}", msg),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Hot(msg) => write!(f, "Hot store error: {}", msg),
            StoreError::ColdRead(msg) => write!(f, "Cold store read failed: {}", msg),
            StoreError::ColdWrite(msg) => write!(f, "Cold store write failed: {}", msg),
            StoreError::Queue(msg) => write!(f, "Delay queue error: {}", msg),
        }
    }
}

impl fmt::Display for ConversationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationError::EmptyId => write!(f, "Conversation id must not be empty"),
            ConversationError::NotFound(id) => write!(f, "Conversation '{}' not found", id),
            ConversationError::OwnerNotFound(id) => {
                write!(f, "Owner of conversation '{}' not found", id)
            }
            ConversationError::MissingOwner(id) => {
                write!(f, "Conversation '{}' has no owner recorded in the hot tier", id)
            }
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {}", path),
            ConfigError::ParseFailed(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigError::MissingField(field) => write!(f, "Missing config field: {}", field),
            ConfigError::InvalidValue { field, message } => {
                write!(f, "Invalid config value for '{}': {}", field, message)
            }
            ConfigError::EnvFormatError(key) => {
                write!(f, "Malformed environment variable: {}", key)
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for CodecError {}
impl std::error::Error for LockError {}
impl std::error::Error for StoreError {}
impl std::error::Error for ConversationError {}
impl std::error::Error for ConfigError {}

// From 转换实现
impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Codec(CodecError::Serialization(err.to_string()))
    }
}

impl From<serde_yaml::Error> for CacheError {
    fn from(err: serde_yaml::Error) -> Self {
        CacheError::Config(ConfigError::ParseFailed(err.to_string()))
    }
}

impl From<base64::DecodeError> for CacheError {
    fn from(err: base64::DecodeError) -> Self {
        CacheError::Codec(CodecError::CorruptPayload(format!("invalid base64: {}", err)))
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        CacheError::Other(format!("blocking task failed: {}", err))
    }
}

impl From<CodecError> for CacheError {
    fn from(err: CodecError) -> Self {
        CacheError::Codec(err)
    }
}

impl From<LockError> for CacheError {
    fn from(err: LockError) -> Self {
        CacheError::Lock(err)
    }
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        CacheError::Store(err)
    }
}

impl From<ConversationError> for CacheError {
    fn from(err: ConversationError) -> Self {
        CacheError::Conversation(err)
    }
}

impl From<ConfigError> for CacheError {
    fn from(err: ConfigError) -> Self {
        CacheError::Config(err)
    }
}

// 便捷的 Result 类型别名
pub type Result<T> = std::result::Result<T, CacheError>;
