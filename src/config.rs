//! 缓存配置加载
//!
//! 支持两种来源：
//!
//! - YAML 文件：[`CacheConfig::load`]
//! - 环境变量（自动读取 `.env`）：[`CacheConfig::from_env`]，格式：
//!
//! ```text
//! CHECKPOINT_CACHE_REDIS_URL=redis://127.0.0.1:6379
//! CHECKPOINT_CACHE_DATABASE_PATH=~/.echo-agent/conversations.db
//! CHECKPOINT_CACHE_EXPIRATION_WINDOW_SECS=7200
//! CHECKPOINT_CACHE_BACKUP_TTL_FACTOR=2
//! CHECKPOINT_CACHE_LOCK_TIMEOUT_MS=1000
//! ```
//!
//! 未设置的字段使用默认值。

use crate::error::{ConfigError, Result};
use dotenv::dotenv;
use serde::Deserialize;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "CHECKPOINT_CACHE_";

/// 热层各命名空间的 key 前缀
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct KeyLayout {
    /// checkpoint 列表内容
    pub content_prefix: String,
    /// 会话元数据（归属者）
    pub meta_prefix: String,
    /// 每个会话一把锁
    pub lock_prefix: String,
    /// 全局共享的过期延迟队列（不按会话区分）
    pub queue_key: String,
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self {
            content_prefix: "chat:checkpoint:content:".to_string(),
            meta_prefix: "chat:conversation:config:".to_string(),
            lock_prefix: "chat:checkpoint:lock:".to_string(),
            queue_key: "chat:expiration:queue".to_string(),
        }
    }
}

impl KeyLayout {
    pub fn content_key(&self, conversation_id: &str) -> String {
        format!("{}{}", self.content_prefix, conversation_id)
    }

    pub fn meta_key(&self, conversation_id: &str) -> String {
        format!("{}{}", self.meta_prefix, conversation_id)
    }

    pub fn lock_key(&self, conversation_id: &str) -> String {
        format!("{}{}", self.lock_prefix, conversation_id)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub redis_url: String,
    /// 冷层 SQLite 文件路径，支持 `~/` 前缀
    pub database_path: String,
    /// 静默窗口：首次进入热层后多久触发落冷
    pub expiration_window_secs: u64,
    /// 兜底 TTL = 静默窗口 × 该系数，必须 >= 2
    pub backup_ttl_factor: u32,
    pub lock_timeout_ms: u64,
    /// Redis 锁的租约时长，持有者崩溃后锁会在此之后自动释放
    pub lock_lease_ms: u64,
    /// 过期任务消费者的轮询间隔
    pub poll_interval_ms: u64,
    /// 每次轮询最多取出的到期任务数
    pub poll_batch: usize,
    pub keys: KeyLayout,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            database_path: "~/.echo-agent/conversations.db".to_string(),
            expiration_window_secs: 60 * 60 * 2,
            backup_ttl_factor: 2,
            lock_timeout_ms: 1000,
            lock_lease_ms: 30_000,
            poll_interval_ms: 1000,
            poll_batch: 64,
            keys: KeyLayout::default(),
        }
    }
}

impl CacheConfig {
    /// 从 YAML 文件加载
    pub fn load(path: &str) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|_| ConfigError::FileNotFound(path.to_string()))?;
        let config: CacheConfig = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    /// 从环境变量加载（会先读取 `.env`）
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// 从任意 `(key, value)` 序列加载，只识别 `CHECKPOINT_CACHE_` 前缀
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in vars {
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match field.to_lowercase().as_str() {
                "redis_url" => config.redis_url = value,
                "database_path" => config.database_path = value,
                "expiration_window_secs" => {
                    config.expiration_window_secs = parse_field(field, &value)?
                }
                "backup_ttl_factor" => config.backup_ttl_factor = parse_field(field, &value)?,
                "lock_timeout_ms" => config.lock_timeout_ms = parse_field(field, &value)?,
                "lock_lease_ms" => config.lock_lease_ms = parse_field(field, &value)?,
                "poll_interval_ms" => config.poll_interval_ms = parse_field(field, &value)?,
                "poll_batch" => config.poll_batch = parse_field(field, &value)?,
                "content_prefix" => config.keys.content_prefix = value,
                "meta_prefix" => config.keys.meta_prefix = value,
                "lock_prefix" => config.keys.lock_prefix = value,
                "queue_key" => config.keys.queue_key = value,
                // 配置文件路径，由命令行读取
                "config" => {}
                _ => return Err(ConfigError::EnvFormatError(key).into()),
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.expiration_window_secs == 0 {
            return Err(invalid("expiration_window_secs", "must be greater than zero"));
        }
        // 兜底 TTL 至少是静默窗口的两倍，显式落冷失败时内容也不会永久滞留
        if self.backup_ttl_factor < 2 {
            return Err(invalid("backup_ttl_factor", "must be at least 2"));
        }
        if self.lock_timeout_ms == 0 {
            return Err(invalid("lock_timeout_ms", "must be greater than zero"));
        }
        if self.lock_lease_ms <= self.lock_timeout_ms {
            return Err(invalid("lock_lease_ms", "must exceed lock_timeout_ms"));
        }
        if self.poll_interval_ms == 0 || self.poll_batch == 0 {
            return Err(invalid("poll_interval_ms/poll_batch", "must be greater than zero"));
        }
        if self.redis_url.trim().is_empty() {
            return Err(ConfigError::MissingField("redis_url".to_string()).into());
        }
        Ok(())
    }

    pub fn expiration_window(&self) -> Duration {
        Duration::from_secs(self.expiration_window_secs)
    }

    pub fn backup_ttl(&self) -> Duration {
        self.expiration_window() * self.backup_ttl_factor
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// 展开 `~/` 之后的数据库路径
    pub fn database_path(&self) -> PathBuf {
        expand_tilde(Path::new(&self.database_path))
    }

    pub fn settings(&self) -> CacheSettings {
        CacheSettings {
            window: self.expiration_window(),
            backup_ttl: self.backup_ttl(),
            lock_timeout: self.lock_timeout(),
        }
    }
}

/// 生命周期控制器运行时使用的时长参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheSettings {
    pub window: Duration,
    pub backup_ttl: Duration,
    pub lock_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheConfig::default().settings()
    }
}

fn parse_field<T: FromStr>(field: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(&field.to_lowercase(), &format!("cannot parse '{value}'")))
}

fn invalid(field: &str, message: &str) -> crate::error::CacheError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
    .into()
}

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())
        {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_timings() {
        let config = CacheConfig::default();
        assert_eq!(config.expiration_window(), Duration::from_secs(7200));
        assert_eq!(config.backup_ttl(), Duration::from_secs(14400));
        assert_eq!(config.lock_timeout(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_vars_overrides_and_ignores_foreign_keys() {
        let config = CacheConfig::from_vars(vars(&[
            ("PATH", "/usr/bin"),
            ("CHECKPOINT_CACHE_REDIS_URL", "redis://cache:6380"),
            ("CHECKPOINT_CACHE_EXPIRATION_WINDOW_SECS", "60"),
            ("CHECKPOINT_CACHE_BACKUP_TTL_FACTOR", "3"),
            ("CHECKPOINT_CACHE_LOCK_PREFIX", "t:lock:"),
        ]))
        .unwrap();

        assert_eq!(config.redis_url, "redis://cache:6380");
        assert_eq!(config.backup_ttl(), Duration::from_secs(180));
        assert_eq!(config.keys.lock_key("c1"), "t:lock:c1");
        assert_eq!(config.keys.content_key("c1"), "chat:checkpoint:content:c1");
    }

    #[test]
    fn test_backup_factor_below_two_is_rejected() {
        let err = CacheConfig::from_vars(vars(&[("CHECKPOINT_CACHE_BACKUP_TTL_FACTOR", "1")]))
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "backup_ttl_factor"
        ));
    }

    #[test]
    fn test_unknown_and_unparsable_vars() {
        let err = CacheConfig::from_vars(vars(&[("CHECKPOINT_CACHE_NOPE", "1")])).unwrap_err();
        assert!(matches!(err, CacheError::Config(ConfigError::EnvFormatError(_))));

        let err = CacheConfig::from_vars(vars(&[("CHECKPOINT_CACHE_LOCK_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, CacheError::Config(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_load_yaml_with_partial_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "redis_url: redis://yaml:6379\nexpiration_window_secs: 30\nkeys:\n  queue_key: q:test"
        )
        .unwrap();

        let config = CacheConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.redis_url, "redis://yaml:6379");
        assert_eq!(config.expiration_window_secs, 30);
        assert_eq!(config.keys.queue_key, "q:test");
        assert_eq!(config.keys.meta_prefix, "chat:conversation:config:");
        assert_eq!(config.lock_timeout_ms, 1000);
    }

    #[test]
    fn test_load_missing_file() {
        let err = CacheConfig::load("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, CacheError::Config(ConfigError::FileNotFound(_))));
    }
}
