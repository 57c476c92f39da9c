use clap::{Parser, Subcommand};
use echo_checkpoint::prelude::*;
use echo_checkpoint::store::redis::connect;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "echo-checkpoint", about = "会话 checkpoint 缓存运维工具")]
struct Cli {
    /// YAML 配置文件；不指定时从环境变量（及 .env）读取
    #[arg(short, long, env = "CHECKPOINT_CACHE_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 运行过期消费者，直到 Ctrl-C
    Serve,
    /// 列出会话在热层中的 checkpoint（最新在前）
    List { conversation_id: String },
    /// 立即将会话落冷
    Close { conversation_id: String },
    /// 将会话从冷层重新载入热层
    Reload { conversation_id: String },
    /// 列出归属者名下的会话
    Owner { owner_id: String },
    /// 延迟队列中待触发的过期任务数
    Pending,
}

type Cache = ConversationCache<JsonCheckpointSerializer<Checkpoint>>;

async fn build_cache(config: &CacheConfig) -> Result<Cache> {
    let conn = connect(&config.redis_url).await?;
    ConversationCache::builder(JsonCheckpointSerializer::new())
        .hot_store(Arc::new(RedisHotStore::new(conn.clone(), config.keys.clone())))
        .cold_store(Arc::new(SqliteColdStore::new(config.database_path())?))
        .lock(Arc::new(RedisLock::new(conn.clone(), config.lock_lease())))
        .delay_queue(Arc::new(RedisDelayQueue::new(conn, config.keys.queue_key.clone())))
        .selector(ResumeTagSelector)
        .config(config)
        .build()
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("echo_checkpoint=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.config.as_deref() {
        Some(path) => CacheConfig::load(path)?,
        None => CacheConfig::from_env()?,
    };
    let cache = Arc::new(build_cache(&config).await?);

    match cli.command {
        Commands::Serve => {
            let worker = cache.spawn_expiration_worker(config.poll_interval(), config.poll_batch);
            info!(
                window_secs = config.expiration_window_secs,
                "🚀 过期消费者运行中，按 Ctrl-C 退出"
            );
            tokio::signal::ctrl_c().await?;
            worker.shutdown().await;
        }
        Commands::List { conversation_id } => {
            let checkpoints = cache.list(&conversation_id).await?;
            println!("{}", serde_json::to_string_pretty(&checkpoints)?);
        }
        Commands::Close { conversation_id } => {
            let outcome = cache.close_conversation(&conversation_id).await?;
            println!("{outcome:?}");
        }
        Commands::Reload { conversation_id } => {
            let outcome = cache.reload_conversation(&conversation_id).await?;
            println!("{outcome:?}");
        }
        Commands::Owner { owner_id } => {
            for id in cache.conversations_of(&owner_id).await? {
                println!("{id}");
            }
        }
        Commands::Pending => {
            println!("{}", cache.pending_expirations().await?);
        }
    }
    Ok(())
}
