//! SQLite 冷层
//!
//! 表结构：
//! - `chat_log(conversation_id PK, content, created_at, updated_at)`
//! - `user_conversation(user_id, conversation_id)`
//!
//! 时间以 RFC 3339 文本存储。每次操作在 `spawn_blocking` 中打开独立连接。

use super::cold::{ColdRecord, ColdStore};
use crate::error::{CacheError, Result, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chat_log (
    conversation_id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_conversation (
    user_id TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    PRIMARY KEY (user_id, conversation_id)
);

CREATE INDEX IF NOT EXISTS idx_user_conversation_conversation
    ON user_conversation (conversation_id);
"#;

pub struct SqliteColdStore {
    db_path: PathBuf,
}

impl SqliteColdStore {
    /// 打开或创建数据库文件，自动建父目录和表
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&db_path).map_err(write_err)?;
        conn.execute_batch(SCHEMA).map_err(write_err)?;
        info!(path = %db_path.display(), "🗄️ SQLite 冷层初始化");
        Ok(Self { db_path })
    }

    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let conn = Connection::open(&db_path).map_err(read_err)?;
            f(&conn).map_err(read_err)
        })
        .await?
    }

    async fn write<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<()> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = Connection::open(&db_path).map_err(write_err)?;
            f(&mut conn).map_err(write_err)
        })
        .await?
    }
}

fn read_err(e: rusqlite::Error) -> CacheError {
    StoreError::ColdRead(e.to_string()).into()
}

fn write_err(e: rusqlite::Error) -> CacheError {
    StoreError::ColdWrite(e.to_string()).into()
}

fn parse_time(index: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[async_trait]
impl ColdStore for SqliteColdStore {
    async fn find_by_id(&self, conversation_id: &str) -> Result<Option<ColdRecord>> {
        let id = conversation_id.to_string();
        self.read(move |conn| {
            conn.query_row(
                "SELECT conversation_id, content, created_at, updated_at
                 FROM chat_log WHERE conversation_id = ?1",
                params![id],
                |row| {
                    Ok(ColdRecord {
                        conversation_id: row.get(0)?,
                        content: row.get(1)?,
                        created_at: parse_time(2, row.get(2)?)?,
                        updated_at: parse_time(3, row.get(3)?)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn upsert(&self, record: &ColdRecord) -> Result<()> {
        let record = record.clone();
        debug!(conversation_id = %record.conversation_id, "upsert chat_log");
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO chat_log (conversation_id, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                     content = excluded.content,
                     updated_at = excluded.updated_at",
                params![
                    record.conversation_id,
                    record.content,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn find_owner(&self, conversation_id: &str) -> Result<Option<String>> {
        let id = conversation_id.to_string();
        self.read(move |conn| {
            conn.query_row(
                "SELECT user_id FROM user_conversation WHERE conversation_id = ?1 LIMIT 1",
                params![id],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn save_owner_association(&self, owner_id: &str, conversation_id: &str) -> Result<()> {
        let owner = owner_id.to_string();
        let id = conversation_id.to_string();
        self.write(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO user_conversation (user_id, conversation_id) VALUES (?1, ?2)",
                params![owner, id],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_with_owner(&self, record: &ColdRecord, owner_id: &str) -> Result<()> {
        let record = record.clone();
        let owner = owner_id.to_string();
        self.write(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO chat_log (conversation_id, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.conversation_id,
                    record.content,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339()
                ],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO user_conversation (user_id, conversation_id) VALUES (?1, ?2)",
                params![owner, record.conversation_id],
            )?;
            tx.commit()
        })
        .await
    }

    async fn conversations_of(&self, owner_id: &str) -> Result<Vec<String>> {
        let owner = owner_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id FROM user_conversation WHERE user_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![owner], |row| row.get::<_, String>(0))?;
            rows.collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SqliteColdStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteColdStore::new(dir.path().join("nested/cold.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_insert_update_and_lookup() {
        let (_dir, store) = store();
        assert!(store.find_by_id("c1").await.unwrap().is_none());

        let t0 = Utc::now();
        let record = ColdRecord::new("c1", r#"{"data":"AAAAAA=="}"#.to_string(), t0);
        store.insert_with_owner(&record, "42").await.unwrap();

        let found = store.find_by_id("c1").await.unwrap().unwrap();
        assert_eq!(found, record);
        assert_eq!(store.find_owner("c1").await.unwrap().as_deref(), Some("42"));

        let t1 = t0 + chrono::Duration::seconds(30);
        let mut update = found.clone();
        update.content = r#"{"data":"AAAAAQ=="}"#.to_string();
        update.updated_at = t1;
        store.upsert(&update).await.unwrap();

        let found = store.find_by_id("c1").await.unwrap().unwrap();
        assert_eq!(found.content, update.content);
        assert_eq!(found.created_at, t0);
        assert_eq!(found.updated_at, t1);
    }

    #[tokio::test]
    async fn test_failed_transaction_leaves_no_association() {
        let (_dir, store) = store();
        let record = ColdRecord::new("c1", "{}".to_string(), Utc::now());
        store.upsert(&record).await.unwrap();

        // chat_log 主键冲突，整个事务回滚
        let err = store.insert_with_owner(&record, "99").await.unwrap_err();
        assert!(matches!(err, CacheError::Store(StoreError::ColdWrite(_))));
        assert!(store.find_owner("c1").await.unwrap().is_none());
        assert!(store.conversations_of("99").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conversations_of_owner() {
        let (_dir, store) = store();
        store.save_owner_association("42", "a").await.unwrap();
        store.save_owner_association("42", "b").await.unwrap();
        store.save_owner_association("42", "a").await.unwrap();
        store.save_owner_association("7", "c").await.unwrap();

        assert_eq!(store.conversations_of("42").await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.conversations_of("7").await.unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_reopen_sees_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cold.db");
        {
            let store = SqliteColdStore::new(&path).unwrap();
            store
                .insert_with_owner(&ColdRecord::new("c1", "{}".to_string(), Utc::now()), "1")
                .await
                .unwrap();
        }
        let reopened = SqliteColdStore::new(&path).unwrap();
        assert!(reopened.find_by_id("c1").await.unwrap().is_some());
    }
}
