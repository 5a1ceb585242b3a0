use anyhow::{bail, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};
use time::OffsetDateTime;

use crate::backend::TableStore;
use crate::models::{Chat, Message, Role};

/** \brief 默认数据库文件名。 */
pub const DEFAULT_DB_FILE: &str = "chatwell.db";

/**
 * \brief 默认数据库路径：优先读取 `CHATWELL_DB` 环境变量。
 */
pub fn default_db_path() -> PathBuf {
    std::env::var_os("CHATWELL_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_FILE))
}

/**
 * \brief 打开指定路径的数据库并设置忙等待超时。
 */
pub fn open_db<P: AsRef<Path>>(path: P) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chats (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            chat_id TEXT NOT NULL REFERENCES chats(id),
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages (chat_id, created_at);
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief 读取键值配置。
 */
pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key=?1",
        params![key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 写入键值配置（存在则覆盖）。
 */
pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

/**
 * \brief 基于 SQLite 的表存储，实现与远端后端相同的 CRUD 契约。
 * \details 通过 `sqlite://<path>` 形式的后端地址启用，也用于测试。
 */
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /**
     * \brief 打开（或创建）数据库文件并执行迁移。
     */
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = open_db(path)?;
        Self::from_connection(conn)
    }

    /**
     * \brief 内存数据库，进程结束即丢失。
     */
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(&self, action: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("sqlite store lock poisoned: {}", e))?;
        action(&guard)
    }
}

fn now_nanos() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as i64
}

fn from_nanos(nanos: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(nanos as i128).ok()
}

fn map_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: from_nanos(row.get(2)?),
        updated_at: from_nanos(row.get(3)?),
    })
}

#[async_trait]
impl TableStore for SqliteStore {
    async fn list_chats(&self) -> Result<Vec<Chat>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, created_at, updated_at FROM chats ORDER BY updated_at DESC, seq DESC",
            )?;
            let rows = stmt
                .query_map([], map_chat)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    async fn create_chat(&self, title: &str) -> Result<Chat> {
        self.with_conn(|conn| {
            let id = uuid::Uuid::new_v4().to_string();
            let now = now_nanos();
            retry_on_locked(|| {
                conn.execute(
                    "INSERT INTO chats (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                    params![id, title, now],
                )
            })?;
            Ok(Chat {
                id,
                title: title.to_string(),
                created_at: from_nanos(now),
                updated_at: from_nanos(now),
            })
        })
    }

    async fn update_chat_title(&self, chat_id: &str, title: &str) -> Result<()> {
        self.with_conn(|conn| {
            let rows = retry_on_locked(|| {
                conn.execute(
                    "UPDATE chats SET title=?1, updated_at=?2 WHERE id=?3",
                    params![title, now_nanos(), chat_id],
                )
            })?;
            if rows == 0 {
                bail!("chat id {} not found", chat_id);
            }
            Ok(())
        })
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            retry_on_locked(|| {
                conn.execute("DELETE FROM messages WHERE chat_id=?1", params![chat_id])
            })?;
            retry_on_locked(|| conn.execute("DELETE FROM chats WHERE id=?1", params![chat_id]))?;
            Ok(())
        })
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, role, content FROM messages WHERE chat_id=?1 ORDER BY created_at ASC, seq ASC",
            )?;
            let rows = stmt
                .query_map(params![chat_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let mut messages = Vec::with_capacity(rows.len());
            for (id, role, content) in rows {
                messages.push(Message::stored(id, role.parse::<Role>()?, content));
            }
            Ok(messages)
        })
    }

    async fn has_messages(&self, chat_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT id FROM messages WHERE chat_id=?1 LIMIT 1",
                    params![chat_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    async fn insert_message(&self, chat_id: &str, role: Role, content: &str) -> Result<Message> {
        self.with_conn(|conn| {
            let id = uuid::Uuid::new_v4().to_string();
            let now = now_nanos();
            let touched = retry_on_locked(|| {
                conn.execute(
                    "UPDATE chats SET updated_at=?1 WHERE id=?2",
                    params![now, chat_id],
                )
            })?;
            if touched == 0 {
                bail!("chat id {} not found", chat_id);
            }
            retry_on_locked(|| {
                conn.execute(
                    "INSERT INTO messages (id, chat_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, chat_id, role.as_str(), content, now],
                )
            })?;
            Ok(Message::stored(id, role, content))
        })
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            retry_on_locked(|| {
                conn.execute("DELETE FROM messages WHERE id=?1", params![message_id])
            })?;
            Ok(())
        })
    }

    async fn update_message(&self, message_id: &str, content: &str) -> Result<()> {
        self.with_conn(|conn| {
            let rows = retry_on_locked(|| {
                conn.execute(
                    "UPDATE messages SET content=?1 WHERE id=?2",
                    params![content, message_id],
                )
            })?;
            if rows == 0 {
                bail!("message id {} not found", message_id);
            }
            Ok(())
        })
    }
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migrate");
        conn
    }

    #[test]
    fn test_config_roundtrip_and_overwrite() {
        let conn = mem_conn();
        assert_eq!(get_config(&conn, "k").expect("get"), None);
        set_config(&conn, "k", "v1").expect("set 1");
        set_config(&conn, "k", "v2").expect("set 2");
        assert_eq!(get_config(&conn, "k").expect("get").as_deref(), Some("v2"));
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = mem_conn();
        migrate(&conn).expect("second migrate");
    }

    #[tokio::test]
    async fn test_chat_and_messages() {
        let store = SqliteStore::open_in_memory().expect("store");
        let chat = store.create_chat("test chat").await.expect("create chat");
        store
            .insert_message(&chat.id, Role::User, "hello")
            .await
            .expect("insert msg");
        store
            .insert_message(&chat.id, Role::Assistant, "hi")
            .await
            .expect("insert msg");
        let msgs = store.list_messages(&chat.id).await.expect("load msgs");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].content, "hi");
        assert!(msgs.iter().all(|m| m.is_persisted()));

        store.delete_chat(&chat.id).await.expect("delete chat");
        assert!(store.list_chats().await.expect("list chats").is_empty());
        assert!(!store.has_messages(&chat.id).await.expect("has messages"));
    }

    #[tokio::test]
    async fn test_insert_message_bumps_chat_ordering() {
        let store = SqliteStore::open_in_memory().expect("store");
        let older = store.create_chat("older").await.expect("create 1");
        let newer = store.create_chat("newer").await.expect("create 2");
        let chats = store.list_chats().await.expect("list");
        assert_eq!(chats[0].id, newer.id);

        store
            .insert_message(&older.id, Role::User, "bump")
            .await
            .expect("insert");
        let chats = store.list_chats().await.expect("list");
        assert_eq!(chats[0].id, older.id);
        assert_eq!(chats[1].id, newer.id);
    }

    #[tokio::test]
    async fn test_has_messages_and_delete_message() {
        let store = SqliteStore::open_in_memory().expect("store");
        let chat = store.create_chat("c").await.expect("create");
        assert!(!store.has_messages(&chat.id).await.expect("empty"));
        let msg = store
            .insert_message(&chat.id, Role::User, "x")
            .await
            .expect("insert");
        assert!(store.has_messages(&chat.id).await.expect("non-empty"));
        store.delete_message(msg.id()).await.expect("delete");
        assert!(!store.has_messages(&chat.id).await.expect("empty again"));
    }

    #[tokio::test]
    async fn test_update_message_and_title() {
        let store = SqliteStore::open_in_memory().expect("store");
        let chat = store.create_chat("c").await.expect("create");
        let msg = store
            .insert_message(&chat.id, Role::User, "before")
            .await
            .expect("insert");
        store
            .update_message(msg.id(), "after")
            .await
            .expect("update message");
        store
            .update_chat_title(&chat.id, "renamed")
            .await
            .expect("rename");
        let msgs = store.list_messages(&chat.id).await.expect("list");
        assert_eq!(msgs[0].content, "after");
        let chats = store.list_chats().await.expect("chats");
        assert_eq!(chats[0].title, "renamed");
        assert!(store.update_message("missing", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_insert_into_unknown_chat_fails() {
        let store = SqliteStore::open_in_memory().expect("store");
        let result = store.insert_message("missing", Role::User, "x").await;
        assert!(result.is_err());
    }
}
