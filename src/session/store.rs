//! 持久会话
//!
//! 每个智能体一个会话，会话 ID 只由 agent_key 决定（`agent_{key}`），
//! 因此多次进程运行引用同一个 key 时会落到同一份 SQLite 记录上。

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, warn};

use crate::memory::{Message, Role};

/// 会话存储错误
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Session database path error: {0}")]
    Io(#[from] std::io::Error),
}

/// 由 agent_key 推出会话 ID（无时间成分）
pub fn session_id_for(agent_key: &str) -> String {
    format!("agent_{}", agent_key)
}

/// 所有会话共享的 SQLite 连接
#[derive(Clone)]
pub struct SessionDb {
    conn: Arc<Mutex<Connection>>,
}

impl SessionDb {
    pub fn in_memory() -> Result<Self, SessionError> {
        Self::init(Connection::open_in_memory()?)
    }

    /// 打开（或创建）数据库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    fn init(conn: Connection) -> Result<Self, SessionError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agent_sessions (
                session_id TEXT PRIMARY KEY,
                agent_key TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS agent_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agent_messages_session ON agent_messages(session_id);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

/// 单个智能体的持久会话
pub struct Session {
    id: String,
    agent_key: String,
    db: SessionDb,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("agent_key", &self.agent_key)
            .finish()
    }
}

impl Session {
    /// 打开会话；记录已存在时沿用
    pub fn open(db: SessionDb, agent_key: &str) -> Result<Self, SessionError> {
        let id = session_id_for(agent_key);
        let now = Utc::now();
        db.conn.lock().execute(
            "INSERT OR IGNORE INTO agent_sessions (session_id, agent_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![id, agent_key, now],
        )?;
        debug!(session = %id, "Session opened");
        Ok(Self {
            id,
            agent_key: agent_key.to_string(),
            db,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_key(&self) -> &str {
        &self.agent_key
    }

    /// 最近 limit 条消息（按时间顺序）；None 为全部
    pub fn get_items(&self, limit: Option<usize>) -> Result<Vec<Message>, SessionError> {
        let limit = limit.map_or(-1, |n| n as i64);
        let conn = self.db.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT role, content FROM (
                SELECT id, role, content FROM agent_messages
                WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![self.id, limit], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (role, content) = row?;
            match Role::parse(&role) {
                Some(role) => messages.push(Message { role, content }),
                None => warn!(session = %self.id, role = %role, "Skipping message with unknown role"),
            }
        }
        Ok(messages)
    }

    pub fn add_items(&self, items: &[Message]) -> Result<(), SessionError> {
        if items.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut conn = self.db.conn.lock();
        let tx = conn.transaction()?;
        for item in items {
            tx.execute(
                "INSERT INTO agent_messages (session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![self.id, item.role.as_str(), item.content, now],
            )?;
        }
        tx.execute(
            "UPDATE agent_sessions SET updated_at = ?1 WHERE session_id = ?2",
            params![now, self.id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// 移除并返回最近一条消息
    pub fn pop_item(&self) -> Result<Option<Message>, SessionError> {
        let conn = self.db.conn.lock();
        let last = conn
            .query_row(
                "SELECT id, role, content FROM agent_messages WHERE session_id = ?1 ORDER BY id DESC LIMIT 1",
                params![self.id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((row_id, role, content)) = last else {
            return Ok(None);
        };
        conn.execute("DELETE FROM agent_messages WHERE id = ?1", params![row_id])?;
        Ok(Role::parse(&role).map(|role| Message { role, content }))
    }

    pub fn clear_session(&self) -> Result<(), SessionError> {
        self.db.conn.lock().execute(
            "DELETE FROM agent_messages WHERE session_id = ?1",
            params![self.id],
        )?;
        Ok(())
    }

    pub fn item_count(&self) -> Result<usize, SessionError> {
        let count: i64 = self.db.conn.lock().query_row(
            "SELECT COUNT(*) FROM agent_messages WHERE session_id = ?1",
            params![self.id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_is_pure_function_of_key() {
        assert_eq!(session_id_for("coder"), "agent_coder");
        let db = SessionDb::in_memory().unwrap();
        let a = Session::open(db.clone(), "coder").unwrap();
        let b = Session::open(db, "coder").unwrap();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_items_roundtrip_and_limit() {
        let db = SessionDb::in_memory().unwrap();
        let s = Session::open(db, "a").unwrap();
        s.add_items(&[Message::user("q1"), Message::assistant("a1"), Message::user("q2")])
            .unwrap();
        assert_eq!(s.item_count().unwrap(), 3);
        let last_two = s.get_items(Some(2)).unwrap();
        assert_eq!(last_two, vec![Message::assistant("a1"), Message::user("q2")]);
        assert_eq!(s.get_items(None).unwrap().len(), 3);
    }

    #[test]
    fn test_pop_and_clear() {
        let db = SessionDb::in_memory().unwrap();
        let s = Session::open(db.clone(), "a").unwrap();
        let other = Session::open(db, "b").unwrap();
        s.add_items(&[Message::user("x"), Message::assistant("y")]).unwrap();
        other.add_items(&[Message::user("keep")]).unwrap();

        assert_eq!(s.pop_item().unwrap(), Some(Message::assistant("y")));
        s.clear_session().unwrap();
        assert_eq!(s.item_count().unwrap(), 0);
        assert_eq!(s.pop_item().unwrap(), None);
        assert_eq!(other.item_count().unwrap(), 1);
    }

    #[test]
    fn test_file_db_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db/sessions.db");
        {
            let s = Session::open(SessionDb::open(&path).unwrap(), "a").unwrap();
            s.add_items(&[Message::user("remember me")]).unwrap();
        }
        let s = Session::open(SessionDb::open(&path).unwrap(), "a").unwrap();
        assert_eq!(s.get_items(None).unwrap(), vec![Message::user("remember me")]);
    }
}
