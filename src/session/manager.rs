//! 会话管理器
//!
//! 按 agent_key 懒创建会话，每个 key 在进程生命周期内最多创建一次；
//! teardown 逐个清理，单个会话失败不影响其余会话。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use super::store::{Session, SessionDb, SessionError};

/// teardown 结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub cleared: Vec<String>,
    /// (session_id, 错误信息)
    pub failed: Vec<(String, String)>,
}

pub struct SessionManager {
    db: SessionDb,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(db: SessionDb) -> Self {
        Self {
            db,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// 内存 SQLite（进程内持久）
    pub fn in_memory() -> Result<Self, SessionError> {
        Ok(Self::new(SessionDb::in_memory()?))
    }

    /// 文件 SQLite（跨进程持久）
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        Ok(Self::new(SessionDb::open(path)?))
    }

    /// 取得或创建 agent_key 对应的会话；持锁创建保证同一 key 只创建一次
    pub async fn get_or_create(&self, agent_key: &str) -> Result<Arc<Session>, SessionError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(agent_key) {
            return Ok(Arc::clone(session));
        }
        let session = Arc::new(Session::open(self.db.clone(), agent_key)?);
        info!(agent = %agent_key, session = %session.id(), "Session created");
        sessions.insert(agent_key.to_string(), Arc::clone(&session));
        Ok(session)
    }

    pub async fn get(&self, agent_key: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(agent_key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// 清空全部会话内容并释放句柄
    pub async fn teardown(&self) -> TeardownReport {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, s)| s).collect()
        };

        let mut report = TeardownReport::default();
        for session in drained {
            match session.clear_session() {
                Ok(()) => report.cleared.push(session.id().to_string()),
                Err(e) => {
                    warn!(session = %session.id(), error = %e, "Session cleanup failed");
                    report.failed.push((session.id().to_string(), e.to_string()));
                }
            }
        }
        info!(
            cleared = report.cleared.len(),
            failed = report.failed.len(),
            "Sessions torn down"
        );
        report
    }
}
