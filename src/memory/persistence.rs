//! 上下文快照持久化
//!
//! 单个 JSON 文件：conversation_history / execution_history / metadata / saved_at。
//! 时间戳使用 RFC 3339，读写无损。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::ContextError;
use crate::memory::{ContextMessage, ExecutionRecord};

/// 快照内容
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    #[serde(default)]
    pub conversation_history: Vec<ContextMessage>,
    #[serde(default)]
    pub execution_history: Vec<ExecutionRecord>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub saved_at: DateTime<Utc>,
}

/// 快照文件
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// 读取快照；文件不存在时返回 None
    pub fn read(&self) -> Result<Option<ContextSnapshot>, ContextError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// 写入快照；父目录不存在时自动创建
    pub fn write(&self, snapshot: &ContextSnapshot) -> Result<(), ContextError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(snapshot)?)?;
        Ok(())
    }

    pub fn remove(&self) -> Result<(), ContextError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
