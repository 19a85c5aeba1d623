//! 已构建的智能体句柄
//!
//! 由注册表独占缓存；会话只持有弱引用，会话本身归 SessionManager 所有，
//! 句柄重建（force_reload）后仍绑定同一个会话。

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};

use crate::llm::LlmClient;
use crate::session::Session;
use crate::tools::ToolSet;

pub struct AgentHandle {
    pub key: String,
    pub name: String,
    /// 构建时拼好的完整指令
    pub instructions: String,
    pub model: Arc<dyn LlmClient>,
    pub tools: Arc<ToolSet>,
    session: Weak<Session>,
    pub created_at: DateTime<Utc>,
}

impl AgentHandle {
    pub fn new(
        key: impl Into<String>,
        name: impl Into<String>,
        instructions: impl Into<String>,
        model: Arc<dyn LlmClient>,
        tools: Arc<ToolSet>,
        session: Weak<Session>,
    ) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            instructions: instructions.into(),
            model,
            tools,
            session,
            created_at: Utc::now(),
        }
    }

    /// 绑定的会话；会话已被 teardown 释放时返回 None
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.names()
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("model", &self.model.model_name())
            .field("tools", &self.tools.names())
            .field("created_at", &self.created_at)
            .finish()
    }
}
