//! 错误分类
//!
//! - ConfigError：配置键缺失（agent / model / provider / tool / 模板）或 API Key 缺失
//! - BuildError：构建智能体时的底层原因（配置、客户端、会话、循环引用）
//! - AgentError：注册表与执行协调器对外暴露的错误，始终携带 agent_key 并保留原始 cause
//! - ContextError：上下文存储的锁超时与快照读写失败

use std::time::Duration;

use thiserror::Error;

use crate::llm::LlmError;
use crate::react::RunError;
use crate::session::SessionError;

/// 配置查找失败（对当前操作是致命的）
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Agent '{0}' not found")]
    AgentNotFound(String),

    #[error("Model '{0}' not found")]
    ModelNotFound(String),

    #[error("Provider '{0}' not found")]
    ProviderNotFound(String),

    #[error("Tool '{0}' not found")]
    ToolNotFound(String),

    #[error("Prompt template '{0}' not found")]
    PromptTemplateNotFound(String),

    #[error(
        "API key not found for provider '{provider}' (env var: {})",
        .env_var.as_deref().unwrap_or("<unset>")
    )]
    MissingApiKey {
        provider: String,
        env_var: Option<String>,
    },

    #[error("Configuration load failed: {0}")]
    Load(#[from] config::ConfigError),
}

/// 上下文存储错误
#[derive(Error, Debug)]
pub enum ContextError {
    /// 写路径拿不到锁时返回；读路径在内部吞掉并降级为占位值
    #[error("Context lock not acquired within {}ms ({operation})", .waited.as_millis())]
    LockTimeout {
        operation: &'static str,
        waited: Duration,
    },

    #[error("Snapshot IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 构建智能体过程中某一步失败的原因
#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Client construction failed: {0}")]
    Client(#[from] LlmError),

    #[error("Session unavailable: {0}")]
    Session(#[from] SessionError),

    /// agent-as-tool 配置形成环（A 用 B，B 又用 A）
    #[error("Agent construction cycle: {}", .chain.join(" -> "))]
    Cycle { chain: Vec<String> },
}

/// 注册表 / 执行协调器对外的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Failed to create agent '{agent_key}': {source}")]
    Construction {
        agent_key: String,
        #[source]
        source: BuildError,
    },

    #[error(
        "Agent '{agent_key}' execution timed out after {} seconds",
        .timeout.as_secs_f64()
    )]
    Timeout { agent_key: String, timeout: Duration },

    #[error("Agent '{agent_key}' execution failed: {source}")]
    Execution {
        agent_key: String,
        #[source]
        source: RunError,
    },

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl AgentError {
    pub fn construction(agent_key: impl Into<String>, source: impl Into<BuildError>) -> Self {
        Self::Construction {
            agent_key: agent_key.into(),
            source: source.into(),
        }
    }

    pub fn agent_key(&self) -> Option<&str> {
        match self {
            Self::Construction { agent_key, .. }
            | Self::Timeout { agent_key, .. }
            | Self::Execution { agent_key, .. } => Some(agent_key),
            Self::Context(_) => None,
        }
    }

    /// 若为循环引用错误，返回环路径
    pub fn cycle_chain(&self) -> Option<&[String]> {
        match self {
            Self::Construction {
                source: BuildError::Cycle { chain },
                ..
            } => Some(chain),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
