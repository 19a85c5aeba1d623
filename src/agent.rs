//! 无头运行时
//!
//! 把配置、上下文存储、会话管理、工具解析、注册表和执行协调器装配在一起，
//! 供 CLI 或其他前端直接调用。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde_json::{Map, Value};
use tracing::info;

use crate::config::{load_config, GridConfig};
use crate::core::{
    AgentError, AgentRegistry, CacheCleanup, CleanupCoordinator, CleanupReport, ContextError,
    ExecutionCoordinator, ExecutionOutcome, McpCleanup, SessionCleanup,
};
use crate::llm::{ClientFactory, OpenAiClientFactory};
use crate::memory::{ContextStats, ContextStore, ExecutionRecord, Role};
use crate::session::{SessionError, SessionManager};
use crate::tools::{FunctionRegistry, McpConnector, McpPool, ToolResolver};

pub struct GridRuntime {
    config: Arc<GridConfig>,
    store: Arc<ContextStore>,
    sessions: Arc<SessionManager>,
    mcp: Arc<McpPool>,
    registry: Arc<AgentRegistry>,
    coordinator: ExecutionCoordinator,
}

impl GridRuntime {
    pub fn new(
        config: GridConfig,
        factory: Arc<dyn ClientFactory>,
        connector: Option<Arc<dyn McpConnector>>,
    ) -> Result<Self, SessionError> {
        let config = Arc::new(config);

        let mut store = ContextStore::new(config.get_max_history(), config.get_context_lock_timeout());
        if let Some(path) = &config.settings.context_snapshot_path {
            store = store.with_snapshot(config.get_absolute_path(path));
        }
        let store = Arc::new(store);

        let sessions = Arc::new(match &config.settings.session_db_path {
            Some(path) => SessionManager::open(config.get_absolute_path(path))?,
            None => SessionManager::in_memory()?,
        });

        let mcp = Arc::new(McpPool::new(connector));
        let resolver = ToolResolver::new(
            Arc::clone(&config),
            FunctionRegistry::with_builtins(config.get_working_directory()),
            Arc::clone(&store),
            Arc::clone(&sessions),
            Arc::clone(&mcp),
        );
        let registry = Arc::new(AgentRegistry::new(
            Arc::clone(&config),
            factory,
            Arc::clone(&store),
            Arc::clone(&sessions),
            resolver,
        ));
        let coordinator = ExecutionCoordinator::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&sessions),
        );

        info!(
            agents = config.agents.len(),
            tools = config.tools.len(),
            max_history = config.get_max_history(),
            "Runtime ready"
        );
        Ok(Self {
            config,
            store,
            sessions,
            mcp,
            registry,
            coordinator,
        })
    }

    /// 从配置文件加载并使用 OpenAI 兼容客户端
    pub fn from_config_path(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let config = load_config(path).context("Failed to load configuration")?;
        Self::new(config, Arc::new(OpenAiClientFactory), None).context("Failed to open session store")
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub async fn execute(
        &self,
        agent_key: &str,
        message: &str,
        context_path: Option<&Path>,
    ) -> Result<ExecutionOutcome, AgentError> {
        self.coordinator.execute(agent_key, message, context_path).await
    }

    /// 以默认智能体执行
    pub async fn execute_default(&self, message: &str) -> Result<ExecutionOutcome, AgentError> {
        let key = self.config.settings.default_agent.clone();
        self.execute(&key, message, None).await
    }

    /// 直接向共享上下文写入一条消息（不触发执行）
    pub fn add_to_context(
        &self,
        role: Role,
        content: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<(), ContextError> {
        self.store.add_message(role, content, metadata)
    }

    pub fn clear_context(&self) -> Result<(), ContextError> {
        self.store.clear_history()
    }

    pub fn context_info(&self) -> ContextStats {
        self.store.get_context_stats()
    }

    pub fn recent_executions(&self, agent_key: Option<&str>, limit: usize) -> Vec<ExecutionRecord> {
        self.store.get_recent_executions(agent_key, limit)
    }

    pub fn list_agents(&self) -> Vec<(String, String)> {
        self.config.list_agents()
    }

    /// 断开 MCP、清空会话与缓存
    pub async fn cleanup(&self) -> CleanupReport {
        let mut coordinator = CleanupCoordinator::new();
        coordinator.register(McpCleanup(Arc::clone(&self.mcp)));
        coordinator.register(SessionCleanup(Arc::clone(&self.sessions)));
        coordinator.register(CacheCleanup(Arc::clone(&self.registry)));
        coordinator.run().await
    }
}
