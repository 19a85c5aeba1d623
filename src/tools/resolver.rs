//! 工具解析
//!
//! 把智能体配置里的工具名列表按类型（function / agent / mcp）分组解析为 `ToolSet`，
//! 结果按 (智能体名, 工具名列表哈希) 缓存。单个工具解析失败只告警并跳过；
//! 唯一会中止构建的是 agent 工具形成的循环引用。

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::{AgentConfig, GridConfig, ToolConfig, ToolKind};
use crate::core::{AgentRegistry, BuildError};
use crate::memory::ContextStore;
use crate::session::SessionManager;
use crate::tools::agent_tool::{AgentTool, InjectionPolicy};
use crate::tools::{FunctionRegistry, McpPool, ToolSet};

/// 上下文存储中记录不可用 MCP 工具的 metadata 键
pub const MCP_UNAVAILABLE_KEY: &str = "mcp_unavailable";

type CacheKey = (String, u64);

fn hash_tool_names(names: &[String]) -> u64 {
    let mut hasher = DefaultHasher::new();
    names.hash(&mut hasher);
    hasher.finish()
}

pub struct ToolResolver {
    config: Arc<GridConfig>,
    functions: FunctionRegistry,
    store: Arc<ContextStore>,
    sessions: Arc<SessionManager>,
    mcp: Arc<McpPool>,
    cache: RwLock<HashMap<CacheKey, Arc<ToolSet>>>,
}

impl ToolResolver {
    pub fn new(
        config: Arc<GridConfig>,
        functions: FunctionRegistry,
        store: Arc<ContextStore>,
        sessions: Arc<SessionManager>,
        mcp: Arc<McpPool>,
    ) -> Self {
        Self {
            config,
            functions,
            store,
            sessions,
            mcp,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn mcp_pool(&self) -> &Arc<McpPool> {
        &self.mcp
    }

    /// 解析 agent_key 的工具集合；stack 为当前构建链（用于循环检测）
    pub async fn resolve(
        &self,
        registry: &AgentRegistry,
        agent_key: &str,
        agent: &AgentConfig,
        stack: &[String],
    ) -> Result<Arc<ToolSet>, BuildError> {
        let cache_key = (agent_key.to_string(), hash_tool_names(&agent.tools));
        if let Some(set) = self.cache.read().await.get(&cache_key) {
            debug!(agent = %agent_key, "Tool set cache hit");
            return Ok(Arc::clone(set));
        }

        let mut set = ToolSet::new();
        let mut mcp_tools = Vec::new();
        for tool_key in &agent.tools {
            let tool_cfg = match self.config.get_tool(tool_key) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(agent = %agent_key, error = %e, "Skipping unknown tool");
                    continue;
                }
            };
            match tool_cfg.kind {
                ToolKind::Function => self.resolve_function(agent_key, tool_key, tool_cfg, &mut set),
                ToolKind::Agent => {
                    self.resolve_agent(registry, agent_key, tool_key, tool_cfg, stack, &mut set)
                        .await?
                }
                ToolKind::Mcp => mcp_tools.push((tool_key.as_str(), tool_cfg)),
            }
        }
        self.resolve_mcp(agent_key, agent, &mcp_tools, &mut set).await;

        let set = Arc::new(set);
        self.cache.write().await.insert(cache_key, Arc::clone(&set));
        debug!(agent = %agent_key, tools = ?set.names(), "Tools resolved");
        Ok(set)
    }

    fn resolve_function(&self, agent_key: &str, tool_key: &str, cfg: &ToolConfig, set: &mut ToolSet) {
        let name = cfg.name.as_deref().unwrap_or(tool_key);
        match self.functions.get(name) {
            Some(tool) => set.insert(tool),
            None => warn!(agent = %agent_key, tool = %name, "Function tool not registered, skipping"),
        }
    }

    async fn resolve_agent(
        &self,
        registry: &AgentRegistry,
        agent_key: &str,
        tool_key: &str,
        cfg: &ToolConfig,
        stack: &[String],
        set: &mut ToolSet,
    ) -> Result<(), BuildError> {
        let target_key = cfg.target_agent_key(tool_key);
        match registry.create_nested(target_key, stack).await {
            Ok(target) => {
                let tool_name = cfg
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("call_{}", target_key));
                let tool = AgentTool::new(
                    tool_name,
                    cfg.description.as_deref(),
                    target,
                    registry.live_handles(),
                    Arc::clone(&self.store),
                    Arc::clone(&self.sessions),
                    InjectionPolicy {
                        strategy: cfg.context_strategy,
                        depth: cfg.context_depth,
                        include_tools: cfg.include_tool_history,
                    },
                    self.config.get_max_turns(),
                );
                set.insert(Arc::new(tool));
                Ok(())
            }
            Err(e) => {
                if let Some(chain) = e.cycle_chain() {
                    return Err(BuildError::Cycle {
                        chain: chain.to_vec(),
                    });
                }
                warn!(agent = %agent_key, tool = %tool_key, error = %e, "Sub-agent tool unavailable, skipping");
                Ok(())
            }
        }
    }

    async fn resolve_mcp(
        &self,
        agent_key: &str,
        agent: &AgentConfig,
        tools: &[(&str, &ToolConfig)],
        set: &mut ToolSet,
    ) {
        if tools.is_empty() {
            return;
        }
        let mut unavailable: Vec<String> = Vec::new();
        if agent.mcp_enabled || self.config.is_mcp_enabled() {
            let cwd = self.config.get_working_directory();
            for (name, cfg) in tools {
                match self.mcp.tools_for(name, cfg, &cwd).await {
                    Ok(handles) => handles.into_iter().for_each(|t| set.insert(t)),
                    Err(e) => {
                        warn!(agent = %agent_key, tool = %name, error = %e, "MCP tool unavailable");
                        unavailable.push(name.to_string());
                    }
                }
            }
        } else {
            debug!(agent = %agent_key, "MCP disabled, skipping MCP tools");
            unavailable.extend(tools.iter().map(|(name, _)| name.to_string()));
        }

        if !unavailable.is_empty() {
            if let Err(e) = self.store.set_metadata(MCP_UNAVAILABLE_KEY, json!(unavailable)) {
                warn!(error = %e, "Failed to record unavailable MCP tools");
            }
        }
    }

    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }
}
