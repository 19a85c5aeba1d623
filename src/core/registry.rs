//! 智能体注册表
//!
//! 按 agent_key 缓存构建好的 `AgentHandle`，同一个 key 在未 force_reload 时始终返回同一个 Arc。
//! 构建过程：配置 -> 模型 -> 提供方 -> API Key -> LLM 客户端 -> 指令 -> 工具 -> 会话。
//!
//! 并发：每个 key 一把构建门（tokio Mutex），拿到门之后再查一次缓存，
//! 同一个 key 的并发 create 只会构建一次。不同 key 之间互不阻塞。
//!
//! 循环：agent 工具引用的子智能体通过 `create_nested` 递归构建，构建链随递归传递；
//! 顶层 create 额外对配置做一次静态 DFS，循环引用直接报错而不是跳过。

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::{GridConfig, ToolKind};
use crate::core::error::{AgentError, BuildError, ConfigError};
use crate::core::handle::AgentHandle;
use crate::llm::{ClientFactory, ClientSettings};
use crate::memory::ContextStore;
use crate::session::SessionManager;
use crate::tools::ToolResolver;

/// agent_key -> 当前句柄；agent 工具通过 Weak 引用在调用时查找最新句柄
pub type HandleCache = RwLock<HashMap<String, Arc<AgentHandle>>>;

pub struct AgentRegistry {
    config: Arc<GridConfig>,
    factory: Arc<dyn ClientFactory>,
    store: Arc<ContextStore>,
    sessions: Arc<SessionManager>,
    resolver: ToolResolver,
    cache: Arc<HandleCache>,
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    constructions: AtomicUsize,
}

impl AgentRegistry {
    pub fn new(
        config: Arc<GridConfig>,
        factory: Arc<dyn ClientFactory>,
        store: Arc<ContextStore>,
        sessions: Arc<SessionManager>,
        resolver: ToolResolver,
    ) -> Self {
        Self {
            config,
            factory,
            store,
            sessions,
            resolver,
            cache: Arc::new(RwLock::new(HashMap::new())),
            gates: Mutex::new(HashMap::new()),
            constructions: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &Arc<GridConfig> {
        &self.config
    }

    pub fn resolver(&self) -> &ToolResolver {
        &self.resolver
    }

    /// 获取或构建智能体
    ///
    /// - `context_path`：写入指令的路径上下文（仅在本次确实构建时生效）
    /// - `force_reload`：忽略缓存重新构建并替换缓存项；会话不变
    pub async fn create(
        &self,
        agent_key: &str,
        context_path: Option<&Path>,
        force_reload: bool,
    ) -> Result<Arc<AgentHandle>, AgentError> {
        if let Some(chain) = find_cycle(&self.config, agent_key) {
            return Err(AgentError::construction(agent_key, BuildError::Cycle { chain }));
        }
        self.create_inner(agent_key, context_path, force_reload, &[]).await
    }

    pub(crate) fn live_handles(&self) -> Weak<HandleCache> {
        Arc::downgrade(&self.cache)
    }

    /// 工具解析时构建子智能体；stack 为当前构建链
    pub(crate) fn create_nested<'a>(
        &'a self,
        agent_key: &'a str,
        stack: &'a [String],
    ) -> BoxFuture<'a, Result<Arc<AgentHandle>, AgentError>> {
        Box::pin(self.create_inner(agent_key, None, false, stack))
    }

    async fn create_inner(
        &self,
        agent_key: &str,
        context_path: Option<&Path>,
        force_reload: bool,
        stack: &[String],
    ) -> Result<Arc<AgentHandle>, AgentError> {
        if stack.iter().any(|k| k == agent_key) {
            let mut chain = stack.to_vec();
            chain.push(agent_key.to_string());
            return Err(AgentError::construction(agent_key, BuildError::Cycle { chain }));
        }

        if !force_reload {
            if let Some(handle) = self.cached(agent_key).await {
                return Ok(handle);
            }
        }

        let gate = self.gate(agent_key).await;
        let _guard = gate.lock().await;
        if !force_reload {
            if let Some(handle) = self.cached(agent_key).await {
                debug!(agent = %agent_key, "Built by a concurrent caller");
                return Ok(handle);
            }
        }

        let mut stack = stack.to_vec();
        stack.push(agent_key.to_string());
        let handle = self
            .build(agent_key, context_path, &stack)
            .await
            .map(Arc::new)
            .map_err(|e| AgentError::construction(agent_key, e))?;

        let replaced = self
            .cache
            .write()
            .await
            .insert(agent_key.to_string(), Arc::clone(&handle))
            .is_some();
        self.constructions.fetch_add(1, Ordering::SeqCst);
        info!(
            agent = %agent_key,
            model = %handle.model.model_name(),
            tools = handle.tools.len(),
            replaced,
            "Agent constructed"
        );
        Ok(handle)
    }

    async fn build(
        &self,
        agent_key: &str,
        context_path: Option<&Path>,
        stack: &[String],
    ) -> Result<AgentHandle, BuildError> {
        let agent = self.config.get_agent(agent_key)?;
        let model = self.config.get_model(&agent.model)?;
        let provider = self.config.get_provider(&model.provider)?;
        let api_key = self.config.get_api_key(&model.provider)?;

        let client = self.factory.build(&ClientSettings {
            api_key,
            base_url: provider.base_url.clone(),
            timeout: Duration::from_secs(provider.timeout),
            max_retries: provider.max_retries,
            model: model.name.clone(),
            temperature: model.temperature,
            max_tokens: model.max_tokens,
        })?;

        let instructions = self.build_instructions(agent_key, context_path)?;
        let tools = self.resolver.resolve(self, agent_key, agent, stack).await?;
        let session = self.sessions.get_or_create(agent_key).await?;

        Ok(AgentHandle::new(
            agent_key,
            agent.name.clone().unwrap_or_else(|| agent_key.to_string()),
            instructions,
            client,
            tools,
            Arc::downgrade(&session),
        ))
    }

    /// 提示词 + 路径上下文 + 当前对话上下文（非空时）
    fn build_instructions(
        &self,
        agent_key: &str,
        context_path: Option<&Path>,
    ) -> Result<String, ConfigError> {
        let mut parts = vec![self.config.build_agent_prompt(agent_key)?];

        let mut paths = format!(
            "Working directory: {}\nConfig directory: {}",
            self.config.get_working_directory().display(),
            self.config.get_config_directory().display()
        );
        if let Some(path) = context_path {
            paths.push_str(&format!(
                "\nContext path: {}\nAbsolute context path: {}",
                path.display(),
                self.config.get_absolute_path(path).display()
            ));
        }
        parts.push(paths);

        let conversation = self.store.get_conversation_context(None);
        if !conversation.is_empty() {
            parts.push(conversation);
        }
        Ok(parts.into_iter().filter(|p| !p.is_empty()).collect::<Vec<_>>().join("\n\n"))
    }

    async fn gate(&self, agent_key: &str) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().await;
        Arc::clone(gates.entry(agent_key.to_string()).or_default())
    }

    pub async fn cached(&self, agent_key: &str) -> Option<Arc<AgentHandle>> {
        self.cache.read().await.get(agent_key).cloned()
    }

    pub async fn cached_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.cache.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// 清空智能体缓存与工具缓存；会话不受影响
    pub async fn clear_cache(&self) {
        let dropped = {
            let mut cache = self.cache.write().await;
            let n = cache.len();
            cache.clear();
            n
        };
        self.resolver.clear_cache().await;
        info!(dropped, "Agent cache cleared");
    }

    /// 实际构建次数（缓存命中不计）
    pub fn construction_count(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }
}

/// 从 start 出发沿 agent 工具边做 DFS，返回发现的第一个环（首尾相同）
pub fn find_cycle(config: &GridConfig, start: &str) -> Option<Vec<String>> {
    fn visit(
        config: &GridConfig,
        key: &str,
        path: &mut Vec<String>,
        done: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = path.iter().position(|k| k == key) {
            let mut chain = path[pos..].to_vec();
            chain.push(key.to_string());
            return Some(chain);
        }
        if done.contains(key) {
            return None;
        }
        let Ok(agent) = config.get_agent(key) else {
            return None;
        };

        path.push(key.to_string());
        for tool_key in &agent.tools {
            let Ok(tool) = config.get_tool(tool_key) else {
                continue;
            };
            if tool.kind != ToolKind::Agent {
                continue;
            }
            if let Some(chain) = visit(config, tool.target_agent_key(tool_key), path, done) {
                return Some(chain);
            }
        }
        path.pop();
        done.insert(key.to_string());
        None
    }

    visit(config, start, &mut Vec::new(), &mut HashSet::new())
}
