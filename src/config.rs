//! 应用配置：从 config/grid.{yaml,toml} 与环境变量加载
//!
//! 加载顺序：先读配置文件，再用环境变量 `GRID__*` 覆盖（双下划线表示嵌套，如 `GRID__SETTINGS__MAX_HISTORY=30`）。
//! 注意 config crate 会把键名转成小写，agent / tool / provider 的 key 应使用小写。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::ConfigError;
use crate::memory::ContextStrategy;

/// 配置根
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GridConfig {
    pub settings: Settings,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub models: BTreeMap<String, ModelConfig>,
    pub agents: BTreeMap<String, AgentConfig>,
    pub tools: BTreeMap<String, ToolConfig>,
    pub prompt_templates: BTreeMap<String, String>,
    /// 配置文件所在目录（加载时填入）
    #[serde(skip)]
    pub source_dir: Option<PathBuf>,
}

/// [settings] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub default_agent: String,
    /// 对话历史上限（执行历史为其两倍）
    pub max_history: usize,
    /// 单次执行内 LLM 调用轮数上限
    pub max_turns: usize,
    /// 单次执行超时（秒）
    pub agent_timeout: u64,
    pub mcp_enabled: bool,
    pub working_directory: Option<PathBuf>,
    pub config_directory: Option<PathBuf>,
    /// 所有工具共用的规则，拼在工具说明之前
    pub tools_common_rules: Option<String>,
    /// 上下文存储加锁等待上限（毫秒）
    pub context_lock_timeout_ms: u64,
    /// 上下文快照文件；未设置时不落盘
    pub context_snapshot_path: Option<PathBuf>,
    /// 会话 SQLite 文件；未设置时使用内存数据库
    pub session_db_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_agent: "assistant".to_string(),
            max_history: 15,
            max_turns: 10,
            agent_timeout: 300,
            mcp_enabled: false,
            working_directory: None,
            config_directory: None,
            tools_common_rules: None,
            context_lock_timeout_ms: 5000,
            context_snapshot_path: None,
            session_db_path: None,
        }
    }
}

/// [providers.<key>] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    /// 显式 API Key（优先于环境变量）
    pub api_key: Option<String>,
    /// 存放 API Key 的环境变量名
    pub api_key_env: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_provider_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

/// [models.<key>] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// 发给 provider 的模型名
    pub name: String,
    pub provider: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4000
}

/// [agents.<key>] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub name: Option<String>,
    pub model: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_base_prompt")]
    pub base_prompt: String,
    pub custom_prompt: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub mcp_enabled: bool,
}

fn default_base_prompt() -> String {
    "base".to_string()
}

/// 工具类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Function,
    Agent,
    Mcp,
}

/// [tools.<key>] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ToolConfig {
    #[serde(rename = "type")]
    pub kind: ToolKind,
    pub name: Option<String>,
    pub description: Option<String>,
    pub prompt_addition: Option<String>,
    /// agent 工具的目标智能体；未设置时使用工具 key
    pub target_agent: Option<String>,
    #[serde(default)]
    pub context_strategy: ContextStrategy,
    #[serde(default = "default_context_depth")]
    pub context_depth: i64,
    #[serde(default = "default_include_tool_history")]
    pub include_tool_history: bool,
    /// mcp 工具的启动命令（程序 + 参数）
    #[serde(default)]
    pub server_command: Vec<String>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

fn default_context_depth() -> i64 {
    5
}

fn default_include_tool_history() -> bool {
    true
}

impl ToolConfig {
    /// agent 工具指向的智能体 key
    pub fn target_agent_key<'a>(&'a self, tool_key: &'a str) -> &'a str {
        self.target_agent.as_deref().unwrap_or(tool_key)
    }
}

impl GridConfig {
    /// 解析内存中的 YAML 文档
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let c = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?;
        Ok(c.try_deserialize()?)
    }

    pub fn get_agent(&self, agent_key: &str) -> Result<&AgentConfig, ConfigError> {
        self.agents
            .get(agent_key)
            .ok_or_else(|| ConfigError::AgentNotFound(agent_key.to_string()))
    }

    pub fn get_model(&self, model_key: &str) -> Result<&ModelConfig, ConfigError> {
        self.models
            .get(model_key)
            .ok_or_else(|| ConfigError::ModelNotFound(model_key.to_string()))
    }

    pub fn get_provider(&self, provider_key: &str) -> Result<&ProviderConfig, ConfigError> {
        self.providers
            .get(provider_key)
            .ok_or_else(|| ConfigError::ProviderNotFound(provider_key.to_string()))
    }

    pub fn get_tool(&self, tool_key: &str) -> Result<&ToolConfig, ConfigError> {
        self.tools
            .get(tool_key)
            .ok_or_else(|| ConfigError::ToolNotFound(tool_key.to_string()))
    }

    pub fn get_prompt_template(&self, name: &str) -> Result<&str, ConfigError> {
        self.prompt_templates
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::PromptTemplateNotFound(name.to_string()))
    }

    /// 显式 api_key 优先，其次读取 api_key_env 指定的环境变量
    pub fn get_api_key(&self, provider_key: &str) -> Result<String, ConfigError> {
        let provider = self.get_provider(provider_key)?;
        if let Some(key) = provider.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            return Ok(key.to_string());
        }
        if let Some(env_var) = &provider.api_key_env {
            if let Ok(key) = std::env::var(env_var) {
                if !key.trim().is_empty() {
                    return Ok(key);
                }
            }
        }
        Err(ConfigError::MissingApiKey {
            provider: provider_key.to_string(),
            env_var: provider.api_key_env.clone(),
        })
    }

    /// 智能体提示词：custom_prompt 或模板，其后是通用工具规则与各工具的 prompt_addition
    pub fn build_agent_prompt(&self, agent_key: &str) -> Result<String, ConfigError> {
        let agent = self.get_agent(agent_key)?;
        let base = match &agent.custom_prompt {
            Some(custom) => custom.clone(),
            None => self
                .get_prompt_template(&agent.base_prompt)
                .map(str::to_string)
                .unwrap_or_else(|e| {
                    debug!(agent = %agent_key, error = %e, "Using empty base prompt");
                    String::new()
                }),
        };

        let mut additions = Vec::new();
        for tool_key in &agent.tools {
            match self.get_tool(tool_key) {
                Ok(tool) => {
                    if let Some(add) = tool.prompt_addition.as_deref().filter(|a| !a.trim().is_empty()) {
                        additions.push(add.to_string());
                    }
                }
                Err(e) => warn!(agent = %agent_key, error = %e, "Skipping tool in prompt"),
            }
        }

        let mut parts = vec![base];
        if let Some(rules) = self.settings.tools_common_rules.as_deref().filter(|r| !r.trim().is_empty()) {
            parts.push(rules.to_string());
        }
        if !additions.is_empty() {
            parts.push("Available tools:".to_string());
            parts.extend(additions);
        }
        Ok(parts.join("\n"))
    }

    pub fn get_max_history(&self) -> usize {
        self.settings.max_history
    }

    pub fn get_max_turns(&self) -> usize {
        self.settings.max_turns
    }

    pub fn get_agent_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.agent_timeout)
    }

    pub fn get_context_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.context_lock_timeout_ms)
    }

    /// settings.working_directory，未设置时为当前目录
    pub fn get_working_directory(&self) -> PathBuf {
        self.settings
            .working_directory
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// settings.config_directory，未设置时为配置文件所在目录
    pub fn get_config_directory(&self) -> PathBuf {
        self.settings
            .config_directory
            .clone()
            .or_else(|| self.source_dir.clone())
            .unwrap_or_else(|| self.get_working_directory())
    }

    /// 相对路径按工作目录解析
    pub fn get_absolute_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.get_working_directory().join(path)
        }
    }

    /// (agent_key, 描述)；描述缺省时用 name，再缺省用 key
    pub fn list_agents(&self) -> Vec<(String, String)> {
        self.agents
            .iter()
            .map(|(key, a)| {
                let desc = a
                    .description
                    .clone()
                    .or_else(|| a.name.clone())
                    .unwrap_or_else(|| key.clone());
                (key.clone(), desc)
            })
            .collect()
    }

    pub fn is_mcp_enabled(&self) -> bool {
        self.settings.mcp_enabled
    }
}

/// 从 config 目录加载配置，环境变量 GRID__* 可覆盖
///
/// 1. 按顺序查找 config/grid、../config/grid、grid（yaml / yml / toml），找到则作为第一源
/// 2. 若传入 config_path 则追加该文件（可覆盖前面的键）；文件不存在时报错
/// 3. 最后叠加环境变量 GRID__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<GridConfig, ConfigError> {
    let mut builder = config::Config::builder();
    let mut source_dir = None;

    'search: for name in ["config/grid", "../config/grid", "grid"] {
        for ext in ["yaml", "yml", "toml"] {
            let path = PathBuf::from(format!("{}.{}", name, ext));
            if path.exists() {
                source_dir = path.parent().map(Path::to_path_buf);
                builder = builder.add_source(config::File::from(path).required(false));
                break 'search;
            }
        }
    }

    if let Some(path) = config_path {
        source_dir = path.parent().map(Path::to_path_buf);
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("GRID")
            .separator("__")
            .try_parsing(true),
    );

    let mut cfg: GridConfig = builder.build()?.try_deserialize()?;
    cfg.source_dir = source_dir.map(|d| {
        if d.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            d
        }
    });
    Ok(cfg)
}
