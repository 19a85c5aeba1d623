//! 工具抽象与静态注册表
//!
//! 所有工具实现 Tool trait（name / description / execute）。
//! - `FunctionRegistry`：function 类工具的静态 name -> 工具表
//! - `ToolSet`：某个智能体解析后的工具集合，按配置顺序保存，执行时输出结构化审计日志

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{EchoTool, ListDirectoryTool, ReadFileTool};

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema，默认不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// function 工具注册表
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置工具：echo、read_file、list_directory（文件工具限定在 working_dir 内）
    pub fn with_builtins(working_dir: impl Into<PathBuf>) -> Self {
        let root = working_dir.into();
        let mut registry = Self::new();
        registry.register(EchoTool);
        registry.register(ReadFileTool::new(root.clone()));
        registry.register(ListDirectoryTool::new(root));
        registry
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

/// 智能体的已解析工具集合
#[derive(Default, Clone)]
pub struct ToolSet {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同名工具后插入的覆盖先插入的
    pub fn insert(&mut self, tool: Arc<dyn Tool>) {
        if let Some(slot) = self.tools.iter_mut().find(|t| t.name() == tool.name()) {
            *slot = tool;
        } else {
            self.tools.push(tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// (name, description)，用于拼 system prompt
    pub fn descriptions(&self) -> Vec<(String, String)> {
        self.tools
            .iter()
            .map(|t| (t.name().to_string(), t.description().to_string()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 执行工具并输出 JSON 审计日志
    pub async fn execute(&self, name: &str, args: Value) -> Result<String, String> {
        let tool = self.get(name).ok_or_else(|| format!("Unknown tool: {name}"))?;
        let start = Instant::now();
        let args_preview = crate::memory::store::truncate_chars(&args.to_string(), 200);
        let result = tool.execute(args).await;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "ok": result.is_ok(),
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit, "tool");
        result
    }
}
