//! agent-as-tool：把子智能体包装成父智能体可调用的工具
//!
//! 每次调用：
//! 1. 从参数中取任务文本（task / message / prompt / input，按此顺序取第一个非空值）
//! 2. 以 user 消息写入上下文存储，标注工具名
//! 3. 按工具配置的策略从上下文存储生成注入文本
//! 4. 用子智能体自己的会话执行
//! 5. 结果以 assistant 消息写回上下文存储
//! 6. 无论成败都追加一条执行记录
//!
//! 目标智能体在每次调用时从注册表的当前缓存中查找，force_reload 之后调用的是新句柄。

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::core::registry::HandleCache;
use crate::core::AgentHandle;
use crate::memory::{
    ContextStore, ContextStrategy, ContextStrategyEngine, ContextView, ExecutionRecord, Role,
};
use crate::react::{run_agent, RunOutput, EMPTY_OUTPUT_FALLBACK};
use crate::session::SessionManager;
use crate::tools::Tool;

/// 参数中可承载任务文本的字段，按优先级排列
const INPUT_ALIASES: [&str; 4] = ["task", "message", "prompt", "input"];

const CALL_RULE: &str = "Call with a single string field `input`. Accepted aliases: task, message, prompt.";

/// 取第一个非空别名字段；参数本身是字符串时直接使用
pub fn normalize_input(args: &Value) -> Option<String> {
    match args {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Object(map) => INPUT_ALIASES.iter().find_map(|key| {
            map.get(*key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        }),
        _ => None,
    }
}

/// 上下文注入参数
#[derive(Debug, Clone, Copy)]
pub struct InjectionPolicy {
    pub strategy: ContextStrategy,
    pub depth: i64,
    pub include_tools: bool,
}

pub struct AgentTool {
    tool_name: String,
    description: String,
    /// 构建时的句柄；缓存中找不到目标时使用
    target: Arc<AgentHandle>,
    live: Weak<HandleCache>,
    store: Arc<ContextStore>,
    sessions: Arc<SessionManager>,
    policy: InjectionPolicy,
    max_turns: usize,
}

impl AgentTool {
    pub fn new(
        tool_name: impl Into<String>,
        description: Option<&str>,
        target: Arc<AgentHandle>,
        live: Weak<HandleCache>,
        store: Arc<ContextStore>,
        sessions: Arc<SessionManager>,
        policy: InjectionPolicy,
        max_turns: usize,
    ) -> Self {
        let base = description
            .map(str::to_string)
            .unwrap_or_else(|| format!("Delegate a task to {}", target.name));
        Self {
            tool_name: tool_name.into(),
            description: format!("{}\n{}", base, CALL_RULE),
            target,
            live,
            store,
            sessions,
            policy,
            max_turns,
        }
    }

    async fn current_target(&self) -> Arc<AgentHandle> {
        if let Some(cache) = self.live.upgrade() {
            if let Some(handle) = cache.read().await.get(&self.target.key) {
                return Arc::clone(handle);
            }
        }
        Arc::clone(&self.target)
    }

    pub fn target_key(&self) -> &str {
        &self.target.key
    }

    fn tagged(&self, kind: &str) -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert("tool".into(), Value::String(self.tool_name.clone()));
        meta.insert("kind".into(), Value::String(kind.to_string()));
        meta
    }

    async fn invoke(&self, input: &str) -> Result<RunOutput, String> {
        self.store
            .add_message(
                Role::User,
                format!("[{}] {}", self.tool_name, input),
                Some(self.tagged("agent_tool_input")),
            )
            .map_err(|e| e.to_string())?;

        let view = self.store.view().unwrap_or_else(|| {
            warn!(tool = %self.tool_name, "Context unavailable, injecting task only");
            ContextView::default()
        });
        let task = ContextStrategyEngine::build(
            &view,
            self.policy.strategy,
            self.policy.depth,
            self.policy.include_tools,
            input,
        );

        let target = self.current_target().await;
        let session = match target.session() {
            Some(s) => s,
            None => self
                .sessions
                .get_or_create(&target.key)
                .await
                .map_err(|e| e.to_string())?,
        };

        let mut out = run_agent(&target, &task, None, self.max_turns, &session)
            .await
            .map_err(|e| e.to_string())?;
        if out.final_output.trim().is_empty() {
            out.final_output = EMPTY_OUTPUT_FALLBACK.to_string();
        }

        self.store
            .add_tool_result_as_message(&self.tool_name, &out.final_output)
            .map_err(|e| e.to_string())?;
        Ok(out)
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "input": { "type": "string" } },
            "required": ["input"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let input = normalize_input(&args).unwrap_or_default();
        let record = ExecutionRecord::start(&self.target.key, &input);
        if input.is_empty() {
            let message = format!(
                "Empty input for tool '{}'. Pass a non-empty 'input' string.",
                self.tool_name
            );
            warn!(tool = %self.tool_name, "Agent tool called without input");
            self.store.add_execution(record.fail(message.clone()));
            return Err(message);
        }

        info!(tool = %self.tool_name, agent = %self.target.key, "Agent tool invoked");
        let result = self.invoke(&input).await;
        let record = match &result {
            Ok(out) => record.succeed(out.final_output.clone(), out.tools_used.clone()),
            Err(e) => record.fail(e.clone()),
        };
        self.store.add_execution(record);
        result.map(|out| out.final_output)
    }
}
