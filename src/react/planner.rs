//! Tool Call 解析
//!
//! LLM 回复中若含有效 JSON（```json ... ``` 或裸 JSON）且 tool 非空，则为 ToolCall，否则为最终回复。

use serde::{Deserialize, Serialize};

/// LLM 返回的 Tool Call（简化 JSON：{"tool": "read_file", "args": {"path": "..."}}）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// 解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// 最终回复
    Response(String),
    /// 需要执行工具
    ToolCall(ToolCall),
}

fn extract_json(trimmed: &str) -> Option<&str> {
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 解析 LLM 输出；JSON 不合法或 tool 为空时按普通回复处理
pub fn parse_llm_output(output: &str) -> PlannerOutput {
    let trimmed = output.trim();
    match extract_json(trimmed).and_then(|json| serde_json::from_str::<ToolCall>(json).ok()) {
        Some(call) if !call.tool.trim().is_empty() => PlannerOutput::ToolCall(call),
        _ => PlannerOutput::Response(trimmed.to_string()),
    }
}
