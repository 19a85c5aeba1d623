//! echo：原样返回文本，用于连通性检查与测试

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::Tool;

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return `text` unchanged. Useful to check that tool calls reach the runtime."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let text = match &args {
            Value::String(s) => Some(s.as_str()),
            other => other.get("text").and_then(Value::as_str),
        };
        text.map(str::to_string)
            .ok_or_else(|| "echo expects a string field `text`".to_string())
    }
}
