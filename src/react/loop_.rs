//! 单个智能体的 ReAct 循环
//!
//! system(instructions + 工具清单) [+ system(注入上下文)] + 会话历史 + user(input) -> LLM ->
//! 若为 Tool Call 则执行并写回 Observation，进入下一轮；若为回复则写入会话并返回。
//! 工具不存在或执行失败都作为 Observation 交回给 LLM，不中止循环。

use thiserror::Error;
use tracing::{debug, info};

use crate::core::AgentHandle;
use crate::llm::LlmError;
use crate::memory::Message;
use crate::react::planner::{parse_llm_output, PlannerOutput};
use crate::session::{Session, SessionError};

/// 每次执行从会话中带入的历史条数
const SESSION_HISTORY_LIMIT: usize = 20;
/// 日志中 Observation 预览字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 智能体最终回复为空时使用的替代文本
pub const EMPTY_OUTPUT_FALLBACK: &str =
    "The agent completed the task but returned no text output. Check the logs for execution details.";

/// ReAct 循环错误
#[derive(Error, Debug)]
pub enum RunError {
    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("No final answer within {0} turns")]
    MaxTurnsExceeded(usize),
}

/// 一次执行的结果
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub final_output: String,
    /// 按调用顺序记录的工具名
    pub tools_used: Vec<String>,
    pub turns: usize,
}

fn system_prompt(agent: &AgentHandle) -> String {
    let descriptions = agent.tools.descriptions();
    if descriptions.is_empty() {
        return agent.instructions.clone();
    }
    let list: Vec<String> = descriptions
        .iter()
        .map(|(name, desc)| format!("- {}: {}", name, desc))
        .collect();
    format!(
        "{}\n\nTools you can call:\n{}\n\nTo call a tool, reply with only a JSON object: \
         {{\"tool\": \"<name>\", \"args\": {{...}}}}. Otherwise reply with your final answer.",
        agent.instructions,
        list.join("\n")
    )
}

fn preview(s: &str) -> String {
    crate::memory::store::truncate_chars(s, OBSERVATION_PREVIEW_CHARS)
}

/// 执行智能体直到得到最终回复，最多调用 LLM max_turns 次
pub async fn run_agent(
    agent: &AgentHandle,
    input: &str,
    context: Option<&str>,
    max_turns: usize,
    session: &Session,
) -> Result<RunOutput, RunError> {
    let mut messages = vec![Message::system(system_prompt(agent))];
    if let Some(ctx) = context.filter(|c| !c.trim().is_empty()) {
        messages.push(Message::system(ctx));
    }
    messages.extend(session.get_items(Some(SESSION_HISTORY_LIMIT))?);
    messages.push(Message::user(input));

    let mut tools_used = Vec::new();
    for turn in 1..=max_turns {
        debug!(agent = %agent.key, turn, "Planning");
        let reply = agent.model.complete(&messages).await?;

        match parse_llm_output(&reply) {
            PlannerOutput::Response(answer) => {
                session.add_items(&[Message::user(input), Message::assistant(answer.clone())])?;
                info!(agent = %agent.key, turns = turn, tools = tools_used.len(), "Agent finished");
                return Ok(RunOutput {
                    final_output: answer,
                    tools_used,
                    turns: turn,
                });
            }
            PlannerOutput::ToolCall(call) => {
                let observation = if agent.tools.contains(&call.tool) {
                    tools_used.push(call.tool.clone());
                    match agent.tools.execute(&call.tool, call.args.clone()).await {
                        Ok(out) => out,
                        Err(e) => format!("Error: {}", e),
                    }
                } else {
                    format!(
                        "Unknown tool: {}. Available tools: {}",
                        call.tool,
                        agent.tools.names().join(", ")
                    )
                };
                debug!(agent = %agent.key, tool = %call.tool, observation = %preview(&observation), "Observation");
                messages.push(Message::assistant(reply));
                messages.push(Message::user(format!("Observation: {}", observation)));
            }
        }
    }
    Err(RunError::MaxTurnsExceeded(max_turns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::llm::{LlmClient, MockLlmClient};
    use crate::session::SessionDb;
    use crate::tools::{EchoTool, ToolSet};

    fn agent(model: Arc<dyn LlmClient>, session: &Arc<Session>) -> AgentHandle {
        let mut tools = ToolSet::new();
        tools.insert(Arc::new(EchoTool));
        AgentHandle::new(
            "tester",
            "Tester",
            "You test things.",
            model,
            Arc::new(tools),
            Arc::downgrade(session),
        )
    }

    fn session() -> Arc<Session> {
        Arc::new(Session::open(SessionDb::in_memory().unwrap(), "tester").unwrap())
    }

    #[tokio::test]
    async fn test_tool_call_then_answer() {
        let s = session();
        let model = Arc::new(MockLlmClient::new("m").with_replies([
            r#"{"tool": "echo", "args": {"text": "ping"}}"#,
            "pong",
        ]));
        let a = agent(model.clone(), &s);
        let out = run_agent(&a, "say ping", Some("ctx"), 5, &s).await.unwrap();
        assert_eq!(out.final_output, "pong");
        assert_eq!(out.tools_used, vec!["echo"]);
        assert_eq!(out.turns, 2);

        let sent = model.last_messages();
        assert!(sent[0].content.contains("echo"));
        assert_eq!(sent[1], Message::system("ctx"));
        assert_eq!(sent.last().unwrap().content, "Observation: ping");
        assert_eq!(s.get_items(None).unwrap(), vec![Message::user("say ping"), Message::assistant("pong")]);
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_observation() {
        let s = session();
        let model = Arc::new(MockLlmClient::new("m").with_replies([r#"{"tool": "rm", "args": {}}"#, "ok"]));
        let a = agent(model.clone(), &s);
        let out = run_agent(&a, "x", None, 3, &s).await.unwrap();
        assert!(out.tools_used.is_empty());
        assert!(model.last_messages().last().unwrap().content.contains("Unknown tool: rm"));
    }

    #[tokio::test]
    async fn test_max_turns_exceeded() {
        let s = session();
        let model = Arc::new(MockLlmClient::new("m").with_replies(vec![r#"{"tool": "echo", "args": {}}"#; 3]));
        let a = agent(model, &s);
        let err = run_agent(&a, "loop", None, 2, &s).await.unwrap_err();
        assert!(matches!(err, RunError::MaxTurnsExceeded(2)));
        assert_eq!(s.item_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_session_history_is_replayed() {
        let s = session();
        s.add_items(&[Message::user("my name is Ada"), Message::assistant("hi Ada")]).unwrap();
        let model = Arc::new(MockLlmClient::new("m"));
        let a = agent(model.clone(), &s);
        run_agent(&a, "who am I", None, 1, &s).await.unwrap();
        let sent = model.last_messages();
        assert!(sent.iter().any(|m| m.content == "my name is Ada"));
    }
}
