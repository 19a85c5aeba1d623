//! 执行协调器
//!
//! 一次 execute：
//! 1. 分配 correlation id，后续日志都在 execution span 下
//! 2. 从注册表获取（或构建）智能体
//! 3. 取当前对话上下文，再把用户消息写入上下文存储
//! 4. 在超时内运行 ReAct 循环
//! 5. 成功时写入 assistant 消息；无论结果如何都追加一条执行记录

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, warn, Instrument};

use crate::config::GridConfig;
use crate::core::error::{AgentError, ContextError};
use crate::core::handle::AgentHandle;
use crate::core::registry::AgentRegistry;
use crate::core::state::{ExecutionPhase, ExecutionTrace};
use crate::memory::{ContextStore, ExecutionRecord, Role};
use crate::observability::{execution_span, new_correlation_id};
use crate::react::{run_agent, RunOutput, EMPTY_OUTPUT_FALLBACK};
use crate::session::SessionManager;

/// 首次执行时记录智能体指令的 metadata 键
pub const AGENT_INSTRUCTIONS_KEY: &str = "agent_instructions";

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub output: String,
    pub correlation_id: String,
    pub tools_used: Vec<String>,
    pub duration: Duration,
}

pub struct ExecutionCoordinator {
    config: Arc<GridConfig>,
    registry: Arc<AgentRegistry>,
    store: Arc<ContextStore>,
    sessions: Arc<SessionManager>,
}

impl ExecutionCoordinator {
    pub fn new(
        config: Arc<GridConfig>,
        registry: Arc<AgentRegistry>,
        store: Arc<ContextStore>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            sessions,
        }
    }

    pub async fn execute(
        &self,
        agent_key: &str,
        message: &str,
        context_path: Option<&Path>,
    ) -> Result<ExecutionOutcome, AgentError> {
        let correlation_id = new_correlation_id();
        let span = execution_span(&correlation_id, agent_key);
        self.execute_traced(ExecutionTrace::new(correlation_id, agent_key), message, context_path)
            .instrument(span)
            .await
    }

    async fn execute_traced(
        &self,
        mut trace: ExecutionTrace,
        message: &str,
        context_path: Option<&Path>,
    ) -> Result<ExecutionOutcome, AgentError> {
        let agent_key = trace.agent_key.clone();
        info!(input_chars = message.chars().count(), "Execution started");
        let record = ExecutionRecord::start(&agent_key, message);

        let handle = match self.registry.create(&agent_key, context_path, false).await {
            Ok(handle) => handle,
            Err(e) => {
                trace.advance(ExecutionPhase::Failed);
                error!(error = %e, "Agent construction failed");
                self.store.add_execution(record.fail(e.to_string()));
                return Err(e);
            }
        };

        let context = self.store.get_conversation_context(None);
        let was_empty = self.store.is_conversation_empty();
        if let Err(e) = self.store.add_message(Role::User, message, None) {
            return Err(self.store_failure(&mut trace, record, e));
        }
        if was_empty {
            if let Err(e) = self
                .store
                .set_metadata(AGENT_INSTRUCTIONS_KEY, Value::String(handle.instructions.clone()))
            {
                warn!(error = %e, "Failed to record agent instructions");
            }
        }

        trace.advance(ExecutionPhase::Running);
        let limit = self.config.get_agent_timeout();
        match tokio::time::timeout(limit, self.run(&handle, message, &context)).await {
            Err(_) => {
                trace.advance(ExecutionPhase::TimedOut);
                let err = AgentError::Timeout {
                    agent_key: agent_key.clone(),
                    timeout: limit,
                };
                warn!(timeout_secs = limit.as_secs_f64(), "Execution timed out");
                self.store.add_execution(record.fail(err.to_string()));
                Err(err)
            }
            Ok(Err(e)) => {
                trace.advance(ExecutionPhase::Failed);
                error!(error = %e, "Execution failed");
                self.store.add_execution(record.fail(e.to_string()));
                Err(e)
            }
            Ok(Ok(mut out)) => {
                if out.final_output.trim().is_empty() {
                    out.final_output = EMPTY_OUTPUT_FALLBACK.to_string();
                }
                if let Err(e) = self.store.add_message(Role::Assistant, &out.final_output, None) {
                    return Err(self.store_failure(&mut trace, record, e));
                }
                trace.advance(ExecutionPhase::Succeeded);
                info!(
                    turns = out.turns,
                    tools = ?out.tools_used,
                    elapsed_ms = trace.elapsed().as_millis() as u64,
                    "Execution finished"
                );
                self.store
                    .add_execution(record.succeed(out.final_output.clone(), out.tools_used.clone()));
                Ok(ExecutionOutcome {
                    output: out.final_output,
                    correlation_id: trace.correlation_id.clone(),
                    tools_used: out.tools_used,
                    duration: trace.elapsed(),
                })
            }
        }
    }

    /// 上下文写入失败也是终态：追加失败记录后返回
    fn store_failure(
        &self,
        trace: &mut ExecutionTrace,
        record: ExecutionRecord,
        e: ContextError,
    ) -> AgentError {
        trace.advance(ExecutionPhase::Failed);
        error!(error = %e, "Context store write failed");
        self.store.add_execution(record.fail(e.to_string()));
        AgentError::Context(e)
    }

    async fn run(
        &self,
        handle: &AgentHandle,
        message: &str,
        context: &str,
    ) -> Result<RunOutput, AgentError> {
        let session = match handle.session() {
            Some(session) => session,
            None => self
                .sessions
                .get_or_create(&handle.key)
                .await
                .map_err(|e| AgentError::construction(&handle.key, e))?,
        };
        run_agent(
            handle,
            message,
            Some(context).filter(|c| !c.is_empty()),
            self.config.get_max_turns(),
            &session,
        )
        .await
        .map_err(|source| AgentError::Execution {
            agent_key: handle.key.clone(),
            source,
        })
    }
}
