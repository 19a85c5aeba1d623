//! 执行层：Tool Call 解析与单智能体 ReAct 循环

pub mod loop_;
pub mod planner;

pub use loop_::{run_agent, RunError, RunOutput, EMPTY_OUTPUT_FALLBACK};
pub use planner::{parse_llm_output, PlannerOutput, ToolCall};
