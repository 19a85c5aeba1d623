//! Grid - 多智能体编排核心
//!
//! 模块划分：
//! - **agent**: 无头运行时，装配下列组件
//! - **config**: 配置加载（YAML / TOML + 环境变量）
//! - **core**: 错误、智能体注册表、执行协调器、清理
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 共享上下文存储、快照、上下文注入策略
//! - **observability**: 日志与执行 span
//! - **react**: Tool Call 解析与 ReAct 循环
//! - **session**: 按智能体划分的 SQLite 会话
//! - **tools**: 函数工具、agent-as-tool、MCP、工具解析

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod session;
pub mod tools;

pub use crate::agent::GridRuntime;
pub use crate::config::{load_config, GridConfig};
pub use crate::core::{AgentError, ExecutionOutcome};
