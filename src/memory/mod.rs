//! 记忆层：对话 / 执行记录模型、上下文存储、快照持久化、上下文注入策略

pub mod conversation;
pub mod persistence;
pub mod store;
pub mod strategy;

pub use conversation::{ContextMessage, ExecutionRecord, History, Message, Role};
pub use persistence::{ContextSnapshot, SnapshotFile};
pub use store::{ContextStats, ContextStore, ContextView, CONTEXT_UNAVAILABLE};
pub use strategy::{ContextStrategy, ContextStrategyEngine, SmartChoice};
