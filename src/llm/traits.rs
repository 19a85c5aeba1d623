//! LLM 客户端抽象
//!
//! - `LlmClient`：非流式完成，所有后端（OpenAI 兼容 / Mock）实现
//! - `ClientFactory`：根据 provider + model 配置构建客户端，注册表只依赖此 trait

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

/// LLM 调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Invalid client settings: {0}")]
    InvalidSettings(String),

    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM request failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成，返回首条回复文本
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    fn model_name(&self) -> &str;
}

/// 构建客户端所需的全部参数（来自 provider 与 model 配置）
#[derive(Clone, Debug, PartialEq)]
pub struct ClientSettings {
    pub api_key: String,
    pub base_url: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// 客户端工厂
pub trait ClientFactory: Send + Sync {
    fn build(&self, settings: &ClientSettings) -> Result<Arc<dyn LlmClient>, LlmError>;
}
