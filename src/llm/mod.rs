//! LLM 层：客户端抽象、客户端工厂与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{MockClientFactory, MockLlmClient};
pub use openai::{OpenAiClient, OpenAiClientFactory, TokenUsage};
pub use traits::{ClientFactory, ClientSettings, LlmClient, LlmError};
