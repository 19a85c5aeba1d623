//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；HTTP 超时取 provider 配置，
//! 失败时最多重试 max_retries 次。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use tracing::warn;

use crate::llm::{ClientFactory, ClientSettings, LlmClient, LlmError};
use crate::memory::{Message, Role};

/// 重试之间的基础等待时间，按尝试次数线性增加
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn get(&self) -> (u64, u64, u64) {
        let p = self.prompt_tokens.load(Ordering::Relaxed);
        let c = self.completion_tokens.load(Ordering::Relaxed);
        (p, c, p + c)
    }
}

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(settings: &ClientSettings) -> Result<Self, LlmError> {
        if settings.api_key.trim().is_empty() {
            return Err(LlmError::InvalidSettings("empty api key".into()));
        }
        let mut config = OpenAIConfig::new().with_api_key(settings.api_key.clone());
        if let Some(url) = &settings.base_url {
            config = config.with_api_base(url.clone());
        }
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| LlmError::InvalidSettings(e.to_string()))?;

        Ok(Self {
            client: Client::with_config(config).with_http_client(http),
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            max_retries: settings.max_retries,
            usage: TokenUsage::default(),
        })
    }

    fn to_openai_messages(
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let invalid = |e: async_openai::error::OpenAIError| LlmError::InvalidSettings(e.to_string());
        messages
            .iter()
            .map(|m| {
                Ok(match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                })
            })
            .collect()
    }

    async fn complete_once(&self, messages: &[Message]) -> Result<String, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(self.temperature)
            .max_completion_tokens(self.max_tokens)
            .messages(Self::to_openai_messages(messages)?)
            .build()
            .map_err(|e| LlmError::InvalidSettings(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        Ok(response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let attempts = self.max_retries + 1;
        let mut last = String::new();
        for attempt in 1..=attempts {
            match self.complete_once(messages).await {
                Ok(content) => return Ok(content),
                Err(LlmError::Request(e)) => {
                    warn!(model = %self.model, attempt, error = %e, "LLM request failed");
                    last = e;
                    if attempt < attempts {
                        tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(LlmError::RetriesExhausted { attempts, last })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// 生产环境使用的工厂
#[derive(Debug, Default, Clone)]
pub struct OpenAiClientFactory;

impl ClientFactory for OpenAiClientFactory {
    fn build(&self, settings: &ClientSettings) -> Result<Arc<dyn LlmClient>, LlmError> {
        Ok(Arc::new(OpenAiClient::new(settings)?))
    }
}
