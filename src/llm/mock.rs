//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预设回复；没有预设时回显最后一条 User 消息。可设置延迟（测试超时）与固定失败。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::llm::{ClientFactory, ClientSettings, LlmClient, LlmError};
use crate::memory::{Message, Role};

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    model: String,
    replies: Mutex<VecDeque<String>>,
    delay: Option<Duration>,
    failure: Option<String>,
    calls: AtomicUsize,
    last_messages: Mutex<Vec<Message>>,
}

impl MockLlmClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// 依次返回的回复
    pub fn with_replies<I, S>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.replies.lock() = replies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 最近一次 complete 收到的消息
    pub fn last_messages(&self) -> Vec<Message> {
        self.last_messages.lock().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock() = messages.to_vec();

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = &self.failure {
            return Err(LlmError::Request(failure.clone()));
        }
        if let Some(reply) = self.replies.lock().pop_front() {
            return Ok(reply);
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!("Echo from Mock: {}", last_user))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

type Builder = dyn Fn(&ClientSettings) -> MockLlmClient + Send + Sync;

/// Mock 工厂：统计构建次数，可按 model 名定制客户端
pub struct MockClientFactory {
    builds: AtomicUsize,
    builder: Box<Builder>,
    last_settings: Mutex<Option<ClientSettings>>,
}

impl Default for MockClientFactory {
    fn default() -> Self {
        Self::new(|s| MockLlmClient::new(s.model.clone()))
    }
}

impl MockClientFactory {
    pub fn new(builder: impl Fn(&ClientSettings) -> MockLlmClient + Send + Sync + 'static) -> Self {
        Self {
            builds: AtomicUsize::new(0),
            builder: Box::new(builder),
            last_settings: Mutex::new(None),
        }
    }

    /// 每次构建都返回固定延迟的客户端
    pub fn with_delay(delay: Duration) -> Self {
        Self::new(move |s| MockLlmClient::new(s.model.clone()).with_delay(delay))
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn last_settings(&self) -> Option<ClientSettings> {
        self.last_settings.lock().clone()
    }
}

impl ClientFactory for MockClientFactory {
    fn build(&self, settings: &ClientSettings) -> Result<Arc<dyn LlmClient>, LlmError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        *self.last_settings.lock() = Some(settings.clone());
        Ok(Arc::new((self.builder)(settings)))
    }
}
