//! 对话与执行记录的数据模型
//!
//! - `Message`：发给 LLM 的消息（role + content）
//! - `ContextMessage`：上下文存储中的一条对话，附时间戳与可选 metadata，追加后不再修改
//! - `ExecutionRecord`：一次智能体调用的审计记录
//! - `History<T>`：定长 FIFO，超出上限时丢弃最旧的元素

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// 解析 "user"/"assistant"/"system"，其余返回 None
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }

    /// 转录文本中的标签
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        }
    }
}

/// 单条 LLM 消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 上下文存储中的对话消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl ContextMessage {
    pub fn new(role: Role, content: impl Into<String>, metadata: Option<Map<String, Value>>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata,
        }
    }
}

/// 一次执行的审计记录；快照中字段名为 agent_name
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    #[serde(rename = "agent_name")]
    pub agent_key: String,
    pub input_message: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tools_used: Vec<String>,
}

impl ExecutionRecord {
    /// 以当前时间作为 start_time 开始一条记录
    pub fn start(agent_key: impl Into<String>, input_message: impl Into<String>) -> Self {
        Self {
            agent_key: agent_key.into(),
            input_message: input_message.into(),
            output: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            tools_used: Vec::new(),
        }
    }

    pub fn succeed(mut self, output: impl Into<String>, tools_used: Vec<String>) -> Self {
        self.output = Some(output.into());
        self.tools_used = tools_used;
        self.end_time = Some(Utc::now());
        self
    }

    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.end_time = Some(Utc::now());
        self
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.output.is_some()
    }
}

/// 定长 FIFO：push 后长度不超过 cap，保留的是最近 cap 个元素
#[derive(Clone, Debug, PartialEq)]
pub struct History<T> {
    items: VecDeque<T>,
    cap: usize,
}

impl<T> History<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(cap.min(64)),
            cap,
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
        while self.items.len() > self.cap {
            self.items.pop_front();
        }
    }

    /// 用已有序列替换内容（加载快照时使用），超出部分从头部裁掉
    pub fn replace(&mut self, items: Vec<T>) {
        self.items = items.into();
        while self.items.len() > self.cap {
            self.items.pop_front();
        }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// 最近 n 个元素（按时间顺序）
    pub fn last_n(&self, n: usize) -> impl Iterator<Item = &T> {
        self.items.iter().skip(self.items.len().saturating_sub(n))
    }

    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}

impl<T: Clone> History<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_keeps_most_recent_suffix() {
        let mut h = History::new(3);
        for i in 0..10 {
            h.push(i);
            assert!(h.len() <= 3);
        }
        assert_eq!(h.to_vec(), vec![7, 8, 9]);
        assert_eq!(h.last_n(2).copied().collect::<Vec<_>>(), vec![8, 9]);
        assert_eq!(h.last_n(50).count(), 3);
    }

    #[test]
    fn test_history_replace_trims_front() {
        let mut h = History::new(2);
        h.replace(vec!["a", "b", "c"]);
        assert_eq!(h.to_vec(), vec!["b", "c"]);
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
        assert_eq!(Role::parse("system"), Some(Role::System));
        assert_eq!(Role::parse("tool"), None);
    }

    #[test]
    fn test_execution_record_uses_agent_name_field() {
        let record = ExecutionRecord::start("coder", "hi").succeed("done", vec!["echo".into()]);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["agent_name"], "coder");
        assert!(record.is_success());
        assert!(record.duration().is_some());
    }
}
