//! 上下文存储：有界对话历史 + 执行历史 + metadata
//!
//! 所有读写都经过同一把 `parking_lot::Mutex`，并用 `try_lock_for` 限定等待时间：
//! - 写路径（add_message / clear_history / set_metadata / save）拿不到锁时返回 `ContextError::LockTimeout`
//! - add_execution 拿不到锁时丢弃记录并告警
//! - 读 / 统计路径拿不到锁时返回占位值
//!
//! 配置了快照路径时，每次变更后在持锁状态下写盘；写盘失败只记录日志。

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::core::ContextError;
use crate::memory::persistence::{ContextSnapshot, SnapshotFile};
use crate::memory::{ContextMessage, ExecutionRecord, History, Role};

/// 单条消息在转录文本中的最大字符数
pub const MESSAGE_CHAR_LIMIT: usize = 2000;

/// 读路径锁超时时返回的占位文本
pub const CONTEXT_UNAVAILABLE: &str = "[context temporarily unavailable: lock timeout]";

const CONTEXT_HEADER: &str = "Previous conversation context:";
const CONTEXT_FOOTER: &str = "Please take this context into account when answering.";

/// 每条消息的固定开销估算（字节）
const PER_MESSAGE_OVERHEAD: usize = 100;

/// 按字符截断，超出时追加 "..."
pub fn truncate_chars(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// 把一组消息渲染为带序号、带角色标签的转录文本；空列表返回空串
pub fn render_transcript<'a>(messages: impl IntoIterator<Item = &'a ContextMessage>) -> String {
    let lines: Vec<String> = messages
        .into_iter()
        .enumerate()
        .map(|(i, m)| {
            format!(
                "{}. {}: {}",
                i + 1,
                m.role.label(),
                truncate_chars(&m.content, MESSAGE_CHAR_LIMIT)
            )
        })
        .collect();
    if lines.is_empty() {
        return String::new();
    }
    format!("{}\n{}\n\n{}", CONTEXT_HEADER, lines.join("\n"), CONTEXT_FOOTER)
}

/// 统计信息；锁超时时 `available == false`，其余字段为零值
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContextStats {
    pub available: bool,
    pub message_count: usize,
    pub execution_count: usize,
    pub max_history: usize,
    pub memory_estimate_mb: f64,
    pub last_user_message: Option<String>,
    pub last_assistant_message: Option<String>,
}

/// 一次加锁取得的一致性副本，供策略引擎使用
#[derive(Clone, Debug, Default)]
pub struct ContextView {
    pub conversation: Vec<ContextMessage>,
    pub executions: Vec<ExecutionRecord>,
}

pub(crate) struct StoreState {
    conversation: History<ContextMessage>,
    executions: History<ExecutionRecord>,
    metadata: Map<String, Value>,
}

impl StoreState {
    fn new(max_history: usize) -> Self {
        Self {
            conversation: History::new(max_history),
            executions: History::new(max_history * 2),
            metadata: Map::new(),
        }
    }

    fn reset(&mut self) {
        self.conversation.clear();
        self.executions.clear();
        self.metadata.clear();
    }

    fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            conversation_history: self.conversation.to_vec(),
            execution_history: self.executions.to_vec(),
            metadata: self.metadata.clone(),
            saved_at: Utc::now(),
        }
    }
}

/// 上下文存储
pub struct ContextStore {
    state: Mutex<StoreState>,
    max_history: usize,
    lock_timeout: Duration,
    snapshot: Option<SnapshotFile>,
}

impl ContextStore {
    pub fn new(max_history: usize, lock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(StoreState::new(max_history)),
            max_history,
            lock_timeout,
            snapshot: None,
        }
    }

    /// 启用快照文件并立即尝试加载
    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot = Some(SnapshotFile::new(path.into()));
        self.load();
        self
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    pub fn snapshot_path(&self) -> Option<&std::path::Path> {
        self.snapshot.as_ref().map(|s| s.path())
    }

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, StoreState>, ContextError> {
        self.state
            .try_lock_for(self.lock_timeout)
            .ok_or(ContextError::LockTimeout {
                operation,
                waited: self.lock_timeout,
            })
    }

    fn persist(&self, state: &StoreState) {
        if let Some(file) = &self.snapshot {
            if let Err(e) = file.write(&state.snapshot()) {
                error!(path = %file.path().display(), error = %e, "Failed to persist context snapshot");
            }
        }
    }

    /// 追加一条对话；超过 max_history 时丢弃最旧的
    pub fn add_message(
        &self,
        role: Role,
        content: impl Into<String>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<(), ContextError> {
        let mut state = self.lock("add_message")?;
        state
            .conversation
            .push(ContextMessage::new(role, content, metadata));
        self.persist(&state);
        Ok(())
    }

    /// 记录工具调用（以 assistant 消息形式，metadata 标注工具名）
    pub fn add_tool_call_message(
        &self,
        tool_name: &str,
        content: impl Into<String>,
    ) -> Result<(), ContextError> {
        self.add_message(Role::Assistant, content, Some(tool_metadata(tool_name, "call")))
    }

    /// 把工具输出作为 assistant 消息写入；空输出不写
    pub fn add_tool_result_as_message(
        &self,
        tool_name: &str,
        output: &str,
    ) -> Result<(), ContextError> {
        if output.trim().is_empty() {
            return Ok(());
        }
        self.add_message(
            Role::Assistant,
            format!("[{}] {}", tool_name, output),
            Some(tool_metadata(tool_name, "result")),
        )
    }

    /// 追加执行记录；拿不到锁时丢弃记录而不让调用方失败
    pub fn add_execution(&self, record: ExecutionRecord) {
        match self.lock("add_execution") {
            Ok(mut state) => {
                state.executions.push(record);
                self.persist(&state);
            }
            Err(e) => {
                warn!(agent = %record.agent_key, error = %e, "Dropping execution record");
            }
        }
    }

    /// 转录最近 last_n 条对话（None 为全部）；锁超时返回占位文本
    pub fn get_conversation_context(&self, last_n: Option<usize>) -> String {
        let state = match self.lock("get_conversation_context") {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Conversation context unavailable");
                return CONTEXT_UNAVAILABLE.to_string();
            }
        };
        match last_n {
            Some(n) if n > 0 => render_transcript(state.conversation.last_n(n)),
            _ => render_transcript(state.conversation.iter()),
        }
    }

    /// 最近的执行记录，可按智能体过滤；锁超时返回空列表
    pub fn get_recent_executions(&self, agent_key: Option<&str>, limit: usize) -> Vec<ExecutionRecord> {
        let Ok(state) = self.lock("get_recent_executions") else {
            return Vec::new();
        };
        let mut recent: Vec<ExecutionRecord> = state
            .executions
            .iter()
            .rev()
            .filter(|r| agent_key.map_or(true, |k| r.agent_key == k))
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    /// 统计信息在同一次加锁内算完
    pub fn get_context_stats(&self) -> ContextStats {
        let state = match self.lock("get_context_stats") {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Context stats unavailable");
                return ContextStats::default();
            }
        };

        let mut chars = 0usize;
        for m in state.conversation.iter() {
            chars += m.content.chars().count();
        }
        for r in state.executions.iter() {
            chars += r.input_message.chars().count();
            chars += r.output.as_deref().map_or(0, |o| o.chars().count());
        }
        let bytes = chars * 2 + state.conversation.len() * PER_MESSAGE_OVERHEAD;

        let last_of = |role: Role| {
            state
                .conversation
                .iter()
                .rev()
                .find(|m| m.role == role)
                .map(|m| m.content.clone())
        };

        ContextStats {
            available: true,
            message_count: state.conversation.len(),
            execution_count: state.executions.len(),
            max_history: self.max_history,
            memory_estimate_mb: bytes as f64 / (1024.0 * 1024.0),
            last_user_message: last_of(Role::User),
            last_assistant_message: last_of(Role::Assistant),
        }
    }

    /// 一次加锁取得对话与执行历史的副本；锁超时返回 None
    pub fn view(&self) -> Option<ContextView> {
        let state = self.lock("view").ok()?;
        Some(ContextView {
            conversation: state.conversation.to_vec(),
            executions: state.executions.to_vec(),
        })
    }

    pub fn conversation_history(&self) -> Vec<ContextMessage> {
        self.lock("conversation_history")
            .map(|s| s.conversation.to_vec())
            .unwrap_or_default()
    }

    pub fn execution_history(&self) -> Vec<ExecutionRecord> {
        self.lock("execution_history")
            .map(|s| s.executions.to_vec())
            .unwrap_or_default()
    }

    pub fn is_conversation_empty(&self) -> bool {
        self.lock("is_conversation_empty")
            .map(|s| s.conversation.is_empty())
            .unwrap_or(false)
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) -> Result<(), ContextError> {
        let mut state = self.lock("set_metadata")?;
        state.metadata.insert(key.into(), value);
        self.persist(&state);
        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        self.lock("get_metadata").ok()?.metadata.get(key).cloned()
    }

    pub fn metadata(&self) -> Map<String, Value> {
        self.lock("metadata")
            .map(|s| s.metadata.clone())
            .unwrap_or_default()
    }

    /// 清空对话与执行历史并删除快照文件
    pub fn clear_history(&self) -> Result<(), ContextError> {
        let mut state = self.lock("clear_history")?;
        state.conversation.clear();
        state.executions.clear();
        if let Some(file) = &self.snapshot {
            if let Err(e) = file.remove() {
                error!(path = %file.path().display(), error = %e, "Failed to remove context snapshot");
            }
        }
        info!("Context history cleared");
        Ok(())
    }

    /// 手动写快照；未配置路径时什么也不做
    pub fn save(&self) -> Result<(), ContextError> {
        let state = self.lock("save")?;
        if let Some(file) = &self.snapshot {
            file.write(&state.snapshot())?;
            debug!(path = %file.path().display(), "Context snapshot saved");
        }
        Ok(())
    }

    /// 从快照恢复；文件缺失、损坏或锁超时都只记录日志，不向调用方传播
    pub fn load(&self) {
        let Some(file) = &self.snapshot else {
            return;
        };
        let mut state = match self.lock("load") {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Context snapshot not loaded");
                return;
            }
        };
        match file.read() {
            Ok(Some(snapshot)) => {
                state.conversation.replace(snapshot.conversation_history);
                state.executions.replace(snapshot.execution_history);
                state.metadata = snapshot.metadata;
                info!(
                    path = %file.path().display(),
                    messages = state.conversation.len(),
                    executions = state.executions.len(),
                    "Context snapshot loaded"
                );
            }
            Ok(None) => {
                state.reset();
            }
            Err(e) => {
                error!(path = %file.path().display(), error = %e, "Corrupt context snapshot, starting empty");
                state.reset();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn hold_lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock()
    }
}

fn tool_metadata(tool_name: &str, kind: &str) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert("tool".into(), Value::String(tool_name.to_string()));
    meta.insert("kind".into(), Value::String(kind.to_string()));
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store(max: usize) -> ContextStore {
        ContextStore::new(max, Duration::from_millis(50))
    }

    fn contents(store: &ContextStore) -> Vec<String> {
        store
            .conversation_history()
            .into_iter()
            .map(|m| m.content)
            .collect()
    }

    #[test]
    fn test_eviction_keeps_last_messages() {
        let s = store(3);
        s.add_message(Role::User, "a", None).unwrap();
        s.add_message(Role::Assistant, "b", None).unwrap();
        s.add_message(Role::User, "c", None).unwrap();
        s.add_message(Role::Assistant, "d", None).unwrap();
        assert_eq!(contents(&s), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_execution_history_capped_at_twice_max() {
        let s = store(2);
        for i in 0..10 {
            s.add_execution(ExecutionRecord::start("a", i.to_string()).fail("x"));
        }
        let history = s.execution_history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].input_message, "6");
    }

    #[test]
    fn test_transcript_truncates_long_messages() {
        let s = store(5);
        s.add_message(Role::User, "x".repeat(2500), None).unwrap();
        let ctx = s.get_conversation_context(None);
        assert!(ctx.contains(&format!("{}...", "x".repeat(2000))));
        assert!(!ctx.contains(&"x".repeat(2001)));
        assert!(ctx.contains("1. User:"));
    }

    #[test]
    fn test_transcript_last_n() {
        let s = store(5);
        for c in ["one", "two", "three"] {
            s.add_message(Role::User, c, None).unwrap();
        }
        let ctx = s.get_conversation_context(Some(1));
        assert!(ctx.contains("three"));
        assert!(!ctx.contains("two"));
        assert_eq!(store(5).get_conversation_context(None), "");
    }

    #[test]
    fn test_tool_result_empty_output_adds_nothing() {
        let s = store(5);
        s.add_tool_result_as_message("echo", "   ").unwrap();
        assert!(s.is_conversation_empty());
        s.add_tool_result_as_message("echo", "hi").unwrap();
        let history = s.conversation_history();
        assert_eq!(history[0].content, "[echo] hi");
        assert_eq!(history[0].metadata.as_ref().unwrap()["tool"], "echo");
    }

    #[test]
    fn test_stats_inside_single_lock() {
        let s = store(5);
        s.add_message(Role::User, "hello", None).unwrap();
        s.add_message(Role::Assistant, "world", None).unwrap();
        let stats = s.get_context_stats();
        assert!(stats.available);
        assert_eq!(stats.message_count, 2);
        assert_eq!(stats.last_user_message.as_deref(), Some("hello"));
        assert_eq!(stats.last_assistant_message.as_deref(), Some("world"));
        let expected = (10 * 2 + 2 * 100) as f64 / (1024.0 * 1024.0);
        assert!((stats.memory_estimate_mb - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn test_lock_timeout_policies() {
        let s = Arc::new(store(5));
        let guard = s.hold_lock();

        let s2 = Arc::clone(&s);
        let handle = std::thread::spawn(move || {
            let write = s2.add_message(Role::User, "x", None);
            s2.add_execution(ExecutionRecord::start("a", "x"));
            let ctx = s2.get_conversation_context(None);
            let stats = s2.get_context_stats();
            (write, ctx, stats)
        });
        let (write, ctx, stats) = handle.join().unwrap();
        drop(guard);

        assert!(matches!(write, Err(ContextError::LockTimeout { .. })));
        assert_eq!(ctx, CONTEXT_UNAVAILABLE);
        assert!(!stats.available);
        assert!(s.execution_history().is_empty());
        assert!(s.conversation_history().is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.json");

        let s = store(5).with_snapshot(&path);
        let mut meta = Map::new();
        meta.insert("k".into(), Value::from(1));
        s.add_message(Role::User, "hi", Some(meta)).unwrap();
        s.add_execution(ExecutionRecord::start("a", "hi").succeed("ok", vec!["echo".into()]));
        s.set_metadata("session", Value::from("x")).unwrap();
        s.save().unwrap();

        let restored = store(5).with_snapshot(&path);
        assert_eq!(restored.conversation_history(), s.conversation_history());
        assert_eq!(restored.execution_history(), s.execution_history());
        assert_eq!(restored.metadata(), s.metadata());
    }

    #[test]
    fn test_corrupt_snapshot_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.json");
        std::fs::write(&path, "garbage").unwrap();
        let s = store(5).with_snapshot(&path);
        assert!(s.conversation_history().is_empty());
        assert!(s.metadata().is_empty());
    }

    #[test]
    fn test_clear_history_removes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.json");
        let s = store(5).with_snapshot(&path);
        s.add_message(Role::User, "hi", None).unwrap();
        assert!(path.exists());
        s.clear_history().unwrap();
        assert!(!path.exists());
        assert!(s.conversation_history().is_empty());
    }

    #[test]
    fn test_recent_executions_filter() {
        let s = store(10);
        s.add_execution(ExecutionRecord::start("a", "1").fail("e"));
        s.add_execution(ExecutionRecord::start("b", "2").fail("e"));
        s.add_execution(ExecutionRecord::start("a", "3").fail("e"));
        let recent = s.get_recent_executions(Some("a"), 5);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].input_message, "3");
        assert_eq!(s.get_recent_executions(None, 1)[0].input_message, "3");
    }

    #[test]
    fn test_truncate_chars_is_char_safe() {
        assert_eq!(truncate_chars("你好世界", 2), "你好...");
        assert_eq!(truncate_chars("abc", 3), "abc");
    }
}
