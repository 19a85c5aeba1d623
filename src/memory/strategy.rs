//! 上下文注入策略
//!
//! 根据策略名从上下文存储的副本中挑选要注入给子智能体的内容：
//! - minimal：原样返回任务文本
//! - conversation：最近 depth 条对话（depth <= 0 为全部）+ 任务
//! - full：全部对话 + 最近 10 条执行记录 + 任务
//! - smart：按关键词查表决定落到上面哪一种（或仅工具摘要）
//!
//! smart 的关键词只覆盖英文与俄文，其他语言的任务文本会落到 minimal。

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::memory::store::{render_transcript, truncate_chars, ContextView, MESSAGE_CHAR_LIMIT};

/// full 策略带上的执行记录条数
const FULL_EXECUTION_COUNT: usize = 10;
/// 工具摘要带上的执行输出条数
const TOOL_SUMMARY_COUNT: usize = 5;
const TOOL_SUMMARY_CHAR_LIMIT: usize = 1200;

/// 上下文策略
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStrategy {
    Minimal,
    #[default]
    Conversation,
    Smart,
    Full,
}

impl fmt::Display for ContextStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Minimal => "minimal",
            Self::Conversation => "conversation",
            Self::Smart => "smart",
            Self::Full => "full",
        };
        f.write_str(s)
    }
}

impl FromStr for ContextStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "minimal" => Ok(Self::Minimal),
            "conversation" => Ok(Self::Conversation),
            "smart" => Ok(Self::Smart),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown context strategy: {}", other)),
        }
    }
}

/// 一组英俄关键词：英文按词边界匹配（忽略大小写），俄文按小写词干子串匹配以覆盖词形变化
struct KeywordSet {
    english: &'static [&'static str],
    russian: &'static [&'static str],
    re: OnceLock<Regex>,
}

impl KeywordSet {
    const fn new(english: &'static [&'static str], russian: &'static [&'static str]) -> Self {
        Self {
            english,
            russian,
            re: OnceLock::new(),
        }
    }

    fn matches(&self, text: &str) -> bool {
        let re = self.re.get_or_init(|| {
            let alternatives: Vec<String> = self.english.iter().map(|w| regex::escape(w)).collect();
            Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))
                .expect("keyword regex is built from escaped literals")
        });
        if re.is_match(text) {
            return true;
        }
        let lower = text.to_lowercase();
        self.russian.iter().any(|stem| lower.contains(stem))
    }
}

static CONVERSATION_WORDS: KeywordSet = KeywordSet::new(
    &[
        "earlier",
        "before",
        "previous",
        "previously",
        "continue",
        "we discussed",
        "you said",
        "you mentioned",
        "conversation",
        "remember",
        "last time",
    ],
    &[
        "ранее",
        "раньше",
        "предыдущ",
        "продолж",
        "обсуждали",
        "говорили",
        "ты сказал",
        "упоминал",
        "диалог",
        "разговор",
        "помнишь",
        "в прошлый раз",
    ],
);

static TOOL_WORDS: KeywordSet = KeywordSet::new(
    &[
        "file",
        "files",
        "tool",
        "command",
        "run",
        "output",
        "result",
        "results",
        "directory",
        "search",
    ],
    &[
        "файл",
        "инструмент",
        "команд",
        "запуст",
        "вывод",
        "результат",
        "директори",
        "папк",
        "поиск",
        "найди",
    ],
);

static BACK_REFERENCE_WORDS: KeywordSet = KeywordSet::new(
    &[
        "that file",
        "this file",
        "the same one",
        "the same",
        "that one",
        "this one",
        "it again",
        "the above",
    ],
    &[
        "тот файл",
        "того файла",
        "этот файл",
        "этого файла",
        "тот же",
        "то же самое",
        "выше",
        "его снова",
    ],
);

/// smart 策略在给定任务文本上的判定结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmartChoice {
    Full,
    Conversation,
    ToolSummary,
    Minimal,
}

/// 策略引擎：只读上下文副本，不修改存储
pub struct ContextStrategyEngine;

impl ContextStrategyEngine {
    pub fn build(
        view: &ContextView,
        strategy: ContextStrategy,
        depth: i64,
        include_tools: bool,
        task: &str,
    ) -> String {
        match strategy {
            ContextStrategy::Minimal => task.to_string(),
            ContextStrategy::Conversation => Self::conversation(view, depth, task),
            ContextStrategy::Full => Self::full(view, task),
            ContextStrategy::Smart => match Self::smart_choice(task, include_tools) {
                SmartChoice::Full => Self::full(view, task),
                SmartChoice::Conversation => Self::conversation(view, depth, task),
                SmartChoice::ToolSummary => Self::tool_summary(view, task),
                SmartChoice::Minimal => task.to_string(),
            },
        }
    }

    /// 查表：回指 → full；对话词且工具词 → full；仅对话词 → conversation；
    /// 仅工具词且允许工具历史 → 工具摘要；否则 minimal
    pub fn smart_choice(task: &str, include_tools: bool) -> SmartChoice {
        if BACK_REFERENCE_WORDS.matches(task) {
            return SmartChoice::Full;
        }
        let conversation = CONVERSATION_WORDS.matches(task);
        let tools = TOOL_WORDS.matches(task);
        match (conversation, tools) {
            (true, true) => SmartChoice::Full,
            (true, false) => SmartChoice::Conversation,
            (false, true) if include_tools => SmartChoice::ToolSummary,
            _ => SmartChoice::Minimal,
        }
    }

    fn conversation(view: &ContextView, depth: i64, task: &str) -> String {
        let transcript = if depth <= 0 {
            render_transcript(view.conversation.iter())
        } else {
            let n = depth as usize;
            let skip = view.conversation.len().saturating_sub(n);
            render_transcript(view.conversation.iter().skip(skip))
        };
        with_task(&[transcript], task)
    }

    fn full(view: &ContextView, task: &str) -> String {
        let transcript = render_transcript(view.conversation.iter());
        let skip = view.executions.len().saturating_sub(FULL_EXECUTION_COUNT);
        let lines: Vec<String> = view
            .executions
            .iter()
            .skip(skip)
            .map(|r| {
                let outcome = match (&r.output, &r.error) {
                    (_, Some(err)) => format!("error: {}", truncate_chars(err, MESSAGE_CHAR_LIMIT)),
                    (Some(out), None) => format!("output: {}", truncate_chars(out, MESSAGE_CHAR_LIMIT)),
                    (None, None) => "output: <none>".to_string(),
                };
                format!(
                    "- [{}] input: {} | {}",
                    r.agent_key,
                    truncate_chars(&r.input_message, MESSAGE_CHAR_LIMIT),
                    outcome
                )
            })
            .collect();
        let executions = if lines.is_empty() {
            String::new()
        } else {
            format!("Recent agent executions:\n{}", lines.join("\n"))
        };
        with_task(&[transcript, executions], task)
    }

    fn tool_summary(view: &ContextView, task: &str) -> String {
        let outputs: Vec<String> = view
            .executions
            .iter()
            .filter_map(|r| r.output.as_deref().map(|o| (r.agent_key.as_str(), o)))
            .rev()
            .take(TOOL_SUMMARY_COUNT)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|(agent, out)| format!("- [{}] {}", agent, truncate_chars(out, TOOL_SUMMARY_CHAR_LIMIT)))
            .collect();
        let summary = if outputs.is_empty() {
            String::new()
        } else {
            format!("Recent tool results:\n{}", outputs.join("\n"))
        };
        with_task(&[summary], task)
    }
}

/// 非空段落 + 任务，用空行连接；没有任何段落时原样返回任务
fn with_task(sections: &[String], task: &str) -> String {
    let parts: Vec<&str> = sections
        .iter()
        .map(String::as_str)
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        return task.to_string();
    }
    format!("{}\n\nCurrent task: {}", parts.join("\n\n"), task)
}
