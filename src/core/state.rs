//! 单次执行的阶段与轨迹
//!
//! 协调器为每次 execute 维护一个 `ExecutionTrace`，阶段只能按
//! Created -> Running -> {Succeeded | Failed | TimedOut} 推进，
//! 构建失败时可从 Created 直接进入 Failed。

use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Created,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl ExecutionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    fn can_move_to(self, next: ExecutionPhase) -> bool {
        use ExecutionPhase::*;
        matches!(
            (self, next),
            (Created, Running) | (Created, Failed) | (Running, Succeeded) | (Running, Failed) | (Running, TimedOut)
        )
    }
}

#[derive(Debug)]
pub struct ExecutionTrace {
    pub correlation_id: String,
    pub agent_key: String,
    phase: ExecutionPhase,
    started: Instant,
    finished: Option<Duration>,
}

impl ExecutionTrace {
    pub fn new(correlation_id: impl Into<String>, agent_key: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            agent_key: agent_key.into(),
            phase: ExecutionPhase::Created,
            started: Instant::now(),
            finished: None,
        }
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.phase
    }

    /// 非法迁移被忽略并返回 false
    pub fn advance(&mut self, next: ExecutionPhase) -> bool {
        if !self.phase.can_move_to(next) {
            tracing::warn!(
                correlation_id = %self.correlation_id,
                from = ?self.phase,
                to = ?next,
                "Ignoring invalid execution phase transition"
            );
            return false;
        }
        self.phase = next;
        if next.is_terminal() {
            self.finished = Some(self.started.elapsed());
        }
        true
    }

    /// 终态时为总耗时，否则为已用时间
    pub fn elapsed(&self) -> Duration {
        self.finished.unwrap_or_else(|| self.started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut trace = ExecutionTrace::new("c1", "writer");
        assert!(trace.advance(ExecutionPhase::Running));
        assert!(trace.advance(ExecutionPhase::Succeeded));
        assert!(trace.phase().is_terminal());
        let first = trace.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(trace.elapsed(), first);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut trace = ExecutionTrace::new("c2", "writer");
        assert!(!trace.advance(ExecutionPhase::TimedOut));
        assert!(trace.advance(ExecutionPhase::Failed));
        assert!(!trace.advance(ExecutionPhase::Running));
        assert_eq!(trace.phase(), ExecutionPhase::Failed);
    }
}
