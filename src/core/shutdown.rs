//! 运行时清理
//!
//! 关闭时依次执行已注册的清理任务：断开 MCP 连接、清空会话、清空缓存。
//! 每个任务单独限时，一个任务失败或超时不影响后续任务。

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;

use crate::core::registry::AgentRegistry;
use crate::session::SessionManager;
use crate::tools::McpPool;

/// 清理任务
#[async_trait]
pub trait CleanupTask: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 一次清理的结果
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CleanupReport {
    pub completed: Vec<&'static str>,
    /// (任务名, 原因)
    pub failed: Vec<(&'static str, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct CleanupCoordinator {
    tasks: Vec<Arc<dyn CleanupTask>>,
    timeout: Duration,
}

impl CleanupCoordinator {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: CleanupTask + 'static>(&mut self, task: T) {
        self.tasks.push(Arc::new(task));
    }

    pub async fn run(&self) -> CleanupReport {
        tracing::info!("Running {} cleanup tasks...", self.tasks.len());
        let mut report = CleanupReport::default();

        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed", name);
                    report.completed.push(name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {:#}", name, e);
                    report.failed.push((name, format!("{:#}", e)));
                }
                Err(_) => {
                    tracing::warn!("Cleanup task '{}' timed out after {:?}", name, self.timeout);
                    report.failed.push((name, format!("timed out after {:?}", self.timeout)));
                }
            }
        }

        tracing::info!(failed = report.failed.len(), "All cleanup tasks finished");
        report
    }
}

impl Default for CleanupCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 断开全部 MCP 客户端
pub struct McpCleanup(pub Arc<McpPool>);

#[async_trait]
impl CleanupTask for McpCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let failures = self.0.disconnect_all().await;
        if failures.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = failures.into_iter().map(|(name, e)| format!("{name}: {e}")).collect();
        Err(anyhow!("MCP disconnect failed for {}", names.join("; ")))
    }

    fn name(&self) -> &'static str {
        "McpClients"
    }
}

/// 清空并释放全部会话
pub struct SessionCleanup(pub Arc<SessionManager>);

#[async_trait]
impl CleanupTask for SessionCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let report = self.0.teardown().await;
        if report.failed.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = report.failed.into_iter().map(|(key, e)| format!("{key}: {e}")).collect();
        Err(anyhow!("Session clear failed for {}", names.join("; ")))
    }

    fn name(&self) -> &'static str {
        "Sessions"
    }
}

/// 清空智能体与工具缓存
pub struct CacheCleanup(pub Arc<AgentRegistry>);

#[async_trait]
impl CleanupTask for CacheCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.0.clear_cache().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "AgentCache"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flag(Arc<AtomicBool>);

    #[async_trait]
    impl CleanupTask for Flag {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Flag"
        }
    }

    struct Broken;

    #[async_trait]
    impl CleanupTask for Broken {
        async fn cleanup(&self) -> anyhow::Result<()> {
            Err(anyhow!("boom"))
        }

        fn name(&self) -> &'static str {
            "Broken"
        }
    }

    struct Stuck;

    #[async_trait]
    impl CleanupTask for Stuck {
        async fn cleanup(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Stuck"
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_later_tasks() {
        let called = Arc::new(AtomicBool::new(false));
        let mut coordinator = CleanupCoordinator::new().with_timeout(Duration::from_millis(50));
        coordinator.register(Broken);
        coordinator.register(Stuck);
        coordinator.register(Flag(called.clone()));

        let report = coordinator.run().await;
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(report.completed, vec!["Flag"]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0], ("Broken", "boom".to_string()));
        assert!(report.failed[1].1.contains("timed out"));
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_mcp_cleanup_reports_disconnect_failures() {
        use crate::config::ToolConfig;
        use crate::tools::mcp::testing::FakeConnector;

        let connector = Arc::new(FakeConnector {
            failing: vec!["flaky".into()],
            ..Default::default()
        });
        let pool = Arc::new(McpPool::new(Some(connector)));
        let cfg: ToolConfig = serde_json::from_value(serde_json::json!({"type": "mcp"})).unwrap();
        for name in ["flaky", "steady"] {
            pool.get_or_connect(name, &cfg, std::path::Path::new(".")).await.unwrap();
        }

        let mut coordinator = CleanupCoordinator::new();
        coordinator.register(McpCleanup(Arc::clone(&pool)));
        let report = coordinator.run().await;
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("flaky"));
        assert!(pool.connected().await.is_empty());
    }
}
