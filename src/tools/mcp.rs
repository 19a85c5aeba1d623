//! MCP 工具池
//!
//! MCP 协议本身由外部实现（`McpConnector` / `McpClient`）。池子按工具名懒连接，
//! 每个名字只连接一次并缓存复用；客户端公布的每个工具包装成 `Tool`。
//! `disconnect_all` 逐个断开，单个失败不影响其余客户端。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ToolConfig;
use crate::tools::Tool;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum McpError {
    #[error("No MCP connector configured")]
    NoConnector,

    #[error("MCP connect failed for '{tool}': {message}")]
    Connect { tool: String, message: String },

    #[error("MCP call failed: {0}")]
    Call(String),

    #[error("MCP disconnect failed: {0}")]
    Disconnect(String),
}

/// MCP 服务端公布的工具
#[derive(Debug, Clone, PartialEq)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// 已连接的 MCP 客户端
#[async_trait]
pub trait McpClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpError>;

    async fn call_tool(&self, name: &str, args: Value) -> Result<String, McpError>;

    async fn disconnect(&self) -> Result<(), McpError>;
}

/// 根据工具配置建立连接（server_command / env_vars / 工作目录）
#[async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(
        &self,
        tool_name: &str,
        config: &ToolConfig,
        cwd: &Path,
    ) -> Result<Arc<dyn McpClient>, McpError>;
}

/// 把 MCP 客户端公布的单个工具包装为 Tool
pub struct McpToolHandle {
    client: Arc<dyn McpClient>,
    info: McpToolInfo,
}

#[async_trait]
impl Tool for McpToolHandle {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn description(&self) -> &str {
        &self.info.description
    }

    fn parameters_schema(&self) -> Value {
        self.info.input_schema.clone()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        self.client
            .call_tool(&self.info.name, args)
            .await
            .map_err(|e| e.to_string())
    }
}

/// 按工具名缓存的 MCP 客户端池
pub struct McpPool {
    connector: Option<Arc<dyn McpConnector>>,
    clients: Mutex<HashMap<String, Arc<dyn McpClient>>>,
}

impl McpPool {
    pub fn new(connector: Option<Arc<dyn McpConnector>>) -> Self {
        Self {
            connector,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// 已连接时复用，否则连接一次并缓存；持锁连接保证同名只连一次
    pub async fn get_or_connect(
        &self,
        tool_name: &str,
        config: &ToolConfig,
        cwd: &Path,
    ) -> Result<Arc<dyn McpClient>, McpError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(tool_name) {
            return Ok(Arc::clone(client));
        }
        let connector = self.connector.as_ref().ok_or(McpError::NoConnector)?;
        let client = connector.connect(tool_name, config, cwd).await?;
        info!(tool = %tool_name, "MCP server connected");
        clients.insert(tool_name.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// 连接（或复用）后返回该服务端公布的全部工具
    pub async fn tools_for(
        &self,
        tool_name: &str,
        config: &ToolConfig,
        cwd: &Path,
    ) -> Result<Vec<Arc<dyn Tool>>, McpError> {
        let client = self.get_or_connect(tool_name, config, cwd).await?;
        let infos = client.list_tools().await?;
        Ok(infos
            .into_iter()
            .map(|info| {
                Arc::new(McpToolHandle {
                    client: Arc::clone(&client),
                    info,
                }) as Arc<dyn Tool>
            })
            .collect())
    }

    pub async fn connected(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// 断开全部客户端并清空缓存，返回失败列表
    pub async fn disconnect_all(&self) -> Vec<(String, McpError)> {
        let drained: Vec<(String, Arc<dyn McpClient>)> =
            self.clients.lock().await.drain().collect();
        let mut failures = Vec::new();
        for (name, client) in drained {
            match client.disconnect().await {
                Ok(()) => info!(tool = %name, "MCP server disconnected"),
                Err(e) => {
                    warn!(tool = %name, error = %e, "MCP disconnect failed");
                    failures.push((name, e));
                }
            }
        }
        failures
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 公布一个 `<server>_lookup` 工具的假客户端
    pub struct FakeMcpClient {
        pub server: String,
        pub fail_disconnect: bool,
        pub disconnected: AtomicUsize,
    }

    #[async_trait]
    impl McpClient for FakeMcpClient {
        async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
            Ok(vec![McpToolInfo {
                name: format!("{}_lookup", self.server),
                description: "Look something up".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }])
        }

        async fn call_tool(&self, name: &str, args: Value) -> Result<String, McpError> {
            Ok(format!("{} -> {}", name, args))
        }

        async fn disconnect(&self) -> Result<(), McpError> {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
            if self.fail_disconnect {
                Err(McpError::Disconnect(self.server.clone()))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    pub struct FakeConnector {
        pub connects: AtomicUsize,
        pub failing: Vec<String>,
    }

    #[async_trait]
    impl McpConnector for FakeConnector {
        async fn connect(
            &self,
            tool_name: &str,
            _config: &ToolConfig,
            _cwd: &Path,
        ) -> Result<Arc<dyn McpClient>, McpError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeMcpClient {
                server: tool_name.to_string(),
                fail_disconnect: self.failing.iter().any(|f| f == tool_name),
                disconnected: AtomicUsize::new(0),
            }))
        }
    }
}
