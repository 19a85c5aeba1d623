//! 工具层：Tool trait、内置函数工具、agent-as-tool、MCP 连接池与工具解析

pub mod agent_tool;
pub mod echo;
pub mod filesystem;
pub mod mcp;
pub mod registry;
pub mod resolver;

pub use agent_tool::{normalize_input, AgentTool, InjectionPolicy};
pub use echo::EchoTool;
pub use filesystem::{FsError, ListDirectoryTool, ReadFileTool, SafeFs};
pub use mcp::{McpClient, McpConnector, McpError, McpPool, McpToolInfo};
pub use registry::{FunctionRegistry, Tool, ToolSet};
pub use resolver::{ToolResolver, MCP_UNAVAILABLE_KEY};
