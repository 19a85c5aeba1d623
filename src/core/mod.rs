//! 核心编排层：错误分类、智能体句柄与注册表、执行协调、执行阶段、清理

pub mod coordinator;
pub mod error;
pub mod handle;
pub mod registry;
pub mod shutdown;
pub mod state;

pub use coordinator::{ExecutionCoordinator, ExecutionOutcome, AGENT_INSTRUCTIONS_KEY};
pub use error::{AgentError, BuildError, ConfigError, ContextError};
pub use handle::AgentHandle;
pub use registry::{find_cycle, AgentRegistry};
pub use shutdown::{
    CacheCleanup, CleanupCoordinator, CleanupReport, CleanupTask, McpCleanup, SessionCleanup,
};
pub use state::{ExecutionPhase, ExecutionTrace};
