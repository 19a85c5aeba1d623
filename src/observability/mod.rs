//! 可观测性：日志初始化与执行级 span

use tracing::{info_span, Span};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化全局日志；RUST_LOG 未设置时默认 info。重复调用无副作用
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

/// 一次 execute 的根 span，其下所有日志都带 correlation_id
pub fn execution_span(correlation_id: &str, agent_key: &str) -> Span {
    info_span!("execution", correlation_id = %correlation_id, agent = %agent_key)
}

/// 新的 correlation id（UUID v4）
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
