//! Grid 命令行
//!
//! 用法：`grid [--config <path>] [--agent <key>] <message...>`
//! 未指定 agent 时使用 settings.default_agent。

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use grid::{observability, GridRuntime};

/// 向一个智能体发送一条消息并打印回复
#[derive(Parser, Debug)]
#[command(name = "grid")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径，覆盖 config/grid.yaml 中的同名键
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 智能体键名
    #[arg(short, long)]
    agent: Option<String>,

    /// 消息内容，多个词以空格连接
    #[arg(required = true, num_args = 1..)]
    message: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let args = Args::parse();
    let message = args.message.join(" ");

    let runtime = GridRuntime::from_config_path(args.config)?;
    let agent = args
        .agent
        .unwrap_or_else(|| runtime.config().settings.default_agent.clone());

    let result = runtime.execute(&agent, &message, None).await;
    let report = runtime.cleanup().await;
    if !report.is_clean() {
        tracing::warn!(failed = ?report.failed, "Cleanup incomplete");
    }

    let outcome = result.with_context(|| format!("Agent '{}' failed", agent))?;
    println!("{}", outcome.output);
    Ok(())
}
