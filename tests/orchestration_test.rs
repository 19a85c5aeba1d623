//! 运行时集成测试：注册表缓存、超时、上下文共享、agent-as-tool、MCP、清理

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use grid::config::{GridConfig, ToolConfig};
use grid::core::AgentError;
use grid::llm::{MockClientFactory, MockLlmClient};
use grid::memory::Role;
use grid::tools::{McpClient, McpConnector, McpError, McpToolInfo, MCP_UNAVAILABLE_KEY};
use grid::GridRuntime;
use serde_json::{json, Value};

const BASE: &str = r#"
providers:
  mock:
    api_key: test-key
models:
  small:
    name: mock-small
    provider: mock
  lead:
    name: lead-model
    provider: mock
  helper:
    name: helper-model
    provider: mock
prompt_templates:
  base: "You are part of a team."
"#;

fn config(extra: &str) -> GridConfig {
    GridConfig::from_yaml_str(&format!("{}{}", BASE, extra)).unwrap()
}

fn runtime(extra: &str) -> (GridRuntime, Arc<MockClientFactory>) {
    let factory = Arc::new(MockClientFactory::default());
    let rt = GridRuntime::new(config(extra), factory.clone(), None).unwrap();
    (rt, factory)
}

const WRITER: &str = r#"
agents:
  writer:
    model: small
"#;

#[tokio::test]
async fn test_execute_records_conversation_and_execution() {
    let (rt, factory) = runtime(WRITER);
    let outcome = rt.execute("writer", "hello", None).await.unwrap();
    assert_eq!(outcome.output, "Echo from Mock: hello");
    assert!(!outcome.correlation_id.is_empty());

    rt.execute("writer", "again", None).await.unwrap();
    assert_eq!(factory.builds(), 1);
    assert_eq!(rt.registry().construction_count(), 1);

    let history = rt.store().conversation_history();
    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);

    let executions = rt.recent_executions(Some("writer"), 10);
    assert_eq!(executions.len(), 2);
    assert!(executions.iter().all(|r| r.is_success()));
    assert!(rt.store().get_metadata("agent_instructions").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_create_builds_once() {
    // 构建阻塞一段时间，让其余调用在构建进行中到达
    let factory = Arc::new(MockClientFactory::new(|s| {
        std::thread::sleep(Duration::from_millis(50));
        MockLlmClient::new(s.model.clone())
    }));
    let rt = GridRuntime::new(config(WRITER), factory.clone(), None).unwrap();
    let registry = Arc::clone(rt.registry());

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.create("writer", None, false).await })
        })
        .collect();
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }

    assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    assert_eq!(registry.construction_count(), 1);
    assert_eq!(factory.builds(), 1);
}

#[tokio::test]
async fn test_force_reload_keeps_session() {
    let (rt, _) = runtime(WRITER);
    rt.execute("writer", "remember me", None).await.unwrap();
    let old = rt.registry().create("writer", None, false).await.unwrap();
    let new = rt.registry().create("writer", None, true).await.unwrap();
    assert!(!Arc::ptr_eq(&old, &new));
    let session = new.session().unwrap();
    assert_eq!(session.item_count().unwrap(), 2);
}

#[tokio::test]
async fn test_timeout_records_failure_without_output() {
    let factory = Arc::new(MockClientFactory::with_delay(Duration::from_secs(5)));
    let cfg = config(&format!("{}\nsettings:\n  agent_timeout: 1\n", WRITER));
    let rt = GridRuntime::new(cfg, factory, None).unwrap();

    let err = rt.execute("writer", "slow task", None).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(err.to_string().contains("1 seconds"));

    let executions = rt.recent_executions(None, 10);
    assert_eq!(executions.len(), 1);
    assert!(executions[0].error.is_some());
    assert!(executions[0].output.is_none());

    let history = rt.store().conversation_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, Role::User);
}

#[tokio::test]
async fn test_missing_api_key_is_construction_error() {
    let cfg = r#"
providers:
  nokey:
    api_key_env: GRID_TEST_KEY_THAT_IS_NEVER_SET
models:
  m:
    name: x
    provider: nokey
agents:
  orphan:
    model: m
"#;
    let rt = GridRuntime::new(
        GridConfig::from_yaml_str(cfg).unwrap(),
        Arc::new(MockClientFactory::default()),
        None,
    )
    .unwrap();
    let err = rt.execute("orphan", "hi", None).await.unwrap_err();
    assert!(matches!(err, AgentError::Construction { .. }));
    assert!(err.to_string().contains("nokey"));
    let executions = rt.recent_executions(Some("orphan"), 5);
    assert_eq!(executions.len(), 1);
    assert!(!executions[0].is_success());
}

#[tokio::test]
async fn test_cycle_is_reported() {
    let (rt, _) = runtime(
        r#"
agents:
  ping:
    model: small
    tools: [to_pong]
  pong:
    model: small
    tools: [to_ping]
tools:
  to_ping:
    type: agent
    target_agent: ping
  to_pong:
    type: agent
    target_agent: pong
"#,
    );
    let err = rt.execute("ping", "go", None).await.unwrap_err();
    let chain = err.cycle_chain().unwrap();
    assert_eq!(chain.first(), chain.last());
    assert!(err.to_string().contains("ping -> pong -> ping"));
}

#[tokio::test]
async fn test_agent_tool_shares_context() {
    let factory = Arc::new(MockClientFactory::new(|s| match s.model.as_str() {
        "lead-model" => MockLlmClient::new("lead-model").with_replies([
            r#"{"tool": "call_helper", "args": {"task": "find the report"}}"#,
            "The report is ready.",
        ]),
        _ => MockLlmClient::new(s.model.clone()).with_replies(["report.pdf found"]),
    }));
    let cfg = config(
        r#"
agents:
  lead:
    model: lead
    tools: [delegate]
  helper:
    model: helper
tools:
  delegate:
    type: agent
    target_agent: helper
    context_strategy: full
"#,
    );
    let rt = GridRuntime::new(cfg, factory, None).unwrap();

    let outcome = rt.execute("lead", "prepare the report", None).await.unwrap();
    assert_eq!(outcome.output, "The report is ready.");
    assert_eq!(outcome.tools_used, vec!["call_helper"]);

    let contents: Vec<String> = rt
        .store()
        .conversation_history()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(
        contents,
        vec![
            "prepare the report",
            "[call_helper] find the report",
            "[call_helper] report.pdf found",
            "The report is ready.",
        ]
    );

    let executions = rt.recent_executions(None, 10);
    let agents: Vec<&str> = executions.iter().map(|r| r.agent_key.as_str()).collect();
    assert_eq!(agents, vec!["helper", "lead"]);
}

#[tokio::test]
async fn test_agent_tool_follows_reloaded_target() {
    let helper_builds = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&helper_builds);
    let factory = Arc::new(MockClientFactory::new(move |s| match s.model.as_str() {
        "lead-model" => MockLlmClient::new("lead-model").with_replies([
            r#"{"tool": "call_helper", "args": {"task": "which build?"}}"#,
            "done",
        ]),
        _ => {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            MockLlmClient::new(s.model.clone()).with_replies([format!("helper build {}", n)])
        }
    }));
    let cfg = config(
        r#"
agents:
  lead:
    model: lead
    tools: [delegate]
  helper:
    model: helper
tools:
  delegate:
    type: agent
    target_agent: helper
    context_strategy: minimal
"#,
    );
    let rt = GridRuntime::new(cfg, factory, None).unwrap();

    rt.registry().create("lead", None, false).await.unwrap();
    rt.registry().create("helper", None, true).await.unwrap();
    assert_eq!(helper_builds.load(Ordering::SeqCst), 2);

    rt.execute("lead", "go", None).await.unwrap();
    let contents: Vec<String> = rt
        .store()
        .conversation_history()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert!(contents.contains(&"[call_helper] helper build 2".to_string()));
}

#[tokio::test]
async fn test_max_history_evicts_oldest() {
    let (rt, _) = runtime("settings:\n  max_history: 3\n");
    for text in ["a", "b", "c", "d"] {
        rt.add_to_context(Role::User, text, None).unwrap();
    }
    let contents: Vec<String> = rt
        .store()
        .conversation_history()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["b", "c", "d"]);
    assert_eq!(rt.context_info().max_history, 3);
}

#[tokio::test]
async fn test_snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("context.json");
    let extra = format!(
        "{}\nsettings:\n  context_snapshot_path: {}\n",
        WRITER,
        snapshot.display()
    );

    let (rt, _) = runtime(&extra);
    rt.execute("writer", "persist this", None).await.unwrap();
    drop(rt);

    let (restarted, _) = runtime(&extra);
    let history = restarted.store().conversation_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "persist this");
    assert_eq!(restarted.recent_executions(None, 5).len(), 1);

    restarted.clear_context().unwrap();
    assert!(!snapshot.exists());
}

struct StaticMcp;

#[async_trait]
impl McpClient for StaticMcp {
    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
        Ok(vec![McpToolInfo {
            name: "docs_search".into(),
            description: "Search docs".into(),
            input_schema: json!({"type": "object"}),
        }])
    }

    async fn call_tool(&self, _name: &str, _args: Value) -> Result<String, McpError> {
        Ok("nothing".into())
    }

    async fn disconnect(&self) -> Result<(), McpError> {
        Ok(())
    }
}

struct StaticConnector;

#[async_trait]
impl McpConnector for StaticConnector {
    async fn connect(
        &self,
        _tool_name: &str,
        _config: &ToolConfig,
        _cwd: &Path,
    ) -> Result<Arc<dyn McpClient>, McpError> {
        Ok(Arc::new(StaticMcp))
    }
}

const MCP_AGENT: &str = r#"
agents:
  reader:
    model: small
    tools: [echo, docs]
tools:
  echo:
    type: function
  docs:
    type: mcp
    server_command: ["docs-server"]
"#;

#[tokio::test]
async fn test_disabled_mcp_is_recorded_as_unavailable() {
    let (rt, _) = runtime(MCP_AGENT);
    let handle = rt.registry().create("reader", None, false).await.unwrap();
    assert_eq!(handle.tool_names(), vec!["echo"]);
    assert_eq!(rt.store().get_metadata(MCP_UNAVAILABLE_KEY), Some(json!(["docs"])));
}

#[tokio::test]
async fn test_enabled_mcp_tools_are_attached_and_cleaned_up() {
    let cfg = config(&format!("{}\nsettings:\n  mcp_enabled: true\n", MCP_AGENT));
    let rt = GridRuntime::new(
        cfg,
        Arc::new(MockClientFactory::default()),
        Some(Arc::new(StaticConnector)),
    )
    .unwrap();
    let handle = rt.registry().create("reader", None, false).await.unwrap();
    assert_eq!(handle.tool_names(), vec!["echo", "docs_search"]);
    assert_eq!(rt.store().get_metadata(MCP_UNAVAILABLE_KEY), None);

    rt.execute("reader", "hi", None).await.unwrap();
    let report = rt.cleanup().await;
    assert!(report.is_clean());
    assert_eq!(report.completed, vec!["McpClients", "Sessions", "AgentCache"]);
    assert!(rt.sessions().is_empty().await);
    assert!(rt.registry().cached_keys().await.is_empty());
    assert!(handle.session().is_none());
}
