//! Shared fixtures for the runtime integration tests: a client factory
//! over the scriptable mock, a scripted tool executor, and a fixed
//! summarizer.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crewd_domain::config::{AgentConfig, Config};
use crewd_domain::error::{Error, Result};
use crewd_domain::interfaces::{Summarizer, ToolExecutor};
use crewd_providers::mock::MockClient;
use crewd_providers::LlmClient;
use crewd_runtime::{ClientFactory, RegisteredTool, ToolRegistry};

/// Install a test subscriber once so `RUST_LOG=debug cargo test` shows
/// runtime tracing.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Factory that hands every agent the same scripted mock client.
pub struct MockFactory {
    pub client: Arc<MockClient>,
    pub builds: Mutex<u32>,
}

impl MockFactory {
    pub fn new(client: Arc<MockClient>) -> Self {
        Self {
            client,
            builds: Mutex::new(0),
        }
    }
}

impl ClientFactory for MockFactory {
    fn build(
        &self,
        _provider: &str,
        _settings: &crewd_domain::config::ProviderSettings,
        _credential_ref: Option<&str>,
    ) -> Result<Arc<dyn LlmClient>> {
        *self.builds.lock() += 1;
        Ok(self.client.clone())
    }
}

/// Executor that pops scripted replies; an empty queue answers
/// `{"ok":true}`.
#[derive(Default)]
pub struct ScriptedExecutor {
    replies: Mutex<VecDeque<Result<serde_json::Value>>>,
    pub calls: Mutex<Vec<(String, String, String)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, value: serde_json::Value) {
        self.replies.lock().push_back(Ok(value));
    }

    pub fn push_err(&self, message: &str) {
        self.replies
            .lock()
            .push_back(Err(Error::Other(message.into())));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait::async_trait]
impl ToolExecutor for ScriptedExecutor {
    async fn handle(
        &self,
        tool_name: &str,
        agent_id: &str,
        input_json: &str,
    ) -> Result<serde_json::Value> {
        self.calls.lock().push((
            tool_name.to_string(),
            agent_id.to_string(),
            input_json.to_string(),
        ));
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(serde_json::json!({"ok": true})))
    }
}

/// Summarizer returning fixed strings.
pub struct FixedSummarizer;

#[async_trait::async_trait]
impl Summarizer for FixedSummarizer {
    async fn summarize_text(&self, _text: &str) -> Result<String> {
        Ok("condensed".into())
    }

    async fn summarize_context(&self, _transcript: &str) -> Result<String> {
        Ok("what happened so far".into())
    }
}

/// A config with one usable provider and the given agents.
pub fn config_with_agents(agents: Vec<AgentConfig>) -> Config {
    let mut config: Config = serde_json::from_value(serde_json::json!({
        "providers": {
            "anthropic": { "api_key": "sk-test", "default_model": "claude-sonnet-4" }
        }
    }))
    .unwrap();
    config.agents = agents;
    config
}

pub fn agent(id: &str, schedule: Option<&str>) -> AgentConfig {
    let mut value = serde_json::json!({
        "id": id,
        "name": id,
        "system_prompt": "You are a helpful agent.",
        "tools": ["echo", "web\\..*"],
    });
    if let Some(s) = schedule {
        value["schedule"] = serde_json::json!(s);
    }
    serde_json::from_value(value).unwrap()
}

/// Registry with the tools the test agents reference.
pub fn registry() -> ToolRegistry {
    let mut r = ToolRegistry::new();
    r.register(
        "echo",
        RegisteredTool {
            server: None,
            description: "Echo the input back.".into(),
            schema: serde_json::json!({
                "type": "object",
                "properties": { "x": { "type": "integer" } },
                "required": ["x"],
            }),
        },
    );
    r.register(
        "web.search",
        RegisteredTool {
            server: None,
            description: "Search the web.".into(),
            schema: serde_json::json!({
                "type": "object",
                "properties": { "query": { "type": "string" } },
                "required": ["query"],
            }),
        },
    );
    r
}
