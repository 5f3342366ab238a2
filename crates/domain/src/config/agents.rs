use serde::{Deserialize, Serialize};
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration record for one long-lived agent.
///
/// Agents are loaded once at startup; their durable state and counters
/// live in the stores, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique agent id. Keys every durable record.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// System prompt sent with every model call.
    #[serde(default)]
    pub system_prompt: String,
    /// The user message a scheduled wake submits.
    #[serde(default = "d_wake_prompt")]
    pub prompt: String,
    /// Response token budget per model call.
    #[serde(default = "d_4096")]
    pub max_tokens: u32,
    /// Ordered tool-name patterns, each `[server:]regex`, expanded against
    /// the tool registry.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Schedule expression: cron (5- or 6-field) or a duration literal
    /// like `15m` / `1h30m`. `None` = interactive only.
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    /// Delay before the first scheduled wake after boot, as a duration
    /// literal (`30s`, `5m`).
    #[serde(default)]
    pub startup_delay: Option<String>,
    /// Ordered provider/model preferences; the first entry whose provider
    /// is enabled and configured wins.
    #[serde(default)]
    pub llm_preferences: Vec<LlmPreference>,
}

impl AgentConfig {
    /// Parse `startup_delay` into a concrete duration. An unparsable value
    /// is treated as absent with a warning.
    pub fn startup_delay(&self) -> Option<Duration> {
        let raw = self.startup_delay.as_deref()?;
        match humantime::parse_duration(raw) {
            Ok(d) => Some(d),
            Err(e) => {
                tracing::warn!(
                    agent_id = %self.id,
                    startup_delay = raw,
                    error = %e,
                    "ignoring unparsable startup_delay"
                );
                None
            }
        }
    }
}

/// One entry of an agent's model preference list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmPreference {
    /// Provider name (key into the provider table).
    pub provider: String,
    /// Model identifier. Empty = the provider's default model.
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Named credential override; resolved by the provider table.
    #[serde(default)]
    pub credential_ref: Option<String>,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_wake_prompt() -> String {
    "It is time for your scheduled check. Review your duties and act.".into()
}
fn d_4096() -> u32 {
    4096
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
