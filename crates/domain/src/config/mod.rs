//! Configuration records for the crewd runtime.
//!
//! These are plain serde structs; reading and merging config files is the
//! embedding application's concern. Every field defaults so partial
//! documents deserialize cleanly.

mod agents;
mod llm;

pub use agents::{AgentConfig, LlmPreference};
pub use llm::{ProviderSettings, ProvidersConfig};

use serde::{Deserialize, Serialize};

/// Top-level configuration: the agent roster plus shared runtime knobs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
}

/// Shared runtime knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory for durable state (agent states, stats, transcripts).
    #[serde(default = "d_data_dir")]
    pub data_dir: std::path::PathBuf,
    /// Wake scheduler tick interval in seconds.
    #[serde(default = "d_15")]
    pub tick_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: d_data_dir(),
            tick_interval_secs: d_15(),
        }
    }
}

/// Thresholds above which tool results and final replies are handed to the
/// summarizer collaborator before being fed back or persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SummarizerConfig {
    #[serde(default = "d_4000")]
    pub max_chars: usize,
    #[serde(default = "d_100")]
    pub max_lines: usize,
    #[serde(default = "d_80")]
    pub max_line_breaks: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            max_chars: d_4000(),
            max_lines: d_100(),
            max_line_breaks: d_80(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_data_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("./data")
}
fn d_15() -> u64 {
    15
}
fn d_4000() -> usize {
    4000
}
fn d_100() -> usize {
    100
}
fn d_80() -> usize {
    80
}
