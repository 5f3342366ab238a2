//! Durable per-agent persistence: the agent state machine, monotonic
//! counters, and append-only JSONL thread transcripts.

pub mod state;
pub mod stats;
pub mod transcript;

pub use state::{AgentState, AgentStatus, StateStore};
pub use stats::{AgentStats, StatsStore};
pub use transcript::{ThreadTranscript, TranscriptLine};
