//! Contracts for the runtime's external collaborators: tool execution,
//! message-history persistence, and text summarization. The core calls
//! through these traits and makes no assumption about what sits behind
//! them (local handlers, a database, another service).

use crate::error::Result;

/// Executes one tool call on behalf of an agent.
///
/// The returned value must serialize to JSON; it is fed back to the model
/// verbatim as a tool_result block.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn handle(
        &self,
        tool_name: &str,
        agent_id: &str,
        input_json: &str,
    ) -> Result<serde_json::Value>;
}

/// Kind of a context-management marker written into a thread's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMarker {
    /// The thread's history was cleared.
    Reset,
    /// The thread's history was collapsed into a summary.
    Compress,
}

impl SystemMarker {
    pub fn as_str(self) -> &'static str {
        match self {
            SystemMarker::Reset => "reset",
            SystemMarker::Compress => "compress",
        }
    }
}

/// Append-only message history for a `(agent_id, thread_id)` pair.
///
/// The runner persists messages in production order; implementations must
/// preserve that order per thread. No ordering is required across threads.
#[async_trait::async_trait]
pub trait MessagePersister: Send + Sync {
    async fn append_user(&self, agent_id: &str, thread_id: &str, content: &str) -> Result<()>;

    async fn append_assistant(&self, agent_id: &str, thread_id: &str, content: &str)
        -> Result<()>;

    async fn append_tool_call(
        &self,
        agent_id: &str,
        thread_id: &str,
        tool_id: &str,
        tool_name: &str,
        input: &serde_json::Value,
    ) -> Result<()>;

    async fn append_tool_result(
        &self,
        agent_id: &str,
        thread_id: &str,
        tool_id: &str,
        tool_name: &str,
        result: &str,
        is_error: bool,
    ) -> Result<()>;

    /// Record a context-management event (history reset or compression).
    async fn append_system(
        &self,
        agent_id: &str,
        thread_id: &str,
        content: &str,
        kind: SystemMarker,
    ) -> Result<()>;
}

/// Produces short summaries of oversized text and of whole conversations.
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    /// Shorten a single oversized text (tool output, final reply).
    async fn summarize_text(&self, text: &str) -> Result<String>;

    /// Summarize a joined conversation transcript for context compression.
    async fn summarize_context(&self, transcript: &str) -> Result<String>;
}
