//! Context-compression middleware.
//!
//! When a conversation grows past the character threshold, the whole
//! history is collapsed into a single user message carrying a summary
//! produced by the external summarizer. The same compression runs once
//! per request as recovery when the backend rejects a request as too
//! large.

use std::sync::Arc;

use parking_lot::Mutex;

use crewd_domain::error::{Error, Result};
use crewd_domain::interfaces::{MessagePersister, Summarizer, SystemMarker};
use crewd_domain::message::{ContentBlock, Message, Role};

use crate::middleware::{ErrorAction, Middleware};
use crate::traits::{ChatRequest, ChatResponse};

/// Context size at which compression kicks in, inclusive.
pub const CONTEXT_COMPRESSION_THRESHOLD: usize = 1_000_000;

/// Character count of a request's conversational payload: the system
/// prompt plus, per content block, the text length, the tool name +
/// serialized input length, or the tool-result content length.
pub fn context_size(system_prompt: &str, messages: &[Message]) -> usize {
    let mut total = system_prompt.len();
    for msg in messages {
        for block in &msg.content {
            total += match block {
                ContentBlock::Text { text } => text.len(),
                ContentBlock::ToolUse { name, input, .. } => {
                    name.len() + input.to_string().len()
                }
                ContentBlock::ToolResult { content, .. } => content.len(),
            };
        }
    }
    total
}

/// Per-agent middleware that compresses oversized context.
pub struct CompressionMiddleware {
    agent_id: String,
    summarizer: Arc<dyn Summarizer>,
    persister: Option<Arc<dyn MessagePersister>>,
    /// Set when this request already recovered from a 413; a second
    /// oversize error propagates.
    compressed_on_error: Mutex<bool>,
}

impl CompressionMiddleware {
    pub fn new(
        agent_id: impl Into<String>,
        summarizer: Arc<dyn Summarizer>,
        persister: Option<Arc<dyn MessagePersister>>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            summarizer,
            persister,
            compressed_on_error: Mutex::new(false),
        }
    }

    /// Collapse the request's history into one summary user message.
    async fn compress(&self, req: &ChatRequest) -> Result<ChatRequest> {
        let transcript = render_transcript(&req.messages);
        let summary = self.summarizer.summarize_context(&transcript).await?;
        let content = format!("Previous conversation summary: {summary}");

        if let Some(persister) = &self.persister {
            if let Some(thread_id) = &req.thread_id {
                if let Err(e) = persister
                    .append_system(&self.agent_id, thread_id, &content, SystemMarker::Compress)
                    .await
                {
                    tracing::warn!(
                        agent_id = %self.agent_id,
                        error = %e,
                        "failed to persist compression marker"
                    );
                }
            } else {
                tracing::warn!(
                    agent_id = %self.agent_id,
                    "compressing a request with no thread id, marker not persisted"
                );
            }
        }

        let mut out = req.clone();
        out.messages = vec![Message::user(content)];
        Ok(out)
    }
}

#[async_trait::async_trait]
impl Middleware for CompressionMiddleware {
    async fn before_request(&self, req: ChatRequest) -> Result<ChatRequest> {
        // A fresh request gets a fresh 413-recovery budget.
        *self.compressed_on_error.lock() = false;

        let size = context_size(&req.system_prompt, &req.messages);
        if size < CONTEXT_COMPRESSION_THRESHOLD {
            return Ok(req);
        }

        tracing::info!(
            agent_id = %self.agent_id,
            context_chars = size,
            "context over threshold, compressing"
        );
        match self.compress(&req).await {
            Ok(compressed) => Ok(compressed),
            Err(e) => {
                // Proceed with the full history; the backend may still
                // accept it, and a 413 gets a second chance below.
                tracing::warn!(
                    agent_id = %self.agent_id,
                    error = %e,
                    "proactive compression failed, sending full history"
                );
                Ok(req)
            }
        }
    }

    async fn on_error(&self, req: &ChatRequest, err: Error) -> ErrorAction {
        if !err.is_request_too_large() {
            return ErrorAction::Propagate(err);
        }
        {
            let mut compressed = self.compressed_on_error.lock();
            if *compressed {
                // Already compressed once for this request; give up.
                return ErrorAction::Propagate(err);
            }
            *compressed = true;
        }

        tracing::info!(
            agent_id = %self.agent_id,
            "request too large, compressing and retrying"
        );
        match self.compress(req).await {
            Ok(compressed) => ErrorAction::Retry {
                request: Some(compressed),
            },
            Err(e) => {
                tracing::warn!(
                    agent_id = %self.agent_id,
                    error = %e,
                    "compression after oversize error failed"
                );
                ErrorAction::Propagate(err)
            }
        }
    }
}

/// Flatten messages into a plain transcript for the summarizer.
fn render_transcript(messages: &[Message]) -> String {
    let mut buf = String::new();
    for msg in messages {
        let label = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        };
        for block in &msg.content {
            buf.push_str(label);
            buf.push_str(": ");
            match block {
                ContentBlock::Text { text } => buf.push_str(text),
                ContentBlock::ToolUse { name, input, .. } => {
                    buf.push_str(&format!("[tool {name} {input}]"));
                }
                ContentBlock::ToolResult { content, .. } => {
                    buf.push_str(&format!("[tool result] {content}"));
                }
            }
            buf.push('\n');
        }
    }
    buf
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
