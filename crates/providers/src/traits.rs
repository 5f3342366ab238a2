use crewd_domain::error::Result;
use crewd_domain::message::{ContentBlock, Message, ToolSpec};
use crewd_domain::stream::{BoxStream, StreamEvent, Usage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Model identifier. Resolved by the crew before the runner is built.
    pub model: String,
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// System prompt, kept out of `messages` so adapters with a top-level
    /// system field need no message surgery.
    pub system_prompt: String,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolSpec>,
    /// Maximum tokens in the response.
    pub max_tokens: u32,
    /// Sampling temperature. `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// Conversation thread this request belongs to. Request metadata so
    /// middleware (context compression) can persist markers against the
    /// right transcript.
    pub thread_id: Option<String>,
}

/// A provider-agnostic chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Ordered content blocks the model produced.
    pub content: Vec<ContentBlock>,
    /// Token usage information.
    pub usage: Option<Usage>,
    /// The reason the model stopped generating (e.g. "end_turn", "tool_use").
    pub stop_reason: Option<String>,
}

impl ChatResponse {
    /// Join all text blocks of the response.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// The tool_use blocks of the response, in order.
    pub fn tool_uses(&self) -> Vec<&ContentBlock> {
        self.content
            .iter()
            .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core client trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait that every LLM backend adapter must implement.
///
/// Adapters translate between our internal types and the wire format of
/// each provider's HTTP API, and must surface native rate-limit and
/// oversize errors as the typed `Error::RateLimit` / `Error::RequestTooLarge`
/// variants so the middleware can classify them.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn complete(&self, req: ChatRequest) -> Result<ChatResponse>;

    /// Send a chat completion request and return a stream of events.
    ///
    /// Streams deliver, in order: `start`, any number of `content_block` /
    /// `content_delta` / `message_delta` events, and a terminal `stop`.
    async fn complete_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;
}
