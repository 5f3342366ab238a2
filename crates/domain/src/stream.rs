use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted during LLM streaming (provider-agnostic).
///
/// A well-formed stream delivers `Start`, any number of `ContentBlock` /
/// `ContentDelta` / `MessageDelta` events, and a terminal `Stop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The message has started. May carry prompt-side usage.
    Start {
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    /// A new content block opened at `index`. `tool_use` is present when
    /// the block is a tool invocation; a plain text block carries none.
    ContentBlock {
        index: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_use: Option<ToolUseStart>,
    },

    /// Incremental content for the block at `index`.
    ContentDelta { index: u32, delta: Delta },

    /// Message-level metadata mid-stream: stop reason and/or usage.
    MessageDelta {
        #[serde(skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    /// Stream is finished.
    Stop,
}

/// Identity of a tool-use block announced at block start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseStart {
    pub id: String,
    pub name: String,
}

/// Incremental payload inside a content block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delta {
    /// A text chunk.
    Text { text: String },
    /// A chunk of the tool-use input JSON, to be buffered and parsed at
    /// stream end.
    ToolInput { partial_json: String },
}

/// Token usage for a completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}
