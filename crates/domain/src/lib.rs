//! Shared domain types for the crewd runtime: provider-neutral chat
//! messages, streaming events, the workspace-wide error enum, collaborator
//! contracts, and the configuration records agents are built from.

pub mod cancel;
pub mod config;
pub mod error;
pub mod interfaces;
pub mod message;
pub mod stream;

pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use interfaces::{MessagePersister, Summarizer, SystemMarker, ToolExecutor};
pub use message::{ContentBlock, InputSchema, Message, Role, ToolSpec};
pub use stream::{BoxStream, Delta, StreamEvent, ToolUseStart, Usage};
