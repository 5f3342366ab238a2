//! Provider-neutral LLM facade: the two-operation client trait, the
//! middleware chain that wraps it, the rate-limit and context-compression
//! middleware, the process-wide client cache, and one concrete
//! messages-API adapter.

pub mod anthropic;
pub mod cache;
pub mod compress;
pub mod middleware;
pub mod mock;
pub mod ratelimit;
pub mod traits;
pub(crate) mod sse;

// Re-exports for convenience.
pub use anthropic::AnthropicClient;
pub use cache::{ClientCache, ClientKey};
pub use compress::{context_size, CompressionMiddleware, CONTEXT_COMPRESSION_THRESHOLD};
pub use middleware::{ErrorAction, Middleware, MiddlewareClient};
pub use ratelimit::{RateLimitController, RateLimitMiddleware, RetryDecision};
pub use traits::{ChatRequest, ChatResponse, LlmClient};
