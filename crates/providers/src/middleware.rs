//! Ordered middleware chain around an [`LlmClient`].
//!
//! Requests pass through `before_request` hooks in registration order,
//! responses back through `after_response` in reverse. On an error the
//! `on_error` hooks run in registration order; the first hook that asks
//! for a retry wins and the request is re-issued. Streaming hooks are
//! observational.

use std::sync::Arc;

use crewd_domain::error::{Error, Result};
use crewd_domain::stream::{BoxStream, StreamEvent};

use crate::traits::{ChatRequest, ChatResponse, LlmClient};

/// Upper bound on hook-driven retries of a single logical request. The
/// rate-limit controller exhausts long before this; the bound only stops
/// a misbehaving hook from looping forever.
const MAX_ERROR_RETRIES: u32 = 16;

/// What an `on_error` hook wants done with a failed request.
pub enum ErrorAction {
    /// Pass the (possibly transformed) error to the next hook, and to the
    /// caller if no hook recovers.
    Propagate(Error),
    /// Re-issue the request. When `request` is set the retry uses it
    /// (e.g. a compressed history); otherwise the previous request is
    /// sent again.
    Retry { request: Option<ChatRequest> },
}

/// A middleware layer around the LLM facade.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    /// Inspect or rewrite the outgoing request.
    async fn before_request(&self, req: ChatRequest) -> Result<ChatRequest> {
        Ok(req)
    }

    /// Inspect or rewrite the response on the way back.
    async fn after_response(&self, resp: ChatResponse) -> Result<ChatResponse> {
        Ok(resp)
    }

    /// Decide what happens to a failed request.
    async fn on_error(&self, _req: &ChatRequest, err: Error) -> ErrorAction {
        ErrorAction::Propagate(err)
    }

    /// Observe one streaming event.
    fn on_stream_event(&self, _event: &StreamEvent) {}

    /// Observe a mid-stream error.
    fn on_stream_error(&self, _err: &Error) {}
}

/// An [`LlmClient`] wrapping an inner client with an ordered middleware
/// list. Built per agent by the crew; the inner client may be shared
/// across agents, the middleware never is.
pub struct MiddlewareClient {
    inner: Arc<dyn LlmClient>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareClient {
    pub fn new(inner: Arc<dyn LlmClient>, middleware: Vec<Arc<dyn Middleware>>) -> Self {
        Self { inner, middleware }
    }

    /// Run `before_request` hooks in registration order.
    async fn apply_before(&self, req: ChatRequest) -> Result<ChatRequest> {
        let mut current = req;
        for mw in &self.middleware {
            current = mw.before_request(current).await?;
        }
        Ok(current)
    }

    /// Run `on_error` hooks in registration order until one recovers.
    async fn apply_on_error(&self, req: &ChatRequest, err: Error) -> ErrorAction {
        let mut action = ErrorAction::Propagate(err);
        for mw in &self.middleware {
            match action {
                ErrorAction::Propagate(e) => action = mw.on_error(req, e).await,
                ErrorAction::Retry { .. } => break,
            }
        }
        action
    }
}

#[async_trait::async_trait]
impl LlmClient for MiddlewareClient {
    async fn complete(&self, req: ChatRequest) -> Result<ChatResponse> {
        let mut current = self.apply_before(req).await?;

        let mut attempts = 0u32;
        loop {
            match self.inner.complete(current.clone()).await {
                Ok(mut resp) => {
                    for mw in self.middleware.iter().rev() {
                        resp = mw.after_response(resp).await?;
                    }
                    return Ok(resp);
                }
                Err(err) => match self.apply_on_error(&current, err).await {
                    ErrorAction::Retry { request } => {
                        attempts += 1;
                        if attempts > MAX_ERROR_RETRIES {
                            return Err(Error::Other(
                                "middleware retry loop exceeded its bound".into(),
                            ));
                        }
                        if let Some(r) = request {
                            current = r;
                        }
                    }
                    ErrorAction::Propagate(err) => return Err(err),
                },
            }
        }
    }

    async fn complete_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let mut current = self.apply_before(req).await?;

        // Retry loop covers stream *setup*; once events are flowing the
        // hooks only observe.
        let mut attempts = 0u32;
        let stream = loop {
            match self.inner.complete_stream(current.clone()).await {
                Ok(s) => break s,
                Err(err) => match self.apply_on_error(&current, err).await {
                    ErrorAction::Retry { request } => {
                        attempts += 1;
                        if attempts > MAX_ERROR_RETRIES {
                            return Err(Error::Other(
                                "middleware retry loop exceeded its bound".into(),
                            ));
                        }
                        if let Some(r) = request {
                            current = r;
                        }
                    }
                    ErrorAction::Propagate(err) => return Err(err),
                },
            }
        };

        let middleware = self.middleware.clone();
        let wrapped = async_stream::stream! {
            let mut stream = stream;
            use futures_util::StreamExt;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => {
                        for mw in &middleware {
                            mw.on_stream_event(&event);
                        }
                        yield Ok(event);
                    }
                    Err(err) => {
                        for mw in &middleware {
                            mw.on_stream_error(&err);
                        }
                        yield Err(err);
                    }
                }
            }
        };
        Ok(Box::pin(wrapped))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
