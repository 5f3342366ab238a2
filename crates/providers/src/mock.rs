//! Scriptable in-process LLM client for tests.
//!
//! Replies are queued ahead of time and consumed one per call; every
//! request the client sees is recorded for assertions.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crewd_domain::error::{Error, Result};
use crewd_domain::message::ContentBlock;
use crewd_domain::stream::{BoxStream, StreamEvent};

use crate::traits::{ChatRequest, ChatResponse, LlmClient};

/// One scripted reply.
pub enum ScriptedReply {
    /// Returned from `complete`.
    Response(ChatResponse),
    /// Returned from `complete_stream` as a sequence of events.
    Stream(Vec<StreamEvent>),
    /// Returned as an error from either operation.
    Error(Error),
}

/// A scriptable [`LlmClient`].
#[derive(Default)]
pub struct MockClient {
    script: Mutex<VecDeque<ScriptedReply>>,
    calls: Mutex<Vec<ChatRequest>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain-text assistant response.
    pub fn push_text(&self, text: &str) {
        self.push_response(ChatResponse {
            content: vec![ContentBlock::Text { text: text.into() }],
            usage: None,
            stop_reason: Some("end_turn".into()),
        });
    }

    /// Queue a response that invokes one tool.
    pub fn push_tool_use(&self, id: &str, name: &str, input: serde_json::Value) {
        self.push_response(ChatResponse {
            content: vec![ContentBlock::ToolUse {
                id: id.into(),
                name: name.into(),
                input,
            }],
            usage: None,
            stop_reason: Some("tool_use".into()),
        });
    }

    pub fn push_response(&self, resp: ChatResponse) {
        self.script.lock().push_back(ScriptedReply::Response(resp));
    }

    pub fn push_error(&self, err: Error) {
        self.script.lock().push_back(ScriptedReply::Error(err));
    }

    pub fn push_stream(&self, events: Vec<StreamEvent>) {
        self.script.lock().push_back(ScriptedReply::Stream(events));
    }

    /// Every request this client has received, in call order.
    pub fn calls(&self) -> Vec<ChatRequest> {
        self.calls.lock().clone()
    }

    /// Number of calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn next_reply(&self) -> Result<ScriptedReply> {
        self.script
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Other("mock script exhausted".into()))
    }
}

#[async_trait::async_trait]
impl LlmClient for MockClient {
    async fn complete(&self, req: ChatRequest) -> Result<ChatResponse> {
        self.calls.lock().push(req);
        match self.next_reply()? {
            ScriptedReply::Response(resp) => Ok(resp),
            ScriptedReply::Error(err) => Err(err),
            ScriptedReply::Stream(_) => Err(Error::Other(
                "mock script queued a stream for a synchronous call".into(),
            )),
        }
    }

    async fn complete_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.calls.lock().push(req);
        match self.next_reply()? {
            ScriptedReply::Stream(events) => {
                let s = async_stream::stream! {
                    for event in events {
                        yield Ok(event);
                    }
                };
                Ok(Box::pin(s))
            }
            ScriptedReply::Error(err) => Err(err),
            ScriptedReply::Response(_) => Err(Error::Other(
                "mock script queued a response for a streaming call".into(),
            )),
        }
    }
}
