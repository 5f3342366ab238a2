//! Anthropic-native messages adapter.
//!
//! Translates the provider-neutral request into the Messages API wire
//! format (system prompt as a top-level field, tool results as user
//! content blocks) and converts native 429/413 responses into the typed
//! errors the rate-limit and compression middleware classify.

use serde_json::Value;

use crewd_domain::config::ProviderSettings;
use crewd_domain::error::{Error, Result};
use crewd_domain::message::{ContentBlock, Message, Role};
use crewd_domain::stream::{BoxStream, Delta, StreamEvent, ToolUseStart, Usage};

use crate::ratelimit::parse_retry_after_header;
use crate::traits::{ChatRequest, ChatResponse, LlmClient};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An [`LlmClient`] adapter for the Anthropic Messages API.
#[derive(Debug)]
pub struct AnthropicClient {
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("anthropic provider has no api_key".into()))?;

        let base_url = settings
            .base_url
            .clone()
            .or_else(|| settings.host.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.into());

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: settings.default_model.clone(),
            client,
        })
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn build_messages_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let model = if req.model.is_empty() {
            self.default_model.clone()
        } else {
            req.model.clone()
        };

        // System content goes in the top-level field. Tolerate system-role
        // messages in the history by folding them in.
        let mut system_parts: Vec<String> = Vec::new();
        if !req.system_prompt.is_empty() {
            system_parts.push(req.system_prompt.clone());
        }

        let mut api_messages: Vec<Value> = Vec::new();
        for msg in &req.messages {
            match msg.role {
                Role::System => system_parts.push(msg.text()),
                Role::User | Role::Assistant => {
                    api_messages.push(message_to_wire(msg));
                }
            }
        }

        let mut body = serde_json::json!({
            "model": model,
            "messages": api_messages,
            "max_tokens": req.max_tokens.max(1),
            "stream": stream,
        });

        if !system_parts.is_empty() {
            body["system"] = Value::String(system_parts.join("\n\n"));
        }

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }

        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }

        body
    }

    /// Map a non-success HTTP response to a typed error.
    fn error_from_response(&self, status: u16, retry_after: Option<&str>, body: &str) -> Error {
        match status {
            429 => Error::RateLimit {
                message: format!("HTTP 429 - {body}"),
                retry_after: retry_after.and_then(parse_retry_after_header),
            },
            413 => Error::RequestTooLarge(format!("HTTP 413 - {body}")),
            _ => Error::Provider {
                provider: "anthropic".into(),
                message: format!("HTTP {status} - {body}"),
            },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn message_to_wire(msg: &Message) -> Value {
    let role = match msg.role {
        Role::Assistant => "assistant",
        // Tool results ride in user messages on this API.
        _ => "user",
    };
    let content: Vec<Value> = msg.content.iter().map(block_to_wire).collect();
    serde_json::json!({ "role": role, "content": content })
}

fn block_to_wire(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => serde_json::json!({
            "type": "text",
            "text": text,
        }),
        ContentBlock::ToolUse { id, name, input } => serde_json::json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => serde_json::json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        }),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_response(body: &Value) -> Result<ChatResponse> {
    let empty = Vec::new();
    let content_arr = body
        .get("content")
        .and_then(|v| v.as_array())
        .unwrap_or(&empty);

    let mut content: Vec<ContentBlock> = Vec::new();
    for block in content_arr {
        let block_type = block.get("type").and_then(|v| v.as_str()).unwrap_or("");
        match block_type {
            "text" => {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    content.push(ContentBlock::Text { text: t.to_string() });
                }
            }
            "tool_use" => {
                content.push(ContentBlock::ToolUse {
                    id: block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    name: block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    input: block
                        .get("input")
                        .cloned()
                        .unwrap_or(Value::Object(Default::default())),
                });
            }
            _ => {}
        }
    }

    let stop_reason = body
        .get("stop_reason")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let usage = body.get("usage").and_then(parse_usage);

    Ok(ChatResponse {
        content,
        usage,
        stop_reason,
    })
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let input = v.get("input_tokens")?.as_u64()? as u32;
    let output = v.get("output_tokens")?.as_u64()? as u32;
    Some(Usage {
        prompt_tokens: input,
        completion_tokens: output,
        total_tokens: input + output,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming SSE translation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Mutable state carried across SSE payloads.
struct StreamState {
    usage: Option<Usage>,
    stop_emitted: bool,
}

impl StreamState {
    fn new() -> Self {
        Self {
            usage: None,
            stop_emitted: false,
        }
    }
}

/// Parse one Anthropic SSE data payload into zero or more stream events.
fn parse_sse(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Json(e)));
            return events;
        }
    };

    let event_type = v.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match event_type {
        "message_start" => {
            if let Some(msg) = v.get("message") {
                state.usage = msg.get("usage").and_then(parse_usage);
            }
            events.push(Ok(StreamEvent::Start {
                usage: state.usage.clone(),
            }));
        }

        "content_block_start" => {
            let index = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            let tool_use = v.get("content_block").and_then(|block| {
                if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                    Some(ToolUseStart {
                        id: block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                    })
                } else {
                    None
                }
            });
            events.push(Ok(StreamEvent::ContentBlock { index, tool_use }));
        }

        "content_block_delta" => {
            let index = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            if let Some(delta) = v.get("delta") {
                match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                events.push(Ok(StreamEvent::ContentDelta {
                                    index,
                                    delta: Delta::Text {
                                        text: text.to_string(),
                                    },
                                }));
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) =
                            delta.get("partial_json").and_then(|v| v.as_str())
                        {
                            events.push(Ok(StreamEvent::ContentDelta {
                                index,
                                delta: Delta::ToolInput {
                                    partial_json: partial.to_string(),
                                },
                            }));
                        }
                    }
                    _ => {}
                }
            }
        }

        "message_delta" => {
            if let Some(usage_val) = v.get("usage") {
                if let Some(output) = usage_val.get("output_tokens").and_then(|v| v.as_u64()) {
                    if let Some(ref mut u) = state.usage {
                        u.completion_tokens = output as u32;
                        u.total_tokens = u.prompt_tokens + u.completion_tokens;
                    }
                }
            }
            let stop_reason = v
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            events.push(Ok(StreamEvent::MessageDelta {
                stop_reason,
                usage: state.usage.clone(),
            }));
        }

        "message_stop" => {
            state.stop_emitted = true;
            events.push(Ok(StreamEvent::Stop));
        }

        "error" => {
            let msg = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            events.push(Err(Error::Provider {
                provider: "anthropic".into(),
                message: msg.to_string(),
            }));
        }

        _ => {
            // ping, content_block_stop, unknown -- nothing to surface.
        }
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_messages_body(&req, false);

        tracing::debug!(url = %url, model = %req.model, "anthropic chat request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(format!("request failed: {e}")))?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let resp_text = resp
            .text()
            .await
            .map_err(|e| Error::Http(format!("reading response failed: {e}")))?;

        if !(200..300).contains(&status) {
            return Err(self.error_from_response(status, retry_after.as_deref(), &resp_text));
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_response(&resp_json)
    }

    async fn complete_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_messages_body(&req, true);

        tracing::debug!(url = %url, model = %req.model, "anthropic stream request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(format!("request failed: {e}")))?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let err_text = resp
                .text()
                .await
                .map_err(|e| Error::Http(format!("reading response failed: {e}")))?;
            return Err(self.error_from_response(status, retry_after.as_deref(), &err_text));
        }

        let mut state = StreamState::new();
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            parse_sse(data, &mut state)
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
