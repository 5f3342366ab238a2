//! Turn execution — the bounded model ↔ tool loop that produces one
//! assistant reply per agent invocation.
//!
//! Entry points: [`TurnRunner::run`] (synchronous completions) and
//! [`TurnRunner::run_stream`] (streaming, with a channel of
//! [`TurnEvent`]s). Both share the same loop; only the model-call leg
//! differs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use crewd_domain::cancel::CancelToken;
use crewd_domain::config::{AgentConfig, SummarizerConfig};
use crewd_domain::error::{Error, Result};
use crewd_domain::interfaces::{MessagePersister, Summarizer, ToolExecutor};
use crewd_domain::message::{ContentBlock, Message, Role, ToolSpec};
use crewd_domain::stream::{Delta, StreamEvent};
use crewd_providers::{ChatRequest, LlmClient};
use crewd_scheduler::Schedule;
use crewd_store::{AgentStatus, StateStore, StatsStore};

/// Hard ceiling on model calls per turn.
pub const MAX_ITERATIONS: u32 = 20;

/// Identical failing tool calls tolerated before the turn aborts.
const MAX_IDENTICAL_TOOL_FAILURES: u32 = 3;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnEvent — streaming surface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted while a streaming turn is in flight.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// A new turn began. `run_id` correlates every later event of this
    /// turn with its tracing span.
    Started { run_id: Uuid },

    /// Incremental assistant text.
    AssistantDelta { text: String },

    /// The model invoked a tool.
    ToolCallStarted {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// A tool finished.
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        content: String,
        is_error: bool,
    },

    /// The final assistant reply.
    Final { content: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a runner carries, assembled once per agent by the crew.
pub struct RunnerParts {
    pub agent: AgentConfig,
    /// Resolved model identifier.
    pub model: String,
    pub temperature: Option<f32>,
    /// Middleware-wrapped client.
    pub client: Arc<dyn LlmClient>,
    /// Tool specs expanded from the agent's patterns.
    pub tools: Vec<ToolSpec>,
    pub executor: Arc<dyn ToolExecutor>,
    pub state: Arc<StateStore>,
    pub stats: Arc<StatsStore>,
    pub persister: Arc<dyn MessagePersister>,
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub thresholds: SummarizerConfig,
    /// Parsed schedule, when the agent has one.
    pub schedule: Option<Schedule>,
    pub cancel: CancelToken,
}

/// Executes turns for one agent.
pub struct TurnRunner {
    parts: RunnerParts,
}

impl TurnRunner {
    pub fn new(parts: RunnerParts) -> Self {
        Self { parts }
    }

    pub fn agent_id(&self) -> &str {
        &self.parts.agent.id
    }

    /// Run one turn to completion and return the final assistant text.
    ///
    /// Each invocation gets a fresh `run_id`; every log line of the turn
    /// carries it via the surrounding span.
    pub async fn run(
        &self,
        thread_id: &str,
        user_msg: &str,
        history: Vec<Message>,
    ) -> Result<String> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "turn",
            %run_id,
            agent_id = %self.parts.agent.id,
            thread_id,
        );
        async {
            self.parts
                .state
                .set_state(self.agent_id(), AgentStatus::Running);
            let result = self.run_inner(thread_id, user_msg, history, None).await;
            self.finalize(&result);
            result
        }
        .instrument(span)
        .await
    }

    /// Streaming twin of [`run`]: deltas and tool events go to `tx`, the
    /// final text is also returned. The first event is `Started` with the
    /// turn's `run_id`.
    pub async fn run_stream(
        &self,
        thread_id: &str,
        user_msg: &str,
        history: Vec<Message>,
        tx: mpsc::Sender<TurnEvent>,
    ) -> Result<String> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "turn",
            %run_id,
            agent_id = %self.parts.agent.id,
            thread_id,
        );
        async {
            self.parts
                .state
                .set_state(self.agent_id(), AgentStatus::Running);
            let _ = tx.send(TurnEvent::Started { run_id }).await;
            let result = self
                .run_inner(thread_id, user_msg, history, Some(&tx))
                .await;
            if let Ok(text) = &result {
                let _ = tx
                    .send(TurnEvent::Final {
                        content: text.clone(),
                    })
                    .await;
            }
            self.finalize(&result);
            result
        }
        .instrument(span)
        .await
    }

    // ── Finalization ───────────────────────────────────────────────

    /// Runs on every exit path: record the outcome and move the agent out
    /// of `running`. A cancelled turn counts as neither success nor
    /// failure; a rate-limit reschedule already parked the agent and its
    /// wake must not be clobbered with the regular schedule.
    fn finalize(&self, result: &Result<String>) {
        let agent_id = self.agent_id();
        match result {
            Ok(_) => self.parts.stats.record_execution(agent_id),
            Err(Error::Cancelled) | Err(Error::RetryScheduled { .. }) => {}
            Err(e) => self.parts.stats.record_failure(agent_id, &e.to_string()),
        }

        if matches!(result, Err(Error::RetryScheduled { .. })) {
            return;
        }

        let next_wake = if self.parts.agent.disabled {
            None
        } else {
            self.parts
                .schedule
                .as_ref()
                .and_then(|s| s.next_after(Utc::now()))
        };
        match next_wake {
            Some(wake) => self.parts.state.set_state_with_wake(
                agent_id,
                AgentStatus::WaitingExternal,
                Some(wake.timestamp()),
            ),
            None => self.parts.state.set_state(agent_id, AgentStatus::Idle),
        }
    }

    // ── The loop ───────────────────────────────────────────────────

    async fn run_inner(
        &self,
        thread_id: &str,
        user_msg: &str,
        history: Vec<Message>,
        tx: Option<&mpsc::Sender<TurnEvent>>,
    ) -> Result<String> {
        let agent_id = self.agent_id().to_string();

        self.persist(
            self.parts
                .persister
                .append_user(&agent_id, thread_id, user_msg),
        )
        .await;

        let mut messages = history;
        messages.push(Message::user(user_msg));

        // (tool_name, input_json) → consecutive identical failures.
        let mut failure_counts: HashMap<(String, String), u32> = HashMap::new();

        for iteration in 0..MAX_ITERATIONS {
            if self.parts.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let req = ChatRequest {
                model: self.parts.model.clone(),
                messages: messages.clone(),
                system_prompt: self.parts.agent.system_prompt.clone(),
                tools: self.parts.tools.clone(),
                max_tokens: self.parts.agent.max_tokens,
                temperature: self.parts.temperature,
                thread_id: Some(thread_id.to_string()),
            };

            tracing::debug!(agent_id = %agent_id, iteration, "model call");
            let content = match tx {
                None => self.parts.client.complete(req).await?.content,
                Some(tx) => self.stream_one_turn(req, tx).await?,
            };

            // The assistant message carries whatever blocks the model
            // produced, verbatim.
            messages.push(Message {
                role: Role::Assistant,
                content: content.clone(),
            });

            // Collect tool invocations, deduplicated by id.
            let mut seen_ids: HashSet<&str> = HashSet::new();
            let mut tool_uses: Vec<(&str, &str, &serde_json::Value)> = Vec::new();
            let mut text_acc = String::new();
            for block in &content {
                match block {
                    ContentBlock::Text { text } => text_acc.push_str(text),
                    ContentBlock::ToolUse { id, name, input } => {
                        if seen_ids.insert(id.as_str()) {
                            tool_uses.push((id.as_str(), name.as_str(), input));
                        }
                    }
                    ContentBlock::ToolResult { .. } => {}
                }
            }

            if tool_uses.is_empty() {
                let text = text_acc.trim().to_string();
                if text.is_empty() {
                    if tx.is_some() {
                        return Err(Error::EmptyResponse);
                    }
                    return Ok(text);
                }
                let final_text = self.maybe_summarize(&text).await;
                self.persist(
                    self.parts
                        .persister
                        .append_assistant(&agent_id, thread_id, &final_text),
                )
                .await;
                return Ok(final_text);
            }

            // Dispatch tools in order; results go back as one user message.
            let mut result_blocks: Vec<ContentBlock> = Vec::new();
            for (id, name, input) in tool_uses {
                if self.parts.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let input_json = input.to_string();
                self.persist(self.parts.persister.append_tool_call(
                    &agent_id, thread_id, id, name, input,
                ))
                .await;
                if let Some(tx) = tx {
                    let _ = tx
                        .send(TurnEvent::ToolCallStarted {
                            call_id: id.to_string(),
                            tool_name: name.to_string(),
                            arguments: input.clone(),
                        })
                        .await;
                }

                let dispatched = tokio::select! {
                    biased;
                    _ = self.parts.cancel.cancelled() => return Err(Error::Cancelled),
                    result = self.parts.executor.handle(name, &agent_id, &input_json) => result,
                };
                let (result_content, is_error) = match dispatched {
                    Ok(value) => (value.to_string(), false),
                    Err(e) => (
                        serde_json::json!({ "error": e.to_string() }).to_string(),
                        true,
                    ),
                };
                // Oversized results are shrunk whether or not the tool failed.
                let result_content = self.maybe_summarize(&result_content).await;

                if is_error {
                    let count = failure_counts
                        .entry((name.to_string(), input_json.clone()))
                        .or_insert(0);
                    *count += 1;
                    if *count >= MAX_IDENTICAL_TOOL_FAILURES {
                        self.persist(self.parts.persister.append_tool_result(
                            &agent_id,
                            thread_id,
                            id,
                            name,
                            &result_content,
                            true,
                        ))
                        .await;
                        return Err(Error::ToolRepeatedFailure {
                            tool: name.to_string(),
                            count: *count,
                        });
                    }
                }

                self.persist(self.parts.persister.append_tool_result(
                    &agent_id,
                    thread_id,
                    id,
                    name,
                    &result_content,
                    is_error,
                ))
                .await;
                if let Some(tx) = tx {
                    let _ = tx
                        .send(TurnEvent::ToolCallFinished {
                            call_id: id.to_string(),
                            tool_name: name.to_string(),
                            content: result_content.clone(),
                            is_error,
                        })
                        .await;
                }

                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: id.to_string(),
                    content: result_content,
                    is_error,
                });
            }

            messages.push(Message::tool_results(result_blocks));
        }

        Err(Error::IterationLimitExceeded(MAX_ITERATIONS))
    }

    // ── Streaming accumulation ─────────────────────────────────────

    /// Consume one model stream, forwarding text deltas and assembling
    /// the final content blocks: text accumulates per block, tool-input
    /// JSON buffers per tool and parses at stream end.
    async fn stream_one_turn(
        &self,
        req: ChatRequest,
        tx: &mpsc::Sender<TurnEvent>,
    ) -> Result<Vec<ContentBlock>> {
        enum BlockAcc {
            Text(String),
            Tool {
                id: String,
                name: String,
                input_buf: String,
            },
        }

        let mut stream = self.parts.client.complete_stream(req).await?;
        let mut blocks: BTreeMap<u32, BlockAcc> = BTreeMap::new();

        loop {
            let item = tokio::select! {
                biased;
                _ = self.parts.cancel.cancelled() => return Err(Error::Cancelled),
                item = stream.next() => item,
            };
            let Some(item) = item else { break };

            match item? {
                StreamEvent::Start { .. } => {}
                StreamEvent::ContentBlock { index, tool_use } => {
                    let acc = match tool_use {
                        Some(tu) => BlockAcc::Tool {
                            id: tu.id,
                            name: tu.name,
                            input_buf: String::new(),
                        },
                        None => BlockAcc::Text(String::new()),
                    };
                    blocks.insert(index, acc);
                }
                StreamEvent::ContentDelta { index, delta } => match delta {
                    Delta::Text { text } => {
                        match blocks
                            .entry(index)
                            .or_insert_with(|| BlockAcc::Text(String::new()))
                        {
                            BlockAcc::Text(buf) => buf.push_str(&text),
                            BlockAcc::Tool { .. } => {
                                tracing::warn!(index, "text delta for a tool block, dropped");
                                continue;
                            }
                        }
                        let _ = tx.send(TurnEvent::AssistantDelta { text }).await;
                    }
                    Delta::ToolInput { partial_json } => match blocks.get_mut(&index) {
                        Some(BlockAcc::Tool { input_buf, .. }) => {
                            input_buf.push_str(&partial_json);
                        }
                        _ => {
                            tracing::warn!(index, "tool-input delta for unknown block, dropped");
                        }
                    },
                },
                StreamEvent::MessageDelta { .. } => {}
                StreamEvent::Stop => break,
            }
        }

        // Finalize in block-index order.
        let mut content = Vec::with_capacity(blocks.len());
        for (_, acc) in blocks {
            match acc {
                BlockAcc::Text(text) => {
                    if !text.is_empty() {
                        content.push(ContentBlock::Text { text });
                    }
                }
                BlockAcc::Tool {
                    id,
                    name,
                    input_buf,
                } => {
                    let input = if input_buf.trim().is_empty() {
                        serde_json::Value::Object(Default::default())
                    } else {
                        match serde_json::from_str(&input_buf) {
                            Ok(v) => v,
                            Err(e) => {
                                tracing::warn!(
                                    tool_name = %name,
                                    call_id = %id,
                                    error = %e,
                                    "tool input did not parse as JSON, substituting {{}}"
                                );
                                serde_json::Value::Object(Default::default())
                            }
                        }
                    };
                    content.push(ContentBlock::ToolUse { id, name, input });
                }
            }
        }
        Ok(content)
    }

    // ── Helpers ────────────────────────────────────────────────────

    /// Replace oversized text with a summary when a summarizer is
    /// configured. Summarizer failures fall back to the original text.
    async fn maybe_summarize(&self, text: &str) -> String {
        let Some(summarizer) = &self.parts.summarizer else {
            return text.to_string();
        };
        if !exceeds_thresholds(text, &self.parts.thresholds) {
            return text.to_string();
        }
        match summarizer.summarize_text(text).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!(
                    agent_id = %self.agent_id(),
                    error = %e,
                    "summarization failed, keeping original text"
                );
                text.to_string()
            }
        }
    }

    /// Persistence failures degrade to warnings; losing a transcript line
    /// must not kill the turn.
    async fn persist(&self, fut: impl std::future::Future<Output = Result<()>>) {
        if let Err(e) = fut.await {
            tracing::warn!(agent_id = %self.agent_id(), error = %e, "persist failed");
        }
    }
}

fn exceeds_thresholds(text: &str, t: &SummarizerConfig) -> bool {
    text.len() > t.max_chars
        || text.lines().count() > t.max_lines
        || text.matches('\n').count() > t.max_line_breaks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_trigger_on_any_dimension() {
        let t = SummarizerConfig {
            max_chars: 10,
            max_lines: 3,
            max_line_breaks: 2,
        };
        assert!(!exceeds_thresholds("short", &t));
        assert!(exceeds_thresholds("longer than ten", &t));
        assert!(exceeds_thresholds("a\nb\nc\nd", &t));
        assert!(!exceeds_thresholds("a\nb", &t));
    }
}
