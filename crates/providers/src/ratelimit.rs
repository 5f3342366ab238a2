//! Rate-limit handling: per-agent exponential backoff state, retry-after
//! extraction, and the middleware that decides between waiting in-process
//! and parking a scheduled agent on its durable wake time.

use std::collections::HashMap;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use parking_lot::Mutex;

use crewd_domain::cancel::CancelToken;
use crewd_domain::error::Error;
use crewd_store::{AgentStatus, StateStore};

use crate::middleware::{ErrorAction, Middleware};
use crate::traits::{ChatRequest, ChatResponse};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cap on any single backoff interval.
const MAX_INTERVAL: Duration = Duration::from_secs(300);

/// Cap on total time spent retrying one burst of rate limits.
const MAX_ELAPSED: Duration = Duration::from_secs(300);

/// Retries permitted per burst before the controller reports exhaustion.
const MAX_RETRIES: u32 = 5;

/// Wake delay used when an exhausted burst never saw a server-supplied
/// retry-after and produced no delay of its own.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry-after extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse a `Retry-After` header value: either delay-seconds or an
/// RFC-1123 HTTP date. Past dates and garbage yield `None`.
pub fn parse_retry_after_header(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = chrono::DateTime::parse_from_rfc2822(trimmed).ok()?;
    (when.with_timezone(&Utc) - Utc::now()).to_std().ok()
}

/// The server-supplied retry delay on an error, if any. Zero counts as
/// absent so a `Retry-After: 0` takes the default path.
pub fn server_retry_after(err: &Error) -> Option<Duration> {
    err.retry_after().filter(|d| !d.is_zero())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RateLimitController
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What to do about one rate-limit error.
#[derive(Debug)]
pub enum RetryDecision {
    /// Wait this long, then retry the request.
    RetryAfter(Duration),
    /// The retry budget for this burst is spent. `last_delay` is the final
    /// interval the backoff produced, for use as a reschedule horizon.
    Exhausted { last_delay: Option<Duration> },
}

struct AgentBackoff {
    eb: ExponentialBackoff,
    attempts: u32,
    last_delay: Option<Duration>,
}

/// Per-agent backoff state. Created on the first retry of a burst,
/// destroyed when a call succeeds (or when a burst exhausts, so the next
/// scheduled attempt starts with a fresh budget).
#[derive(Default)]
pub struct RateLimitController {
    backoffs: Mutex<HashMap<String, AgentBackoff>>,
}

impl RateLimitController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the next retry delay for an agent's current burst.
    ///
    /// `retry_after` is the server-supplied delay from the *first* error of
    /// the burst; it seeds the backoff's initial interval. Later calls in
    /// the same burst reuse the existing iterator.
    pub fn next_delay(&self, agent_id: &str, retry_after: Option<Duration>) -> RetryDecision {
        let mut map = self.backoffs.lock();
        let entry = map
            .entry(agent_id.to_string())
            .or_insert_with(|| new_backoff(retry_after));

        if entry.attempts >= MAX_RETRIES {
            let last = entry.last_delay;
            map.remove(agent_id);
            return RetryDecision::Exhausted { last_delay: last };
        }

        entry.attempts += 1;
        match entry.eb.next_backoff() {
            Some(delay) => {
                entry.last_delay = Some(delay);
                RetryDecision::RetryAfter(delay)
            }
            None => {
                // Elapsed-time cap reached.
                let last = entry.last_delay;
                map.remove(agent_id);
                RetryDecision::Exhausted { last_delay: last }
            }
        }
    }

    /// Forget an agent's backoff state after a successful call.
    pub fn reset(&self, agent_id: &str) {
        self.backoffs.lock().remove(agent_id);
    }

    /// Whether an agent currently has an active burst.
    pub fn has_backoff(&self, agent_id: &str) -> bool {
        self.backoffs.lock().contains_key(agent_id)
    }
}

fn new_backoff(retry_after: Option<Duration>) -> AgentBackoff {
    let mut eb = match retry_after {
        // Server told us when to come back: start there, grow gently.
        Some(initial) => ExponentialBackoff {
            initial_interval: initial,
            multiplier: 1.5,
            randomization_factor: 0.1,
            ..ExponentialBackoff::default()
        },
        // No hint: start at 1s and double.
        None => ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            randomization_factor: 0.2,
            ..ExponentialBackoff::default()
        },
    };
    eb.max_interval = MAX_INTERVAL;
    eb.max_elapsed_time = Some(MAX_ELAPSED);
    // `reset` copies initial_interval into current_interval and restarts
    // the elapsed clock; the configured initial interval survives it.
    eb.reset();
    AgentBackoff {
        eb,
        attempts: 0,
        last_delay: None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RateLimitMiddleware
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-agent middleware layering rate-limit recovery over any client.
///
/// While retries remain it sleeps (observing the cancel token) and asks
/// the chain to re-issue the request. On exhaustion a scheduled agent is
/// parked as `waiting_external` with `next_wake = now + last_delay` and
/// the distinguished `RetryScheduled` error is raised; a one-shot agent
/// gets `RateLimitExhausted`.
pub struct RateLimitMiddleware {
    agent_id: String,
    controller: std::sync::Arc<RateLimitController>,
    state: std::sync::Arc<StateStore>,
    /// Whether the agent has a schedule (and thus a durable wake to park on).
    scheduled: bool,
    cancel: CancelToken,
}

impl RateLimitMiddleware {
    pub fn new(
        agent_id: impl Into<String>,
        controller: std::sync::Arc<RateLimitController>,
        state: std::sync::Arc<StateStore>,
        scheduled: bool,
        cancel: CancelToken,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            controller,
            state,
            scheduled,
            cancel,
        }
    }
}

#[async_trait::async_trait]
impl Middleware for RateLimitMiddleware {
    async fn after_response(&self, resp: ChatResponse) -> crewd_domain::Result<ChatResponse> {
        // A successful call ends the burst.
        self.controller.reset(&self.agent_id);
        Ok(resp)
    }

    async fn on_error(&self, _req: &ChatRequest, err: Error) -> ErrorAction {
        if !err.is_rate_limit() {
            return ErrorAction::Propagate(err);
        }

        match self
            .controller
            .next_delay(&self.agent_id, server_retry_after(&err))
        {
            RetryDecision::RetryAfter(delay) => {
                tracing::debug!(
                    agent_id = %self.agent_id,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited, waiting before retry"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => ErrorAction::Retry { request: None },
                    _ = self.cancel.cancelled() => ErrorAction::Propagate(Error::Cancelled),
                }
            }
            RetryDecision::Exhausted { last_delay } => {
                if self.scheduled {
                    let delay = last_delay.unwrap_or(DEFAULT_RETRY_AFTER);
                    let wake_at = Utc::now().timestamp() + delay.as_secs() as i64;
                    self.state.set_state_with_wake(
                        &self.agent_id,
                        AgentStatus::WaitingExternal,
                        Some(wake_at),
                    );
                    tracing::warn!(
                        agent_id = %self.agent_id,
                        wake_at,
                        "rate-limit retries exhausted, rescheduled"
                    );
                    ErrorAction::Propagate(Error::RetryScheduled {
                        agent_id: self.agent_id.clone(),
                        wake_at,
                    })
                } else {
                    ErrorAction::Propagate(Error::RateLimitExhausted)
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
