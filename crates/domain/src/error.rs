//! Shared error type used across all crewd crates, plus the transport-error
//! classification helpers the rate-limit machinery relies on.

use std::time::Duration;

/// Shared error type used across all crewd crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    /// Typed rate-limit error. `retry_after` is filled by adapters from the
    /// `Retry-After` response header when the backend supplied one.
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Typed request-too-large (413-class) error.
    #[error("request too large: {0}")]
    RequestTooLarge(String),

    /// A one-shot call ran out of rate-limit retries.
    #[error("rate_limit_exhausted")]
    RateLimitExhausted,

    /// A scheduled agent ran out of rate-limit retries and was parked on its
    /// durable wake time instead. Callers match on the variant (or on the
    /// phrase in the message) and do not count this as a failure.
    #[error("agent '{agent_id}' will retry at scheduled time (wake at {wake_at})")]
    RetryScheduled { agent_id: String, wake_at: i64 },

    #[error("invalid_schedule: {0}")]
    InvalidSchedule(String),

    /// A streaming turn ended with no text and no tool calls.
    #[error("empty_response: model produced no text and no tool calls")]
    EmptyResponse,

    #[error("iteration_limit_exceeded: tool loop exceeded {0} iterations")]
    IterationLimitExceeded(u32),

    #[error("tool_repeated_failure: tool '{tool}' failed {count} times with identical input")]
    ToolRepeatedFailure { tool: String, count: u32 },

    #[error("agent_unknown: {0}")]
    AgentUnknown(String),

    /// Neither success nor failure; the caller's cancel token fired.
    #[error("cancelled")]
    Cancelled,

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Message substrings that mark a rate-limit error when the backend failed
/// to produce a typed one. The typed check always runs first; this list is
/// a fallback for adapters that surface raw HTTP bodies.
const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "rate_limit",
    "rate limit",
    "Too Many Requests",
    "Rate limit exceeded",
];

/// Message substrings that mark a request-too-large error.
const TOO_LARGE_MARKERS: &[&str] = &[
    "413",
    "request_too_large",
    "Request Entity Too Large",
    "payload too large",
];

impl Error {
    /// Whether this error should be treated as a rate limit. Typed variants
    /// win; the substring scan covers untyped provider/HTTP errors.
    pub fn is_rate_limit(&self) -> bool {
        if matches!(self, Error::RateLimit { .. }) {
            return true;
        }
        let msg = self.to_string();
        RATE_LIMIT_MARKERS.iter().any(|m| msg.contains(m))
    }

    /// Whether this error is a request-too-large (413-class) error.
    pub fn is_request_too_large(&self) -> bool {
        if matches!(self, Error::RequestTooLarge(_)) {
            return true;
        }
        let msg = self.to_string();
        TOO_LARGE_MARKERS.iter().any(|m| msg.contains(m))
    }

    /// The server-requested retry delay, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether this error represents a rate-limited agent parked on its
    /// scheduled wake time.
    pub fn is_retry_scheduled(&self) -> bool {
        matches!(self, Error::RetryScheduled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_rate_limit_is_classified() {
        let err = Error::RateLimit {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert!(err.is_rate_limit());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn string_fallback_classifies_rate_limits() {
        for msg in [
            "HTTP 429 - slow down",
            "openai: rate_limit_exceeded",
            "hit the rate limit, sorry",
            "Too Many Requests",
            "Rate limit exceeded for model",
        ] {
            let err = Error::Provider {
                provider: "p".into(),
                message: msg.into(),
            };
            assert!(err.is_rate_limit(), "expected rate limit: {msg}");
        }
    }

    #[test]
    fn string_fallback_classifies_too_large() {
        for msg in [
            "HTTP 413 - nope",
            "request_too_large",
            "Request Entity Too Large",
            "payload too large for model",
        ] {
            let err = Error::Http(msg.into());
            assert!(err.is_request_too_large(), "expected too large: {msg}");
        }
    }

    #[test]
    fn unrelated_errors_are_not_classified() {
        let err = Error::Timeout("provider timed out after 20000ms".into());
        assert!(!err.is_rate_limit());
        assert!(!err.is_request_too_large());
        assert!(err.retry_after().is_none());
    }

    #[test]
    fn retry_scheduled_message_contains_phrase() {
        let err = Error::RetryScheduled {
            agent_id: "digest".into(),
            wake_at: 1_700_000_000,
        };
        assert!(err.is_retry_scheduled());
        assert!(err.to_string().contains("will retry at scheduled time"));
    }

    #[test]
    fn retry_after_absent_on_untyped_errors() {
        let err = Error::Http("HTTP 429".into());
        assert!(err.is_rate_limit());
        assert!(err.retry_after().is_none());
    }
}
