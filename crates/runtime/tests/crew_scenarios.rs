//! End-to-end turn scenarios through a full crew over the scripted mock
//! client: scheduling, tool dispatch, failure caps, rate-limit
//! rescheduling, 413 compression, and startup bootstrap.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use common::{agent, config_with_agents, registry, FixedSummarizer, MockFactory, ScriptedExecutor};
use crewd_domain::message::{ContentBlock, Message};
use crewd_domain::Error;
use crewd_providers::mock::MockClient;
use crewd_providers::ChatResponse;
use crewd_runtime::{Crew, MAX_ITERATIONS};
use crewd_store::{AgentStatus, StateStore, StatsStore, ThreadTranscript};

struct Harness {
    crew: Crew,
    mock: Arc<MockClient>,
    executor: Arc<ScriptedExecutor>,
    state: Arc<StateStore>,
    stats: Arc<StatsStore>,
    transcript: Arc<ThreadTranscript>,
    _dir: tempfile::TempDir,
}

fn harness(agents: Vec<crewd_domain::config::AgentConfig>, with_summarizer: bool) -> Harness {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateStore::new(dir.path()));
    let stats = Arc::new(StatsStore::new(dir.path()));
    let transcript = Arc::new(ThreadTranscript::new(dir.path()));
    let mock = Arc::new(MockClient::new());
    let executor = Arc::new(ScriptedExecutor::new());

    let summarizer: Option<Arc<dyn crewd_domain::interfaces::Summarizer>> = if with_summarizer {
        Some(Arc::new(FixedSummarizer))
    } else {
        None
    };

    let crew = Crew::new(
        &config_with_agents(agents),
        registry(),
        Arc::new(MockFactory::new(mock.clone())),
        executor.clone(),
        state.clone(),
        stats.clone(),
        transcript.clone(),
        summarizer,
    );

    Harness {
        crew,
        mock,
        executor,
        state,
        stats,
        transcript,
        _dir: dir,
    }
}

// ── Scenario: happy path ────────────────────────────────────────────

#[tokio::test]
async fn happy_path_returns_text_and_schedules_next_wake() {
    let h = harness(vec![agent("pinger", Some("15m"))], false);
    h.mock.push_text("pong");

    let before = Utc::now().timestamp();
    let text = h.crew.run("pinger", "main", "ping", vec![]).await.unwrap();
    assert_eq!(text, "pong");

    assert_eq!(h.state.get_state("pinger"), AgentStatus::WaitingExternal);
    let wake = h.state.get_next_wake("pinger").expect("wake must be set");
    assert!(wake >= before + 890 && wake <= before + 910, "wake = {wake}");

    let stats = h.stats.get("pinger");
    assert_eq!(stats.execution_count, 1);
    assert_eq!(stats.failure_count, 0);
}

#[tokio::test]
async fn unscheduled_agent_returns_to_idle() {
    let h = harness(vec![agent("oneshot", None)], false);
    h.mock.push_text("done");

    h.crew.run("oneshot", "main", "go", vec![]).await.unwrap();
    assert_eq!(h.state.get_state("oneshot"), AgentStatus::Idle);
    assert!(h.state.get_next_wake("oneshot").is_none());
}

// ── Scenario: single tool call ──────────────────────────────────────

#[tokio::test]
async fn single_tool_call_round_trip() -> anyhow::Result<()> {
    let h = harness(vec![agent("worker", None)], false);
    h.mock
        .push_tool_use("t1", "echo", serde_json::json!({"x": 42}));
    h.mock.push_text("done");
    h.executor.push_ok(serde_json::json!({"y": 42}));

    let text = h.crew.run("worker", "main", "run it", vec![]).await?;
    assert_eq!(text, "done");

    // Executor saw the marshalled input.
    let calls = h.executor.calls.lock().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "echo");
    assert_eq!(calls[0].1, "worker");
    assert_eq!(calls[0].2, "{\"x\":42}");

    // Second model call carries assistant tool_use + user tool_result.
    let reqs = h.mock.calls();
    assert_eq!(reqs.len(), 2);
    let followup = &reqs[1].messages;
    let assistant = &followup[followup.len() - 2];
    assert!(matches!(
        assistant.content[0],
        ContentBlock::ToolUse { .. }
    ));
    let results = &followup[followup.len() - 1];
    match &results.content[0] {
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            assert_eq!(tool_use_id, "t1");
            assert_eq!(content, "{\"y\":42}");
            assert!(!is_error);
        }
        other => panic!("unexpected block: {other:?}"),
    }

    // Persisted order: user, assistant(tool call), tool, assistant.
    let lines = h.transcript.read("worker", "main")?;
    let roles: Vec<&str> = lines.iter().map(|l| l.role.as_str()).collect();
    assert_eq!(roles, vec!["user", "assistant", "tool", "assistant"]);

    assert_eq!(h.stats.get("worker").failure_count, 0);
    Ok(())
}

#[tokio::test]
async fn failing_tool_is_fed_back_as_error_result() {
    let h = harness(vec![agent("worker", None)], false);
    h.mock
        .push_tool_use("t1", "echo", serde_json::json!({"x": 1}));
    h.mock.push_text("noted");
    h.executor.push_err("echo exploded");

    let text = h.crew.run("worker", "main", "go", vec![]).await.unwrap();
    assert_eq!(text, "noted");

    let reqs = h.mock.calls();
    let results = &reqs[1].messages.last().unwrap().content[0];
    match results {
        ContentBlock::ToolResult {
            content, is_error, ..
        } => {
            assert!(*is_error);
            assert!(content.contains("echo exploded"));
            assert!(content.starts_with("{\"error\":"));
        }
        other => panic!("unexpected block: {other:?}"),
    }
    // A single tool failure is not a turn failure.
    assert_eq!(h.stats.get("worker").failure_count, 0);
}

#[tokio::test]
async fn oversized_error_result_is_summarized_too() {
    let h = harness(vec![agent("worker", None)], true);
    h.mock
        .push_tool_use("t1", "echo", serde_json::json!({"x": 1}));
    h.mock.push_text("noted");
    // Well past the 4000-char summarization threshold.
    h.executor.push_err(&"stack frame\n".repeat(500));

    let text = h.crew.run("worker", "main", "go", vec![]).await.unwrap();
    assert_eq!(text, "noted");

    let reqs = h.mock.calls();
    match &reqs[1].messages.last().unwrap().content[0] {
        ContentBlock::ToolResult {
            content, is_error, ..
        } => {
            assert!(*is_error);
            assert_eq!(content, "condensed");
        }
        other => panic!("unexpected block: {other:?}"),
    }
}

// ── Scenario: repeated failing tool ─────────────────────────────────

#[tokio::test]
async fn identical_tool_failures_abort_after_three() {
    let h = harness(vec![agent("worker", Some("30m"))], false);
    for i in 1..=3 {
        h.mock
            .push_tool_use(&format!("t{i}"), "echo", serde_json::json!({}));
        h.executor.push_err("bad");
    }

    let err = h.crew.run("worker", "main", "go", vec![]).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ToolRepeatedFailure { count: 3, .. }
    ));

    assert_eq!(h.executor.call_count(), 3);
    let stats = h.stats.get("worker");
    assert_eq!(stats.failure_count, 1);
    assert!(stats
        .last_failure_message
        .as_deref()
        .unwrap()
        .contains("tool_repeated_failure"));

    // Scheduled agent still lands on its next wake.
    assert_eq!(h.state.get_state("worker"), AgentStatus::WaitingExternal);
    assert!(h.state.get_next_wake("worker").is_some());
}

#[tokio::test]
async fn distinct_inputs_do_not_share_the_failure_budget() {
    let h = harness(vec![agent("worker", None)], false);
    for i in 1..=3 {
        h.mock
            .push_tool_use(&format!("t{i}"), "echo", serde_json::json!({"x": i}));
        h.executor.push_err("bad");
    }
    h.mock.push_text("survived");

    let text = h.crew.run("worker", "main", "go", vec![]).await.unwrap();
    assert_eq!(text, "survived");
    assert_eq!(h.stats.get("worker").failure_count, 0);
}

// ── Scenario: rate-limit reschedule ─────────────────────────────────

#[tokio::test(start_paused = true)]
async fn exhausted_rate_limits_park_scheduled_agent() {
    let h = harness(vec![agent("limited", Some("15m"))], false);
    for _ in 0..8 {
        h.mock.push_error(Error::RateLimit {
            message: "HTTP 429".into(),
            retry_after: Some(Duration::from_secs(30)),
        });
    }

    let before = Utc::now().timestamp();
    let err = h.crew.run("limited", "main", "go", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("will retry at scheduled time"));

    assert_eq!(h.state.get_state("limited"), AgentStatus::WaitingExternal);
    let wake = h.state.get_next_wake("limited").expect("wake must be set");
    assert!(wake > before, "wake must be in the future");

    // Not counted as success or user-visible failure.
    let stats = h.stats.get("limited");
    assert_eq!(stats.execution_count, 0);
    assert_eq!(stats.failure_count, 0);

    // The initial call plus 5 retries, then exhaustion.
    assert_eq!(h.mock.call_count(), 6);
}

// ── Scenario: auto-compression on 413 ───────────────────────────────

#[tokio::test]
async fn oversize_request_is_compressed_and_retried() -> anyhow::Result<()> {
    let h = harness(vec![agent("bigctx", None)], true);
    h.mock
        .push_error(Error::RequestTooLarge("HTTP 413".into()));
    h.mock.push_text("ok");

    // Half a megabyte of history: under the proactive threshold.
    let history = vec![Message::user("x".repeat(500_000))];
    let text = h.crew.run("bigctx", "main", "go", history).await?;
    assert_eq!(text, "ok");

    let reqs = h.mock.calls();
    assert_eq!(reqs.len(), 2);
    // First attempt went out with the full history.
    assert_eq!(reqs[0].messages.len(), 2);
    // Retry carries only the collapsed summary message.
    assert_eq!(reqs[1].messages.len(), 1);
    assert!(reqs[1].messages[0]
        .text()
        .starts_with("Previous conversation summary: "));

    // The compression marker landed in the thread transcript.
    let lines = h.transcript.read("bigctx", "main")?;
    let marker = lines
        .iter()
        .find(|l| l.role == "system")
        .expect("compress marker persisted");
    assert_eq!(marker.metadata.as_ref().unwrap()["marker"], "compress");

    assert_eq!(h.stats.get("bigctx").execution_count, 1);
    Ok(())
}

// ── Scenario: startup delay ─────────────────────────────────────────

#[tokio::test]
async fn startup_delay_beats_a_later_schedule() {
    let mut a = agent("delayed", Some("1h"));
    a.startup_delay = Some("5m".into());

    let before = Utc::now().timestamp();
    let h = harness(vec![a], false);

    assert_eq!(h.state.get_state("delayed"), AgentStatus::WaitingExternal);
    let wake = h.state.get_next_wake("delayed").expect("wake must be set");
    assert!(wake >= before + 290 && wake <= before + 310, "wake = {wake}");
}

#[tokio::test]
async fn fresh_scheduled_agent_waits_for_first_firing() {
    let before = Utc::now().timestamp();
    let h = harness(vec![agent("cron", Some("15m"))], false);

    assert_eq!(h.state.get_state("cron"), AgentStatus::WaitingExternal);
    let wake = h.state.get_next_wake("cron").unwrap();
    assert!(wake >= before + 890 && wake <= before + 910);
}

#[tokio::test]
async fn fresh_unscheduled_agent_starts_idle() {
    let h = harness(vec![agent("manual", None)], false);
    assert_eq!(h.state.get_state("manual"), AgentStatus::Idle);
}

#[tokio::test]
async fn existing_healthy_state_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateStore::new(dir.path()));
    // A wake well in the future survives re-initialization.
    let future = Utc::now().timestamp() + 10_000;
    state.set_state_with_wake("keeper", AgentStatus::WaitingExternal, Some(future));

    let mut a = agent("keeper", Some("1h"));
    a.startup_delay = Some("5m".into());

    let _crew = Crew::new(
        &config_with_agents(vec![a]),
        registry(),
        Arc::new(MockFactory::new(Arc::new(MockClient::new()))),
        Arc::new(ScriptedExecutor::new()),
        state.clone(),
        Arc::new(StatsStore::new(dir.path())),
        Arc::new(ThreadTranscript::new(dir.path())),
        None,
    );

    assert_eq!(state.get_next_wake("keeper"), Some(future));
}

#[tokio::test]
async fn stale_past_wake_gets_startup_delay_reapplied() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateStore::new(dir.path()));
    let past = Utc::now().timestamp() - 10_000;
    state.set_state_with_wake("stale", AgentStatus::WaitingExternal, Some(past));

    let mut a = agent("stale", Some("1h"));
    a.startup_delay = Some("5m".into());

    let before = Utc::now().timestamp();
    let _crew = Crew::new(
        &config_with_agents(vec![a]),
        registry(),
        Arc::new(MockFactory::new(Arc::new(MockClient::new()))),
        Arc::new(ScriptedExecutor::new()),
        state.clone(),
        Arc::new(StatsStore::new(dir.path())),
        Arc::new(ThreadTranscript::new(dir.path())),
        None,
    );

    let wake = state.get_next_wake("stale").unwrap();
    assert!(wake >= before + 290 && wake <= before + 310, "wake = {wake}");
}

// ── Loop bounds and dedup ───────────────────────────────────────────

#[tokio::test]
async fn iteration_limit_bounds_model_calls() {
    let h = harness(vec![agent("churner", None)], false);
    for i in 0..MAX_ITERATIONS {
        h.mock
            .push_tool_use(&format!("t{i}"), "echo", serde_json::json!({"x": i}));
    }

    let err = h.crew.run("churner", "main", "go", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::IterationLimitExceeded(20)));
    assert_eq!(h.mock.call_count(), MAX_ITERATIONS as usize);
    assert_eq!(h.stats.get("churner").failure_count, 1);
}

#[tokio::test]
async fn duplicate_tool_ids_are_dispatched_once() {
    let h = harness(vec![agent("worker", None)], false);
    h.mock.push_response(ChatResponse {
        content: vec![
            ContentBlock::ToolUse {
                id: "dup".into(),
                name: "echo".into(),
                input: serde_json::json!({"x": 1}),
            },
            ContentBlock::ToolUse {
                id: "dup".into(),
                name: "echo".into(),
                input: serde_json::json!({"x": 1}),
            },
        ],
        usage: None,
        stop_reason: Some("tool_use".into()),
    });
    h.mock.push_text("done");

    h.crew.run("worker", "main", "go", vec![]).await.unwrap();

    assert_eq!(h.executor.call_count(), 1);
    let reqs = h.mock.calls();
    let results = reqs[1].messages.last().unwrap();
    assert_eq!(results.content.len(), 1);
}

// ── Cancellation ────────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_run_counts_as_neither_success_nor_failure() {
    let h = harness(vec![agent("halted", Some("15m"))], false);
    h.crew.cancel_token().cancel();

    let err = h.crew.run("halted", "main", "go", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    let stats = h.stats.get("halted");
    assert_eq!(stats.execution_count, 0);
    assert_eq!(stats.failure_count, 0);

    // The finalizer still ran: never left as running.
    assert_eq!(h.state.get_state("halted"), AgentStatus::WaitingExternal);
}

// ── Crew surface ────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_agent_is_rejected() {
    let h = harness(vec![agent("known", None)], false);
    let err = h.crew.run("ghost", "main", "hi", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::AgentUnknown(_)));
}

#[tokio::test]
async fn disabled_agents_are_not_initialized() {
    let mut a = agent("muted", Some("15m"));
    a.disabled = true;
    let h = harness(vec![a, agent("active", None)], false);

    assert_eq!(h.crew.agent_ids(), vec!["active"]);
    assert!(matches!(
        h.crew.run("muted", "main", "hi", vec![]).await,
        Err(Error::AgentUnknown(_))
    ));
    // No state was seeded for the disabled agent.
    assert!(!h.state.exists("muted"));
}

#[tokio::test]
async fn invalid_schedule_is_an_init_error_not_a_panic() {
    let h = harness(vec![agent("broken", Some("whenever")), agent("fine", None)], false);
    assert_eq!(h.crew.agent_ids(), vec!["fine"]);
    assert_eq!(h.crew.init_errors().len(), 1);
    assert_eq!(h.crew.init_errors()[0].agent_id, "broken");
    assert!(h.crew.init_errors()[0].error.contains("invalid_schedule"));
}

#[tokio::test]
async fn agents_with_identical_bindings_share_one_client() {
    let h = harness(vec![agent("a", None), agent("b", None)], false);
    assert_eq!(h.crew.agent_ids().len(), 2);
    assert_eq!(h.crew.client_count(), 1);
}

#[tokio::test]
async fn different_models_get_distinct_clients() {
    let mut a = agent("a", None);
    a.llm_preferences = vec![serde_json::from_value(
        serde_json::json!({"provider": "anthropic", "model": "claude-sonnet-4"}),
    )
    .unwrap()];
    let mut b = agent("b", None);
    b.llm_preferences = vec![serde_json::from_value(
        serde_json::json!({"provider": "anthropic", "model": "claude-3-5-haiku"}),
    )
    .unwrap()];

    let h = harness(vec![a, b], false);
    assert_eq!(h.crew.client_count(), 2);
}
