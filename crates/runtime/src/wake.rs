//! Wake scheduler — the tick loop that dispatches agents whose durable
//! wake time is due.
//!
//! Every tick it asks the state store for ready agents, counts the
//! wakeup, and spawns one run per agent with its configured wake prompt.
//! A single-flight guard keeps runs for the same agent from overlapping
//! across ticks; run outcomes are recorded by the runner's own
//! finalizer, so the loop only logs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use crewd_domain::cancel::CancelToken;

use crate::crew::Crew;

/// Thread id under which scheduled wakes converse.
const SCHEDULED_THREAD: &str = "scheduled";

pub struct WakeScheduler {
    crew: Arc<Crew>,
    tick_interval: Duration,
    cancel: CancelToken,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl WakeScheduler {
    pub fn new(crew: Arc<Crew>, tick_interval: Duration) -> Self {
        Self {
            crew,
            tick_interval,
            cancel: CancelToken::new(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// A token that stops the loop when cancelled.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the tick loop until cancelled.
    pub async fn run(&self) {
        tracing::info!(
            interval_secs = self.tick_interval.as_secs(),
            "wake scheduler started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.tick_interval) => {}
                _ = self.cancel.cancelled() => {
                    tracing::info!("wake scheduler stopped");
                    return;
                }
            }
            self.tick().await;
        }
    }

    /// Evaluate due agents once and spawn their runs.
    pub async fn tick(&self) {
        let now = Utc::now().timestamp();
        for agent_id in self.crew.ready_agents(now) {
            // Single-flight: a run already dispatched for this agent may
            // still be in progress.
            if !self.in_flight.lock().insert(agent_id.clone()) {
                tracing::debug!(agent_id = %agent_id, "run still in flight, skipping wake");
                continue;
            }

            let Some(prompt) = self.crew.wake_prompt(&agent_id) else {
                // Due in the store but not initialized here (e.g. it was
                // removed from config). Leave it alone.
                tracing::warn!(agent_id = %agent_id, "due agent is not initialized");
                self.in_flight.lock().remove(&agent_id);
                continue;
            };

            self.crew.stats().record_wakeup(&agent_id);
            tracing::info!(agent_id = %agent_id, "dispatching scheduled wake");

            let crew = self.crew.clone();
            let in_flight = self.in_flight.clone();
            tokio::spawn(async move {
                let result = crew
                    .run(&agent_id, SCHEDULED_THREAD, &prompt, Vec::new())
                    .await;
                match result {
                    Ok(_) => {
                        tracing::debug!(agent_id = %agent_id, "scheduled run completed");
                    }
                    Err(e) if e.is_retry_scheduled() => {
                        tracing::info!(agent_id = %agent_id, "run rate limited, rescheduled");
                    }
                    Err(e) => {
                        // Already recorded in stats by the runner.
                        tracing::warn!(agent_id = %agent_id, error = %e, "scheduled run failed");
                    }
                }
                in_flight.lock().remove(&agent_id);
            });
        }
    }
}
