//! Agent state store — the durable per-agent state machine record.
//!
//! States are persisted to `<data>/agent_states.json`. Every write stamps
//! `updated_at`; `next_wake` is meaningful only in `waiting_external` and
//! is cleared by plain state transitions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    WaitingHuman,
    WaitingExternal,
    Sleeping,
}

/// Durable state record, one per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub state: AgentStatus,
    /// Unix seconds of the last write.
    pub updated_at: i64,
    /// Unix seconds of the next scheduled wake. Only meaningful while
    /// `state == WaitingExternal`; readers must treat it as absent
    /// otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_wake: Option<i64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// StateStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct StateStore {
    inner: RwLock<HashMap<String, AgentState>>,
    persist_path: PathBuf,
}

impl StateStore {
    pub fn new(data_dir: &Path) -> Self {
        let persist_path = data_dir.join("agent_states.json");
        let inner = RwLock::new(load_map(&persist_path));
        Self {
            inner,
            persist_path,
        }
    }

    pub fn exists(&self, agent_id: &str) -> bool {
        self.inner.read().contains_key(agent_id)
    }

    /// Current state. An unseen agent reads as `Idle`, never an error.
    pub fn get_state(&self, agent_id: &str) -> AgentStatus {
        self.inner
            .read()
            .get(agent_id)
            .map(|r| r.state)
            .unwrap_or(AgentStatus::Idle)
    }

    /// Full record, when one exists.
    pub fn get(&self, agent_id: &str) -> Option<AgentState> {
        self.inner.read().get(agent_id).cloned()
    }

    /// Atomic upsert of the state. Clears any pending `next_wake`.
    pub fn set_state(&self, agent_id: &str, state: AgentStatus) {
        self.upsert(agent_id, state, None);
    }

    /// Atomic upsert of state and wake time together.
    pub fn set_state_with_wake(
        &self,
        agent_id: &str,
        state: AgentStatus,
        next_wake: Option<i64>,
    ) {
        self.upsert(agent_id, state, next_wake);
    }

    /// Update only the wake time; the state itself is unchanged.
    pub fn set_next_wake(&self, agent_id: &str, next_wake: i64) {
        let mut map = self.inner.write();
        let entry = map.entry(agent_id.to_string()).or_insert(AgentState {
            state: AgentStatus::Idle,
            updated_at: 0,
            next_wake: None,
        });
        entry.next_wake = Some(next_wake);
        entry.updated_at = Utc::now().timestamp();
        let snapshot = map.clone();
        drop(map);
        self.persist(&snapshot);
    }

    pub fn get_next_wake(&self, agent_id: &str) -> Option<i64> {
        self.inner.read().get(agent_id).and_then(|r| r.next_wake)
    }

    /// Agent ids currently in `state`, sorted for deterministic iteration.
    pub fn list_by_state(&self, state: AgentStatus) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .read()
            .iter()
            .filter(|(_, r)| r.state == state)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Agents whose scheduled wake is due: `waiting_external` with a
    /// `next_wake` at or before `now`.
    pub fn list_ready(&self, now: i64) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .read()
            .iter()
            .filter(|(_, r)| {
                r.state == AgentStatus::WaitingExternal
                    && r.next_wake.is_some_and(|w| w <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn upsert(&self, agent_id: &str, state: AgentStatus, next_wake: Option<i64>) {
        let mut map = self.inner.write();
        map.insert(
            agent_id.to_string(),
            AgentState {
                state,
                updated_at: Utc::now().timestamp(),
                next_wake,
            },
        );
        let snapshot = map.clone();
        drop(map);
        self.persist(&snapshot);
    }

    fn persist(&self, snapshot: &HashMap<String, AgentState>) {
        match serde_json::to_string_pretty(snapshot) {
            Ok(json) => {
                if let Some(parent) = self.persist_path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(&self.persist_path, json) {
                    tracing::warn!(error = %e, "failed to persist agent states");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize agent states"),
        }
    }
}

fn load_map(path: &Path) -> HashMap<String, AgentState> {
    match std::fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str::<HashMap<String, AgentState>>(&data) {
            Ok(map) => {
                tracing::info!(count = map.len(), "loaded agent states from disk");
                map
            }
            Err(e) => {
                tracing::warn!(error = %e, "agent state file is corrupt, starting empty");
                HashMap::new()
            }
        },
        Err(_) => HashMap::new(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
