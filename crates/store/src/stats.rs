//! Agent stats store — monotonic execution counters plus last-event
//! markers, persisted to `<data>/agent_stats.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Durable counters for one agent. Counts only go up; the `last_*` fields
/// are overwritten on each event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStats {
    #[serde(default)]
    pub execution_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub wakeup_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_message: Option<String>,
}

pub struct StatsStore {
    inner: RwLock<HashMap<String, AgentStats>>,
    persist_path: PathBuf,
}

impl StatsStore {
    pub fn new(data_dir: &Path) -> Self {
        let persist_path = data_dir.join("agent_stats.json");
        let inner = RwLock::new(load_map(&persist_path));
        Self {
            inner,
            persist_path,
        }
    }

    /// Stats for an agent; zeros for one that was never seen.
    pub fn get(&self, agent_id: &str) -> AgentStats {
        self.inner.read().get(agent_id).cloned().unwrap_or_default()
    }

    /// Record one successfully resolved turn.
    pub fn record_execution(&self, agent_id: &str) {
        self.update(agent_id, |s| {
            s.execution_count += 1;
            s.last_execution = Some(Utc::now().timestamp());
        });
    }

    /// Record one failed turn with its error message.
    pub fn record_failure(&self, agent_id: &str, message: &str) {
        self.update(agent_id, |s| {
            s.failure_count += 1;
            s.last_failure = Some(Utc::now().timestamp());
            s.last_failure_message = Some(message.to_string());
        });
    }

    /// Record one scheduled wake dispatch.
    pub fn record_wakeup(&self, agent_id: &str) {
        self.update(agent_id, |s| {
            s.wakeup_count += 1;
        });
    }

    fn update(&self, agent_id: &str, f: impl FnOnce(&mut AgentStats)) {
        let mut map = self.inner.write();
        f(map.entry(agent_id.to_string()).or_default());
        let snapshot = map.clone();
        drop(map);
        self.persist(&snapshot);
    }

    fn persist(&self, snapshot: &HashMap<String, AgentStats>) {
        match serde_json::to_string_pretty(snapshot) {
            Ok(json) => {
                if let Some(parent) = self.persist_path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(&self.persist_path, json) {
                    tracing::warn!(error = %e, "failed to persist agent stats");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize agent stats"),
        }
    }
}

fn load_map(path: &Path) -> HashMap<String, AgentStats> {
    match std::fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(error = %e, "agent stats file is corrupt, starting empty");
                HashMap::new()
            }
        },
        Err(_) => HashMap::new(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
