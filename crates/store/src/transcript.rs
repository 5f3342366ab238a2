//! Append-only JSONL thread transcripts.
//!
//! Each `(agent_id, thread_id)` pair gets a `<agent>-<thread>.jsonl` file
//! under the transcripts directory. Every message produced by a turn is
//! appended as a single JSON line, in production order.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crewd_domain::error::{Error, Result};
use crewd_domain::interfaces::{MessagePersister, SystemMarker};

/// A single transcript line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub timestamp: String,
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Writes append-only JSONL transcript files, one per agent thread.
pub struct ThreadTranscript {
    base_dir: PathBuf,
}

impl ThreadTranscript {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
        }
    }

    /// Helper to create a transcript line with the current timestamp.
    pub fn line(role: &str, content: &str) -> TranscriptLine {
        TranscriptLine {
            timestamp: Utc::now().to_rfc3339(),
            role: role.to_owned(),
            content: content.to_owned(),
            metadata: None,
        }
    }

    fn path_for(&self, agent_id: &str, thread_id: &str) -> PathBuf {
        self.base_dir
            .join(format!("{agent_id}-{thread_id}.jsonl"))
    }

    /// Append lines synchronously.
    pub fn append(
        &self,
        agent_id: &str,
        thread_id: &str,
        lines: &[TranscriptLine],
    ) -> Result<()> {
        write_lines(&self.path_for(agent_id, thread_id), lines)
    }

    /// Read back a thread's transcript. Malformed lines are skipped with a
    /// warning rather than failing the whole read.
    pub fn read(&self, agent_id: &str, thread_id: &str) -> Result<Vec<TranscriptLine>> {
        let path = self.path_for(agent_id, thread_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let mut lines = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptLine>(line) {
                Ok(tl) => lines.push(tl),
                Err(e) => {
                    tracing::warn!(
                        agent_id,
                        thread_id,
                        error = %e,
                        "skipping malformed transcript line"
                    );
                }
            }
        }
        Ok(lines)
    }

    async fn append_async(
        &self,
        agent_id: &str,
        thread_id: &str,
        line: TranscriptLine,
    ) -> Result<()> {
        let path = self.path_for(agent_id, thread_id);
        tokio::task::spawn_blocking(move || write_lines(&path, &[line]))
            .await
            .map_err(|e| Error::Other(format!("transcript append task failed: {e}")))?
    }
}

fn write_lines(path: &Path, lines: &[TranscriptLine]) -> Result<()> {
    if lines.is_empty() {
        return Ok(());
    }

    let mut buf = String::new();
    for line in lines {
        let json = serde_json::to_string(line)
            .map_err(|e| Error::Other(format!("serializing transcript line: {e}")))?;
        buf.push_str(&json);
        buf.push('\n');
    }

    use std::io::Write;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(Error::Io)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(Error::Io)?;
    file.write_all(buf.as_bytes()).map_err(Error::Io)?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MessagePersister implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl MessagePersister for ThreadTranscript {
    async fn append_user(&self, agent_id: &str, thread_id: &str, content: &str) -> Result<()> {
        self.append_async(agent_id, thread_id, Self::line("user", content))
            .await
    }

    async fn append_assistant(
        &self,
        agent_id: &str,
        thread_id: &str,
        content: &str,
    ) -> Result<()> {
        self.append_async(agent_id, thread_id, Self::line("assistant", content))
            .await
    }

    async fn append_tool_call(
        &self,
        agent_id: &str,
        thread_id: &str,
        tool_id: &str,
        tool_name: &str,
        input: &serde_json::Value,
    ) -> Result<()> {
        let mut line = Self::line("assistant", &input.to_string());
        line.metadata = Some(serde_json::json!({
            "call_id": tool_id,
            "tool_name": tool_name,
        }));
        self.append_async(agent_id, thread_id, line).await
    }

    async fn append_tool_result(
        &self,
        agent_id: &str,
        thread_id: &str,
        tool_id: &str,
        tool_name: &str,
        result: &str,
        is_error: bool,
    ) -> Result<()> {
        let mut line = Self::line("tool", result);
        line.metadata = Some(serde_json::json!({
            "call_id": tool_id,
            "tool_name": tool_name,
            "is_error": is_error,
        }));
        self.append_async(agent_id, thread_id, line).await
    }

    async fn append_system(
        &self,
        agent_id: &str,
        thread_id: &str,
        content: &str,
        kind: SystemMarker,
    ) -> Result<()> {
        let mut line = Self::line("system", content);
        line.metadata = Some(serde_json::json!({ "marker": kind.as_str() }));
        self.append_async(agent_id, thread_id, line).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persister_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let t = ThreadTranscript::new(dir.path());

        t.append_user("a", "main", "ping").await.unwrap();
        t.append_tool_call("a", "main", "t1", "echo", &serde_json::json!({"x": 1}))
            .await
            .unwrap();
        t.append_tool_result("a", "main", "t1", "echo", "{\"y\":1}", false)
            .await
            .unwrap();
        t.append_assistant("a", "main", "pong").await.unwrap();

        let lines = t.read("a", "main").unwrap();
        let roles: Vec<&str> = lines.iter().map(|l| l.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant", "tool", "assistant"]);

        let call_meta = lines[1].metadata.as_ref().unwrap();
        assert_eq!(call_meta["call_id"], "t1");
        assert_eq!(call_meta["tool_name"], "echo");
        let result_meta = lines[2].metadata.as_ref().unwrap();
        assert_eq!(result_meta["is_error"], false);
    }

    #[tokio::test]
    async fn threads_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let t = ThreadTranscript::new(dir.path());
        t.append_user("a", "one", "first").await.unwrap();
        t.append_user("a", "two", "second").await.unwrap();

        assert_eq!(t.read("a", "one").unwrap().len(), 1);
        assert_eq!(t.read("a", "two").unwrap().len(), 1);
        assert!(t.read("b", "one").unwrap().is_empty());
    }

    #[tokio::test]
    async fn system_marker_records_kind() {
        let dir = tempfile::tempdir().unwrap();
        let t = ThreadTranscript::new(dir.path());
        t.append_system("a", "main", "Previous conversation summary: ...", SystemMarker::Compress)
            .await
            .unwrap();

        let lines = t.read("a", "main").unwrap();
        assert_eq!(lines[0].role, "system");
        assert_eq!(lines[0].metadata.as_ref().unwrap()["marker"], "compress");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let t = ThreadTranscript::new(dir.path());
        t.append("a", "main", &[ThreadTranscript::line("user", "good")])
            .unwrap();

        use std::io::Write;
        let path = dir.path().join("a-main.jsonl");
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "this is not json").unwrap();
        drop(f);

        t.append("a", "main", &[ThreadTranscript::line("assistant", "still good")])
            .unwrap();

        let lines = t.read("a", "main").unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].content, "good");
        assert_eq!(lines[1].content, "still good");
    }
}
