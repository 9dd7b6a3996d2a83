//! Append-only execution journal with file-based persistence.
//!
//! Each execution gets its own newline-delimited JSON (JSONL) file so the
//! history of a run can be inspected with ordinary tools:
//!
//! ```text
//! <home>/journal/<execution_id>/events.jsonl
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::domain::{ChainExecutionId, EventType, ExecutionEvent};

/// Receives every execution event. Failures are logged by the caller and
/// never affect the run.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    async fn on_event(&self, event: &ExecutionEvent) -> Result<()>;
}

/// File-based execution journal
#[derive(Debug, Clone)]
pub struct Journal {
    base_dir: PathBuf,
}

impl Journal {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Journal in the configured location ($CHAINS_HOME/journal)
    pub fn from_config() -> Result<Self> {
        Ok(Self::new(crate::config::journal_dir()?))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path to the events file of an execution
    pub fn events_path(&self, execution_id: ChainExecutionId) -> PathBuf {
        self.base_dir
            .join(execution_id.to_string())
            .join("events.jsonl")
    }

    /// Append an event to its execution's log
    pub async fn append(&self, event: &ExecutionEvent) -> Result<()> {
        let events_path = self.events_path(event.execution_id);
        if let Some(dir) = events_path.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create journal directory: {}", dir.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)
            .await
            .with_context(|| format!("Failed to open journal: {}", events_path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events of an execution in order
    pub async fn replay(&self, execution_id: ChainExecutionId) -> Result<Vec<ExecutionEvent>> {
        let events_path = self.events_path(execution_id);
        if !events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&events_path)
            .await
            .with_context(|| format!("Failed to open journal: {}", events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: ExecutionEvent = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Events of one type, in order
    pub async fn events_of_type(
        &self,
        execution_id: ChainExecutionId,
        event_type: EventType,
    ) -> Result<Vec<ExecutionEvent>> {
        let events = self.replay(execution_id).await?;
        Ok(events
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect())
    }

    /// List all execution IDs that have a journal
    pub async fn list_executions(&self) -> Result<Vec<ChainExecutionId>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(id) = name.parse::<ChainExecutionId>() {
                        ids.push(id);
                    }
                }
            }
        }

        Ok(ids)
    }
}

#[async_trait]
impl ExecutionObserver for Journal {
    async fn on_event(&self, event: &ExecutionEvent) -> Result<()> {
        self.append(event).await
    }
}

/// Key an action sees for a step; stable across retries and resumes
pub fn generate_idempotency_key(execution_id: ChainExecutionId, step_alias: &str) -> String {
    format!("{}:{}", execution_id, step_alias)
}

/// Hash a payload (first 16 hex chars of SHA256 of its JSON text)
pub fn hash_payload(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn event(execution_id: ChainExecutionId, alias: &str, event_type: EventType) -> ExecutionEvent {
        ExecutionEvent::new(
            execution_id,
            Some(alias.to_string()),
            event_type,
            generate_idempotency_key(execution_id, alias),
            format!("{:?} {}", event_type, alias),
        )
    }

    #[tokio::test]
    async fn test_append_and_replay_order() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::new(temp.path());
        let execution_id = ChainExecutionId::new();

        for i in 0..5 {
            journal
                .append(&event(execution_id, &format!("step{}", i), EventType::StepStarted))
                .await
                .unwrap();
        }

        let events = journal.replay(execution_id).await.unwrap();
        assert_eq!(events.len(), 5);
        for (i, e) in events.iter().enumerate() {
            assert_eq!(e.step_alias, Some(format!("step{}", i)));
        }
    }

    #[tokio::test]
    async fn test_executions_are_separate() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::new(temp.path());
        let a = ChainExecutionId::new();
        let b = ChainExecutionId::new();

        journal.on_event(&event(a, "x", EventType::StepStarted)).await.unwrap();
        journal.on_event(&event(b, "x", EventType::StepSucceeded)).await.unwrap();
        journal.on_event(&event(b, "y", EventType::StepSucceeded)).await.unwrap();

        assert_eq!(journal.replay(a).await.unwrap().len(), 1);
        assert_eq!(
            journal
                .events_of_type(b, EventType::StepSucceeded)
                .await
                .unwrap()
                .len(),
            2
        );

        let mut listed = journal.list_executions().await.unwrap();
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn test_replay_missing_is_empty() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::new(temp.path().join("nothing-here"));
        assert!(journal.replay(ChainExecutionId::new()).await.unwrap().is_empty());
        assert!(journal.list_executions().await.unwrap().is_empty());
    }

    #[test]
    fn test_idempotency_key_format() {
        let id: ChainExecutionId = "550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
        assert_eq!(
            generate_idempotency_key(id, "calendar"),
            "550e8400-e29b-41d4-a716-446655440000:calendar"
        );
    }

    #[test]
    fn test_payload_hash() {
        let a = hash_payload(&json!({"family_id": "f1"}));
        let b = hash_payload(&json!({"family_id": "f1"}));
        let c = hash_payload(&json!({"family_id": "f2"}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }
}
