//! Execution events emitted to observers.
//!
//! Every state change of a chain execution is described by an immutable
//! event. The journal keeps them as an append-only log per execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ids::ChainExecutionId;

/// A single event in an execution's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    pub execution_id: ChainExecutionId,

    /// Step alias (if applicable)
    pub step_alias: Option<String>,

    pub event_type: EventType,

    /// Key the action sees for this step: "{execution_id}:{alias}"
    pub idempotency_key: String,

    /// Human-readable summary (no payload contents)
    pub summary: String,

    /// Time taken in milliseconds (for finished dispatches)
    pub duration_ms: Option<u64>,

    pub error: Option<String>,
}

impl ExecutionEvent {
    /// Create a new event with the current timestamp
    pub fn new(
        execution_id: ChainExecutionId,
        step_alias: Option<String>,
        event_type: EventType,
        idempotency_key: String,
        summary: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            execution_id,
            step_alias,
            event_type,
            idempotency_key,
            summary,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events that can occur during a chain execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutionStarted,
    ExecutionResumed,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCompensated,
    ExecutionCancelled,

    StepStarted,
    StepSucceeded,
    /// Guard evaluated false
    StepSkipped,
    StepRetrying,
    StepFailed,

    CompensationStarted,
    StepCompensated,
    CompensationFailed,
}
