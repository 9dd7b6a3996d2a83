//! Chain execution state.
//!
//! A `ChainExecution` is one run of a definition. It owns the accumulating
//! context and the step executions, which are created lazily as each step
//! begins. Status changes go through `transition_to`, which enforces the
//! state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{ChainDefinitionId, ChainExecutionId, CorrelationId, FamilyId, StepExecutionId};
use super::trigger::TriggerEvent;
use crate::error::ChainError;

/// Lifecycle of a chain execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
    Cancelled,
}

impl ExecutionStatus {
    /// Whether `next` may follow `self`.
    ///
    /// Same-state writes are allowed only while the run is live
    /// (context merges while `Running`, step bookkeeping while `Compensating`).
    pub fn permits(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Compensating)
                | (Compensating, Compensating)
                | (Compensating, Compensated)
        )
    }

    /// No forward processing happens in these states
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Compensated | Self::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "compensating" => Ok(Self::Compensating),
            "compensated" => Ok(Self::Compensated),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// Status of a single step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Guard evaluated false
    Skipped,
    Compensated,
    /// Compensation was attempted and failed
    CompensationFailed,
}

impl StepStatus {
    /// Whether `next` may follow `self`
    pub fn permits(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Running, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Succeeded, Compensated)
                | (Succeeded, CompensationFailed)
        )
    }

    /// Step finished forward processing and will not be dispatched again
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Compensated => "compensated",
            Self::CompensationFailed => "compensation_failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "compensated" => Ok(Self::Compensated),
            "compensation_failed" => Ok(Self::CompensationFailed),
            other => Err(format!("unknown step status '{}'", other)),
        }
    }
}

/// One run of a chain definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainExecution {
    pub id: ChainExecutionId,

    pub chain_definition_id: ChainDefinitionId,

    pub family_id: FamilyId,

    pub correlation_id: CorrelationId,

    pub status: ExecutionStatus,

    pub trigger_event_type: String,

    /// Snapshot of the triggering event payload
    pub trigger_payload: Value,

    /// Trigger payload plus each completed step's output keyed by alias
    pub context: Value,

    pub started_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    pub failed_at: Option<DateTime<Utc>>,

    pub error_message: Option<String>,

    /// Step that ended the run, if a step did
    pub failed_step_alias: Option<String>,

    /// Step executions in the order they began
    #[serde(default)]
    pub step_executions: Vec<StepExecution>,
}

impl ChainExecution {
    /// Create a pending execution for a trigger occurrence
    pub fn pending(chain_definition_id: ChainDefinitionId, trigger: &TriggerEvent) -> Self {
        let id = ChainExecutionId::new();
        Self {
            id,
            chain_definition_id,
            family_id: trigger.family_id,
            correlation_id: trigger.correlation_id,
            status: ExecutionStatus::Pending,
            trigger_event_type: trigger.event_type.clone(),
            trigger_payload: trigger.payload.clone(),
            context: Value::Null,
            started_at: Utc::now(),
            completed_at: None,
            failed_at: None,
            error_message: None,
            failed_step_alias: None,
            step_executions: Vec::new(),
        }
    }

    /// Move to a new status, rejecting transitions the state machine forbids
    pub fn transition_to(&mut self, next: ExecutionStatus) -> Result<(), ChainError> {
        if !self.status.permits(next) {
            return Err(ChainError::IllegalTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        match next {
            ExecutionStatus::Running if self.status == ExecutionStatus::Pending => {
                self.started_at = now;
            }
            ExecutionStatus::Completed | ExecutionStatus::Compensated => {
                self.completed_at = Some(now);
            }
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
                self.failed_at = Some(now);
            }
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Find the step execution for an alias
    pub fn step_execution(&self, alias: &str) -> Option<&StepExecution> {
        self.step_executions.iter().find(|s| s.step_alias == alias)
    }

    /// Insert or replace the step execution with the same alias
    pub fn upsert_step_execution(&mut self, step: StepExecution) {
        match self
            .step_executions
            .iter_mut()
            .find(|s| s.step_alias == step.step_alias)
        {
            Some(existing) => *existing = step,
            None => self.step_executions.push(step),
        }
    }

    /// Count step executions in a given status
    pub fn count_steps(&self, status: StepStatus) -> usize {
        self.step_executions
            .iter()
            .filter(|s| s.status == status)
            .count()
    }
}

/// Record of one step within an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: StepExecutionId,

    pub chain_execution_id: ChainExecutionId,

    /// Execution-order position of the step in its definition
    pub position: u32,

    pub step_alias: String,

    pub step_name: String,

    pub action_type: String,

    pub status: StepStatus,

    pub input_payload: Option<Value>,

    pub output_payload: Option<Value>,

    pub error_message: Option<String>,

    pub retry_count: u32,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    pub compensated_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    /// Create a pending record for a step that is about to begin
    pub fn pending(
        chain_execution_id: ChainExecutionId,
        position: u32,
        step_alias: &str,
        step_name: &str,
        action_type: &str,
    ) -> Self {
        Self {
            id: StepExecutionId::new(),
            chain_execution_id,
            position,
            step_alias: step_alias.to_string(),
            step_name: step_name.to_string(),
            action_type: action_type.to_string(),
            status: StepStatus::Pending,
            input_payload: None,
            output_payload: None,
            error_message: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            compensated_at: None,
        }
    }

    /// Move to a new status, stamping the matching timestamp
    pub fn transition_to(&mut self, next: StepStatus) -> Result<(), ChainError> {
        if !self.status.permits(next) {
            return Err(ChainError::IllegalTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        match next {
            StepStatus::Running if self.started_at.is_none() => self.started_at = Some(now),
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped => {
                self.completed_at = Some(now)
            }
            StepStatus::Compensated => self.compensated_at = Some(now),
            _ => {}
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger() -> TriggerEvent {
        TriggerEvent::new(
            "FamilyCreated",
            "family",
            serde_json::json!({"family_id": "f1"}),
            FamilyId::new(),
        )
    }

    #[test]
    fn test_execution_happy_path_transitions() {
        let mut exec = ChainExecution::pending(ChainDefinitionId::new(), &trigger());
        assert_eq!(exec.status, ExecutionStatus::Pending);

        exec.transition_to(ExecutionStatus::Running).unwrap();
        exec.transition_to(ExecutionStatus::Completed).unwrap();
        assert!(exec.completed_at.is_some());
        assert!(exec.status.is_terminal());
    }

    #[test]
    fn test_compensation_path_only_from_failed() {
        let mut exec = ChainExecution::pending(ChainDefinitionId::new(), &trigger());
        exec.transition_to(ExecutionStatus::Running).unwrap();
        assert!(exec.transition_to(ExecutionStatus::Compensating).is_err());

        exec.transition_to(ExecutionStatus::Failed).unwrap();
        assert!(exec.failed_at.is_some());
        exec.transition_to(ExecutionStatus::Compensating).unwrap();
        exec.transition_to(ExecutionStatus::Compensated).unwrap();
    }

    #[test]
    fn test_terminal_execution_rejects_mutation() {
        let mut exec = ChainExecution::pending(ChainDefinitionId::new(), &trigger());
        exec.transition_to(ExecutionStatus::Running).unwrap();
        exec.transition_to(ExecutionStatus::Completed).unwrap();

        let err = exec.transition_to(ExecutionStatus::Running).unwrap_err();
        assert!(matches!(err, ChainError::IllegalTransition { .. }));
        assert!(exec.transition_to(ExecutionStatus::Completed).is_err());
    }

    #[test]
    fn test_step_immutable_once_settled() {
        let mut step = StepExecution::pending(ChainExecutionId::new(), 0, "a", "A", "echo");
        step.transition_to(StepStatus::Running).unwrap();
        step.transition_to(StepStatus::Succeeded).unwrap();
        assert!(step.completed_at.is_some());

        assert!(step.transition_to(StepStatus::Failed).is_err());
        step.transition_to(StepStatus::Compensated).unwrap();
        assert!(step.compensated_at.is_some());
        assert!(step.transition_to(StepStatus::Compensated).is_err());
    }

    #[test]
    fn test_skipped_step_cannot_be_compensated() {
        let mut step = StepExecution::pending(ChainExecutionId::new(), 0, "a", "A", "echo");
        step.transition_to(StepStatus::Skipped).unwrap();
        assert!(step.transition_to(StepStatus::Compensated).is_err());
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Compensating,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert_eq!(
            "compensation_failed".parse::<StepStatus>().unwrap(),
            StepStatus::CompensationFailed
        );
    }
}
