//! Error types for the chain engine.

use std::fmt;

use thiserror::Error;

use crate::domain::{ChainDefinitionId, ChainExecutionId, CorrelationId};

/// Top-level error returned by engine and service operations
#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Validation(#[from] ChainValidationError),

    #[error("Unknown chain template: {0}")]
    UnknownTemplate(String),

    #[error("Chain definition not found: {0}")]
    DefinitionNotFound(ChainDefinitionId),

    #[error("Chain execution not found: {0}")]
    ExecutionNotFound(ChainExecutionId),

    #[error("Invalid state transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Chain execution already running: {0}")]
    AlreadyRunning(ChainExecutionId),

    #[error("Execution task failed: {0}")]
    Task(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ChainError {
    /// Optimistic version mismatch on a definition update
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::Store(StoreError::ConcurrencyConflict { .. }))
    }
}

/// Persistence failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Execution already exists for definition {definition_id} and correlation {correlation_id}")]
    DuplicateExecution {
        definition_id: ChainDefinitionId,
        correlation_id: CorrelationId,
    },

    #[error("Concurrency conflict on definition {id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        id: ChainDefinitionId,
        expected: u32,
        actual: u32,
    },

    #[error("Illegal update of {record}: {from} -> {to}")]
    IllegalTransition {
        record: String,
        from: String,
        to: String,
    },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Backend(format!("serialization: {}", err))
    }
}

/// A single problem found while validating a chain definition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationIssue {
    #[error("Chain name cannot be empty")]
    EmptyName,

    #[error("Chain must have at least one step")]
    NoSteps,

    #[error("Chain has {actual} steps, limit is {limit}")]
    TooManySteps { actual: usize, limit: u32 },

    #[error("Step {index} has an empty alias")]
    EmptyAlias { index: usize },

    #[error("Duplicate step alias '{alias}'")]
    DuplicateAlias { alias: String },

    #[error("Unknown trigger '{event_type}' in module '{module}'")]
    UnknownTrigger { event_type: String, module: String },

    #[error("Step '{alias}' references unknown action '{action_type}' v{version} in module '{module}'")]
    UnknownAction {
        alias: String,
        action_type: String,
        module: String,
        version: u32,
    },

    #[error("Step '{alias}' uses deprecated action '{action_type}' v{version}")]
    DeprecatedAction {
        alias: String,
        action_type: String,
        version: u32,
    },

    #[error("Step '{alias}' is compensatable but names no compensation action")]
    MissingCompensationAction { alias: String },

    #[error("Step '{alias}' is compensatable but action '{action_type}' cannot be compensated")]
    ActionNotCompensatable { alias: String, action_type: String },

    #[error("Step '{alias}' references unknown compensation action '{action_type}' in module '{module}'")]
    UnknownCompensationAction {
        alias: String,
        action_type: String,
        module: String,
    },

    #[error("Step '{alias}' references unknown step '{reference}'")]
    UnknownStepReference { alias: String, reference: String },

    #[error("Step '{alias}' references step '{reference}' which does not run before it")]
    ForwardReference { alias: String, reference: String },

    #[error("Step '{alias}' references trigger field '{field}' absent from the trigger schema")]
    UnknownTriggerField { alias: String, field: String },
}

/// Aggregate of every issue found in a definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ChainValidationError {
    pub fn new(issues: Vec<ValidationIssue>) -> Self {
        Self { issues }
    }

    pub fn contains(&self, predicate: impl Fn(&ValidationIssue) -> bool) -> bool {
        self.issues.iter().any(predicate)
    }
}

impl fmt::Display for ChainValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Chain definition has {} validation error(s)",
            self.issues.len()
        )?;
        for issue in &self.issues {
            write!(f, "\n  - {}", issue)?;
        }
        Ok(())
    }
}

impl std::error::Error for ChainValidationError {}
