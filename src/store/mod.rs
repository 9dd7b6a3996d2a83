//! Persistence for definitions, executions and the entity mapping ledger.
//!
//! The engine only talks to the `ChainStore` trait. Every write of an
//! execution or step row is checked against the stored row's state machine,
//! so a terminal record can never be mutated.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::domain::{
    ChainDefinition, ChainDefinitionId, ChainEntityMapping, ChainExecution, ChainExecutionId,
    ExecutionStatus, FamilyId, StepExecution,
};
use crate::error::StoreError;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Filters for execution listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionFilter {
    pub definition_id: Option<ChainDefinitionId>,
    pub status: Option<ExecutionStatus>,
}

impl ExecutionFilter {
    pub fn for_definition(definition_id: ChainDefinitionId) -> Self {
        Self {
            definition_id: Some(definition_id),
            status: None,
        }
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, execution: &ChainExecution) -> bool {
        self.definition_id
            .map_or(true, |id| execution.chain_definition_id == id)
            && self.status.map_or(true, |s| execution.status == s)
    }
}

#[async_trait]
pub trait ChainStore: Send + Sync {
    async fn insert_definition(&self, definition: &ChainDefinition) -> Result<(), StoreError>;

    /// Replace a definition if the stored version equals `expected_version`
    async fn update_definition(
        &self,
        definition: &ChainDefinition,
        expected_version: u32,
    ) -> Result<(), StoreError>;

    async fn get_definition(
        &self,
        family_id: FamilyId,
        id: ChainDefinitionId,
    ) -> Result<Option<ChainDefinition>, StoreError>;

    async fn list_definitions(
        &self,
        family_id: FamilyId,
        enabled: Option<bool>,
    ) -> Result<Vec<ChainDefinition>, StoreError>;

    /// Enabled, non-template definitions of a family reacting to a trigger
    async fn find_enabled_by_trigger(
        &self,
        family_id: FamilyId,
        event_type: &str,
        module: &str,
    ) -> Result<Vec<ChainDefinition>, StoreError>;

    async fn find_template(&self, template_name: &str)
        -> Result<Option<ChainDefinition>, StoreError>;

    /// Insert a new execution; a second one for the same
    /// `(definition, correlation)` pair is `DuplicateExecution`
    async fn insert_execution(&self, execution: &ChainExecution) -> Result<(), StoreError>;

    /// Persist the execution row (status, context, timestamps, error).
    /// Step executions are written separately.
    async fn update_execution(&self, execution: &ChainExecution) -> Result<(), StoreError>;

    /// Execution with its step executions in position order
    async fn get_execution(
        &self,
        family_id: FamilyId,
        id: ChainExecutionId,
    ) -> Result<Option<ChainExecution>, StoreError>;

    /// Executions of a family, newest first
    async fn list_executions(
        &self,
        family_id: FamilyId,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ChainExecution>, StoreError>;

    async fn count_executions(
        &self,
        family_id: FamilyId,
        definition_id: ChainDefinitionId,
    ) -> Result<u64, StoreError>;

    async fn upsert_step_execution(&self, step: &StepExecution) -> Result<(), StoreError>;

    async fn append_mapping(&self, mapping: &ChainEntityMapping) -> Result<(), StoreError>;

    /// Mappings of an entity, limited to executions of `family_id`
    async fn mappings_for_entity(
        &self,
        family_id: FamilyId,
        entity_id: &str,
        entity_type: Option<&str>,
    ) -> Result<Vec<ChainEntityMapping>, StoreError>;

    async fn mappings_for_execution(
        &self,
        execution_id: ChainExecutionId,
    ) -> Result<Vec<ChainEntityMapping>, StoreError>;
}

/// Reject an execution write the stored row's state does not allow
pub(crate) fn check_execution_update(
    stored: ExecutionStatus,
    next: ExecutionStatus,
) -> Result<(), StoreError> {
    if stored.permits(next) {
        Ok(())
    } else {
        Err(StoreError::IllegalTransition {
            record: "chain execution".to_string(),
            from: stored.to_string(),
            to: next.to_string(),
        })
    }
}

/// Reject a step write over a settled or incompatible stored row
pub(crate) fn check_step_update(stored: &StepExecution, next: &StepExecution) -> Result<(), StoreError> {
    if stored.status.permits(next.status) {
        Ok(())
    } else {
        Err(StoreError::IllegalTransition {
            record: format!("step execution '{}'", stored.step_alias),
            from: stored.status.to_string(),
            to: next.status.to_string(),
        })
    }
}
