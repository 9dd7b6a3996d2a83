//! In-memory store, for tests and single-process runs.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{check_execution_update, check_step_update, ChainStore, ExecutionFilter};
use crate::domain::{
    ChainDefinition, ChainDefinitionId, ChainEntityMapping, ChainExecution, ChainExecutionId,
    CorrelationId, FamilyId, StepExecution,
};
use crate::error::StoreError;

#[derive(Default)]
struct Inner {
    definitions: HashMap<ChainDefinitionId, ChainDefinition>,
    /// Execution rows without their step executions
    executions: HashMap<ChainExecutionId, ChainExecution>,
    steps: HashMap<ChainExecutionId, Vec<StepExecution>>,
    correlations: HashSet<(ChainDefinitionId, CorrelationId)>,
    mappings: Vec<ChainEntityMapping>,
}

impl Inner {
    fn assemble(&self, execution: &ChainExecution) -> ChainExecution {
        let mut execution = execution.clone();
        let mut steps = self.steps.get(&execution.id).cloned().unwrap_or_default();
        steps.sort_by_key(|s| s.position);
        execution.step_executions = steps;
        execution
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChainStore for MemoryStore {
    async fn insert_definition(&self, definition: &ChainDefinition) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .definitions
            .insert(definition.id, definition.clone());
        Ok(())
    }

    async fn update_definition(
        &self,
        definition: &ChainDefinition,
        expected_version: u32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .definitions
            .get_mut(&definition.id)
            .filter(|d| d.family_id == definition.family_id)
            .ok_or_else(|| StoreError::NotFound(format!("chain definition {}", definition.id)))?;

        if stored.version != expected_version {
            return Err(StoreError::ConcurrencyConflict {
                id: definition.id,
                expected: expected_version,
                actual: stored.version,
            });
        }

        *stored = definition.clone();
        Ok(())
    }

    async fn get_definition(
        &self,
        family_id: FamilyId,
        id: ChainDefinitionId,
    ) -> Result<Option<ChainDefinition>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .definitions
            .get(&id)
            .filter(|d| d.family_id == family_id)
            .cloned())
    }

    async fn list_definitions(
        &self,
        family_id: FamilyId,
        enabled: Option<bool>,
    ) -> Result<Vec<ChainDefinition>, StoreError> {
        let inner = self.inner.read().await;
        let mut definitions: Vec<ChainDefinition> = inner
            .definitions
            .values()
            .filter(|d| d.family_id == family_id)
            .filter(|d| enabled.map_or(true, |e| d.is_enabled == e))
            .cloned()
            .collect();
        definitions.sort_by(|a, b| (a.created_at, &a.name).cmp(&(b.created_at, &b.name)));
        Ok(definitions)
    }

    async fn find_enabled_by_trigger(
        &self,
        family_id: FamilyId,
        event_type: &str,
        module: &str,
    ) -> Result<Vec<ChainDefinition>, StoreError> {
        let mut definitions = self.list_definitions(family_id, Some(true)).await?;
        definitions.retain(|d| !d.is_template && d.matches_trigger(event_type, module));
        Ok(definitions)
    }

    async fn find_template(
        &self,
        template_name: &str,
    ) -> Result<Option<ChainDefinition>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .definitions
            .values()
            .find(|d| d.is_template && d.template_name.as_deref() == Some(template_name))
            .cloned())
    }

    async fn insert_execution(&self, execution: &ChainExecution) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let key = (execution.chain_definition_id, execution.correlation_id);
        if !inner.correlations.insert(key) {
            return Err(StoreError::DuplicateExecution {
                definition_id: execution.chain_definition_id,
                correlation_id: execution.correlation_id,
            });
        }

        let mut row = execution.clone();
        let steps = std::mem::take(&mut row.step_executions);
        inner.executions.insert(row.id, row);
        inner.steps.insert(execution.id, steps);
        Ok(())
    }

    async fn update_execution(&self, execution: &ChainExecution) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .executions
            .get_mut(&execution.id)
            .ok_or_else(|| StoreError::NotFound(format!("chain execution {}", execution.id)))?;

        check_execution_update(stored.status, execution.status)?;

        let mut row = execution.clone();
        row.step_executions.clear();
        *stored = row;
        Ok(())
    }

    async fn get_execution(
        &self,
        family_id: FamilyId,
        id: ChainExecutionId,
    ) -> Result<Option<ChainExecution>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .executions
            .get(&id)
            .filter(|e| e.family_id == family_id)
            .map(|e| inner.assemble(e)))
    }

    async fn list_executions(
        &self,
        family_id: FamilyId,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ChainExecution>, StoreError> {
        let inner = self.inner.read().await;
        let mut executions: Vec<ChainExecution> = inner
            .executions
            .values()
            .filter(|e| e.family_id == family_id && filter.matches(e))
            .map(|e| inner.assemble(e))
            .collect();
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(executions)
    }

    async fn count_executions(
        &self,
        family_id: FamilyId,
        definition_id: ChainDefinitionId,
    ) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .executions
            .values()
            .filter(|e| e.family_id == family_id && e.chain_definition_id == definition_id)
            .count() as u64)
    }

    async fn upsert_step_execution(&self, step: &StepExecution) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let steps = inner.steps.get_mut(&step.chain_execution_id).ok_or_else(|| {
            StoreError::NotFound(format!("chain execution {}", step.chain_execution_id))
        })?;

        match steps.iter_mut().find(|s| s.step_alias == step.step_alias) {
            Some(stored) => {
                check_step_update(stored, step)?;
                *stored = step.clone();
            }
            None => steps.push(step.clone()),
        }
        Ok(())
    }

    async fn append_mapping(&self, mapping: &ChainEntityMapping) -> Result<(), StoreError> {
        self.inner.write().await.mappings.push(mapping.clone());
        Ok(())
    }

    async fn mappings_for_entity(
        &self,
        family_id: FamilyId,
        entity_id: &str,
        entity_type: Option<&str>,
    ) -> Result<Vec<ChainEntityMapping>, StoreError> {
        let inner = self.inner.read().await;
        let owned = |m: &ChainEntityMapping| {
            inner
                .executions
                .get(&m.chain_execution_id)
                .map_or(false, |e| e.family_id == family_id)
        };
        Ok(inner
            .mappings
            .iter()
            .filter(|m| m.entity_id == entity_id && owned(*m))
            .filter(|m| entity_type.map_or(true, |t| m.entity_type == t))
            .cloned()
            .collect())
    }

    async fn mappings_for_execution(
        &self,
        execution_id: ChainExecutionId,
    ) -> Result<Vec<ChainEntityMapping>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .mappings
            .iter()
            .filter(|m| m.chain_execution_id == execution_id)
            .cloned()
            .collect())
    }
}
