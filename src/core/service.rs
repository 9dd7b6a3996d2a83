//! Authoring commands and the query surface over definitions and executions.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use crate::catalog::{ActionCatalog, TriggerCatalog};
use crate::domain::{
    ChainDefinition, ChainDefinitionId, ChainEntityMapping, ChainExecution, ChainExecutionId,
    FamilyId, NewChainDefinition, UserId,
};
use crate::error::{ChainError, ChainValidationError};
use crate::store::{ChainStore, ExecutionFilter};

use super::safety::SafetyLimits;
use super::validation::validate;

pub struct ChainService {
    store: Arc<dyn ChainStore>,
    actions: Arc<dyn ActionCatalog>,
    triggers: Arc<dyn TriggerCatalog>,
    limits: SafetyLimits,
}

impl ChainService {
    pub fn new(
        store: Arc<dyn ChainStore>,
        actions: Arc<dyn ActionCatalog>,
        triggers: Arc<dyn TriggerCatalog>,
    ) -> Self {
        Self {
            store,
            actions,
            triggers,
            limits: SafetyLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: SafetyLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Validate a definition against the current catalogs
    pub fn validate(&self, definition: &ChainDefinition) -> Result<(), ChainValidationError> {
        validate(
            definition,
            self.actions.as_ref(),
            self.triggers.as_ref(),
            &self.limits,
        )
    }

    #[instrument(skip(self, new), fields(name = %new.name))]
    pub async fn create_definition(
        &self,
        family_id: FamilyId,
        created_by: UserId,
        new: NewChainDefinition,
    ) -> Result<ChainDefinition, ChainError> {
        let definition = new.into_definition(family_id, created_by);
        self.validate(&definition)?;
        self.store.insert_definition(&definition).await?;

        info!(definition_id = %definition.id, "Chain definition created");
        Ok(definition)
    }

    /// Validate and persist an edited definition.
    ///
    /// `definition.version` must be the version the caller read; a
    /// concurrent update in between fails with `ConcurrencyConflict`.
    /// Authorship, creation time and template status come from the stored row.
    #[instrument(skip(self, definition), fields(definition_id = %definition.id))]
    pub async fn update_definition(
        &self,
        mut definition: ChainDefinition,
    ) -> Result<ChainDefinition, ChainError> {
        let stored = self
            .get_definition(definition.family_id, definition.id)
            .await?;
        definition.created_by_user_id = stored.created_by_user_id;
        definition.created_at = stored.created_at;
        definition.is_template = stored.is_template;
        self.validate(&definition)?;

        let expected = definition.version;
        definition.version = expected + 1;
        definition.updated_at = Utc::now();
        self.store.update_definition(&definition, expected).await?;

        info!(version = definition.version, "Chain definition updated");
        Ok(definition)
    }

    /// Enable or soft-disable a definition. Enabling re-validates it.
    pub async fn set_enabled(
        &self,
        family_id: FamilyId,
        id: ChainDefinitionId,
        enabled: bool,
    ) -> Result<ChainDefinition, ChainError> {
        let mut definition = self.get_definition(family_id, id).await?;
        if definition.is_enabled == enabled {
            return Ok(definition);
        }

        if enabled {
            self.validate(&definition)?;
        }
        let expected = definition.version;
        definition.is_enabled = enabled;
        definition.version = expected + 1;
        definition.updated_at = Utc::now();
        self.store.update_definition(&definition, expected).await?;

        info!(definition_id = %id, enabled, "Chain definition toggled");
        Ok(definition)
    }

    /// Clone a marketplace template into a family as a regular definition
    #[instrument(skip(self))]
    pub async fn instantiate_template(
        &self,
        template_name: &str,
        family_id: FamilyId,
        created_by: UserId,
    ) -> Result<ChainDefinition, ChainError> {
        let template = self
            .store
            .find_template(template_name)
            .await?
            .ok_or_else(|| ChainError::UnknownTemplate(template_name.to_string()))?;

        let now = Utc::now();
        let definition = ChainDefinition {
            id: ChainDefinitionId::new(),
            family_id,
            is_enabled: true,
            is_template: false,
            template_name: Some(template_name.to_string()),
            created_by_user_id: created_by,
            created_at: now,
            updated_at: now,
            version: 1,
            ..template
        };
        self.validate(&definition)?;
        self.store.insert_definition(&definition).await?;

        info!(definition_id = %definition.id, "Template instantiated");
        Ok(definition)
    }

    pub async fn list_definitions(
        &self,
        family_id: FamilyId,
        enabled: Option<bool>,
    ) -> Result<Vec<ChainDefinition>, ChainError> {
        Ok(self.store.list_definitions(family_id, enabled).await?)
    }

    pub async fn get_definition(
        &self,
        family_id: FamilyId,
        id: ChainDefinitionId,
    ) -> Result<ChainDefinition, ChainError> {
        self.store
            .get_definition(family_id, id)
            .await?
            .ok_or(ChainError::DefinitionNotFound(id))
    }

    pub async fn list_executions(
        &self,
        family_id: FamilyId,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ChainExecution>, ChainError> {
        Ok(self.store.list_executions(family_id, filter).await?)
    }

    pub async fn get_execution(
        &self,
        family_id: FamilyId,
        id: ChainExecutionId,
    ) -> Result<ChainExecution, ChainError> {
        self.store
            .get_execution(family_id, id)
            .await?
            .ok_or(ChainError::ExecutionNotFound(id))
    }

    pub async fn count_executions(
        &self,
        family_id: FamilyId,
        definition_id: ChainDefinitionId,
    ) -> Result<u64, ChainError> {
        Ok(self.store.count_executions(family_id, definition_id).await?)
    }

    /// "What automation created this entity?"
    pub async fn mappings_for_entity(
        &self,
        family_id: FamilyId,
        entity_id: &str,
        entity_type: Option<&str>,
    ) -> Result<Vec<ChainEntityMapping>, ChainError> {
        Ok(self
            .store
            .mappings_for_entity(family_id, entity_id, entity_type)
            .await?)
    }
}
