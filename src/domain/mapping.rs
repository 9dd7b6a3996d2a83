//! Entity mapping ledger rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ChainExecutionId;

/// A concrete domain entity reported by an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
    pub module: String,
}

impl EntityRef {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        module: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            module: module.into(),
        }
    }
}

/// Append-only fact: a step of an execution created or touched an entity.
///
/// Never updated after insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntityMapping {
    pub chain_execution_id: ChainExecutionId,
    pub step_alias: String,
    pub entity_type: String,
    pub entity_id: String,
    pub module: String,
    pub created_at: DateTime<Utc>,
}

impl ChainEntityMapping {
    pub fn record(chain_execution_id: ChainExecutionId, step_alias: &str, entity: &EntityRef) -> Self {
        Self {
            chain_execution_id,
            step_alias: step_alias.to_string(),
            entity_type: entity.entity_type.clone(),
            entity_id: entity.entity_id.clone(),
            module: entity.module.clone(),
            created_at: Utc::now(),
        }
    }
}
