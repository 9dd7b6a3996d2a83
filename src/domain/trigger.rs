//! Inbound trigger events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{CorrelationId, FamilyId};

/// A discrete event delivered by the surrounding event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event_type: String,

    pub module: String,

    pub payload: Value,

    pub family_id: FamilyId,

    /// Redelivery of the same occurrence carries the same correlation id
    pub correlation_id: CorrelationId,
}

impl TriggerEvent {
    /// Create a trigger event with a fresh correlation id
    pub fn new(
        event_type: impl Into<String>,
        module: impl Into<String>,
        payload: Value,
        family_id: FamilyId,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            module: module.into(),
            payload,
            family_id,
            correlation_id: CorrelationId::new(),
        }
    }

    /// Pin the correlation id (redelivery of a known occurrence)
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}
