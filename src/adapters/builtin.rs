//! Built-in actions of the `core` module.
//!
//! These carry no domain side effects of their own. They let chains be
//! exercised end to end (locally from the CLI, or in tests) before the
//! real calendar/lists/photos modules register their actions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::catalog::{
    ActionDescriptor, ActionError, ActionExecutor, ActionInvocation, ActionOutput,
    ActionRegistry, FieldKind, FieldSchema, Schema,
};
use crate::domain::EntityRef;

pub const CORE_MODULE: &str = "core";

/// Returns its input as output
pub struct Echo;

#[async_trait]
impl ActionExecutor for Echo {
    async fn execute(&self, invocation: ActionInvocation) -> Result<ActionOutput, ActionError> {
        Ok(ActionOutput::new(invocation.input))
    }
}

/// Reports `{entity_type, entity_id, module?}` from its input as a created entity
pub struct RecordEntity;

#[async_trait]
impl ActionExecutor for RecordEntity {
    async fn execute(&self, invocation: ActionInvocation) -> Result<ActionOutput, ActionError> {
        let input = &invocation.input;
        let entity_type = str_field(input, "entity_type")
            .ok_or_else(|| ActionError::Terminal("entity_type must be a string".to_string()))?;
        let entity_id = str_field(input, "entity_id")
            .ok_or_else(|| ActionError::Terminal("entity_id must be a string".to_string()))?;
        let module = str_field(input, "module").unwrap_or(CORE_MODULE);

        let entity = EntityRef::new(entity_type, entity_id, module);
        Ok(ActionOutput::new(invocation.input.clone()).with_entity(entity))
    }
}

fn str_field<'a>(input: &'a Value, name: &str) -> Option<&'a str> {
    input.get(name).and_then(Value::as_str)
}

/// Always fails; `{"transient": true}` makes the failure retryable
pub struct Fail;

#[async_trait]
impl ActionExecutor for Fail {
    async fn execute(&self, invocation: ActionInvocation) -> Result<ActionOutput, ActionError> {
        let message = invocation
            .input
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("requested failure")
            .to_string();

        let transient = invocation
            .input
            .get("transient")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if transient {
            Err(ActionError::Transient(message))
        } else {
            Err(ActionError::Terminal(message))
        }
    }
}

/// Compensation for `record_entity`: acknowledges the entities it was handed
pub struct DiscardEntity;

#[async_trait]
impl ActionExecutor for DiscardEntity {
    async fn execute(&self, invocation: ActionInvocation) -> Result<ActionOutput, ActionError> {
        let discarded: Vec<Value> = invocation
            .input
            .get("entities")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(ActionOutput::new(json!({
            "discarded": discarded.len(),
            "entities": discarded,
        })))
    }
}

/// Sleeps `{"ms": n}` milliseconds, giving up when the run is cancelled
pub struct Wait;

#[async_trait]
impl ActionExecutor for Wait {
    async fn execute(&self, invocation: ActionInvocation) -> Result<ActionOutput, ActionError> {
        let ms = invocation.input.get("ms").and_then(Value::as_u64).unwrap_or(0);

        tokio::select! {
            _ = invocation.cancel.cancelled() => Err(ActionError::Terminal("cancelled".to_string())),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                Ok(ActionOutput::new(json!({ "waited_ms": ms })))
            }
        }
    }
}

/// Register the `core` actions (all version 1)
pub fn register_builtin(registry: &mut ActionRegistry) {
    registry.register(ActionDescriptor::new("echo", CORE_MODULE, 1), Arc::new(Echo));

    registry.register(
        ActionDescriptor::new("record_entity", CORE_MODULE, 1)
            .with_input_schema(Schema::new(vec![
                FieldSchema::required("entity_type", FieldKind::String),
                FieldSchema::required("entity_id", FieldKind::String),
                FieldSchema::optional("module", FieldKind::String),
            ]))
            .compensatable(),
        Arc::new(RecordEntity),
    );

    registry.register(
        ActionDescriptor::new("fail", CORE_MODULE, 1).with_input_schema(Schema::new(vec![
            FieldSchema::optional("message", FieldKind::String),
            FieldSchema::optional("transient", FieldKind::Boolean),
        ])),
        Arc::new(Fail),
    );

    registry.register(
        ActionDescriptor::new("discard_entity", CORE_MODULE, 1),
        Arc::new(DiscardEntity),
    );

    registry.register(
        ActionDescriptor::new("wait", CORE_MODULE, 1).with_input_schema(Schema::new(vec![
            FieldSchema::optional("ms", FieldKind::Integer),
        ])),
        Arc::new(Wait),
    );
}
