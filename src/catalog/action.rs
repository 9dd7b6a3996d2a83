//! Action catalog: the executable capabilities steps dispatch to.
//!
//! Actions are registered at startup under `(action_type, module, version)`.
//! The engine only consults the catalog; it never knows concrete actions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::schema::Schema;
use crate::domain::{ChainExecutionId, EntityRef};

/// Registry key for an action
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionKey {
    pub action_type: String,
    pub module: String,
    pub version: u32,
}

impl ActionKey {
    pub fn new(action_type: impl Into<String>, module: impl Into<String>, version: u32) -> Self {
        Self {
            action_type: action_type.into(),
            module: module.into(),
            version,
        }
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@v{}", self.module, self.action_type, self.version)
    }
}

/// What the catalog declares about an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub key: ActionKey,

    #[serde(default)]
    pub input_schema: Schema,

    #[serde(default)]
    pub output_schema: Schema,

    /// The action's effects can be undone by a compensation action
    #[serde(default)]
    pub is_compensatable: bool,

    #[serde(default)]
    pub is_deprecated: bool,
}

impl ActionDescriptor {
    pub fn new(action_type: impl Into<String>, module: impl Into<String>, version: u32) -> Self {
        Self {
            key: ActionKey::new(action_type, module, version),
            input_schema: Schema::default(),
            output_schema: Schema::default(),
            is_compensatable: false,
            is_deprecated: false,
        }
    }

    pub fn with_input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn compensatable(mut self) -> Self {
        self.is_compensatable = true;
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.is_deprecated = true;
        self
    }
}

/// A single dispatch of an action
#[derive(Debug, Clone)]
pub struct ActionInvocation {
    pub execution_id: ChainExecutionId,

    pub step_alias: String,

    /// Stable across retries and resumes; actions use it to no-op replays
    pub idempotency_key: String,

    pub input: Value,

    pub cancel: CancellationToken,
}

/// Successful result of an action
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutput {
    pub payload: Value,

    /// Domain entities the action created or touched
    pub entities: Vec<EntityRef>,
}

impl ActionOutput {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            entities: Vec::new(),
        }
    }

    pub fn with_entity(mut self, entity: EntityRef) -> Self {
        self.entities.push(entity);
        self
    }
}

/// Failure signalled by an action
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// Worth retrying (timeouts, unavailable downstream)
    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Terminal(String),
}

impl ActionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// An executable capability
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, invocation: ActionInvocation) -> Result<ActionOutput, ActionError>;
}

/// Read side of the catalog consumed by validation and the step executor
#[async_trait]
pub trait ActionCatalog: Send + Sync {
    fn resolve(&self, action_type: &str, module: &str, version: u32) -> Option<ActionDescriptor>;

    /// Highest non-deprecated version of an action
    fn resolve_latest(&self, action_type: &str, module: &str) -> Option<ActionDescriptor>;

    async fn invoke(
        &self,
        descriptor: &ActionDescriptor,
        invocation: ActionInvocation,
    ) -> Result<ActionOutput, ActionError>;
}

struct Registered {
    descriptor: ActionDescriptor,
    executor: Arc<dyn ActionExecutor>,
}

/// In-process action catalog populated at startup
#[derive(Default)]
pub struct ActionRegistry {
    entries: HashMap<ActionKey, Registered>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor; a second registration under the same key replaces the first
    pub fn register(&mut self, descriptor: ActionDescriptor, executor: Arc<dyn ActionExecutor>) {
        self.entries.insert(
            descriptor.key.clone(),
            Registered {
                descriptor,
                executor,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptors sorted by key
    pub fn descriptors(&self) -> Vec<&ActionDescriptor> {
        let mut descriptors: Vec<&ActionDescriptor> =
            self.entries.values().map(|r| &r.descriptor).collect();
        descriptors.sort_by(|a, b| a.key.cmp(&b.key));
        descriptors
    }
}

#[async_trait]
impl ActionCatalog for ActionRegistry {
    fn resolve(&self, action_type: &str, module: &str, version: u32) -> Option<ActionDescriptor> {
        self.entries
            .get(&ActionKey::new(action_type, module, version))
            .map(|r| r.descriptor.clone())
    }

    fn resolve_latest(&self, action_type: &str, module: &str) -> Option<ActionDescriptor> {
        self.entries
            .values()
            .map(|r| &r.descriptor)
            .filter(|d| {
                d.key.action_type == action_type && d.key.module == module && !d.is_deprecated
            })
            .max_by_key(|d| d.key.version)
            .cloned()
    }

    async fn invoke(
        &self,
        descriptor: &ActionDescriptor,
        invocation: ActionInvocation,
    ) -> Result<ActionOutput, ActionError> {
        let registered = self.entries.get(&descriptor.key).ok_or_else(|| {
            ActionError::Terminal(format!("action {} is not registered", descriptor.key))
        })?;

        registered.executor.execute(invocation).await
    }
}
