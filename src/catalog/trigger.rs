//! Trigger catalog: event types a chain may react to.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::schema::Schema;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDescriptor {
    pub event_type: String,

    pub module: String,

    /// Fields the trigger payload carries
    #[serde(default)]
    pub output_schema: Schema,
}

impl TriggerDescriptor {
    pub fn new(event_type: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            module: module.into(),
            output_schema: Schema::default(),
        }
    }

    pub fn with_output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = schema;
        self
    }
}

pub trait TriggerCatalog: Send + Sync {
    fn resolve(&self, event_type: &str, module: &str) -> Option<TriggerDescriptor>;
}

/// Trigger manifest file schema
#[derive(Debug, Clone, Default, Deserialize)]
struct TriggerManifest {
    #[serde(default)]
    triggers: Vec<TriggerDescriptor>,
}

#[derive(Debug, Clone, Default)]
pub struct TriggerRegistry {
    entries: HashMap<(String, String), TriggerDescriptor>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: TriggerDescriptor) {
        self.entries.insert(
            (descriptor.event_type.clone(), descriptor.module.clone()),
            descriptor,
        );
    }

    /// Load triggers from a YAML manifest (`triggers: [...]`)
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read trigger manifest: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let manifest: TriggerManifest =
            serde_yaml::from_str(content).context("Failed to parse trigger manifest YAML")?;

        let mut registry = Self::new();
        for descriptor in manifest.triggers {
            registry.register(descriptor);
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TriggerCatalog for TriggerRegistry {
    fn resolve(&self, event_type: &str, module: &str) -> Option<TriggerDescriptor> {
        self.entries
            .get(&(event_type.to_string(), module.to_string()))
            .cloned()
    }
}
