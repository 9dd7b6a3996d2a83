//! Chain definitions: the authored automation.
//!
//! A definition pairs a trigger `(event_type, module)` with an ordered list of
//! steps. Steps are value objects owned by their definition.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{ChainDefinitionId, FamilyId, UserId};

/// Authored automation, owned by one family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub id: ChainDefinitionId,

    /// Owning tenant
    pub family_id: FamilyId,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Disabled definitions never spawn executions
    pub is_enabled: bool,

    /// Marketplace templates are cloned per family, never executed directly
    #[serde(default)]
    pub is_template: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,

    pub trigger_event_type: String,

    pub trigger_module: String,

    pub steps: Vec<Step>,

    pub created_by_user_id: UserId,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Optimistic concurrency counter, starts at 1
    pub version: u32,
}

impl ChainDefinition {
    /// Steps in execution order.
    ///
    /// Sorted by explicit `order` (falling back to the declaration index),
    /// ties broken by declaration order.
    pub fn ordered_steps(&self) -> Vec<&Step> {
        let mut indexed: Vec<(usize, &Step)> = self.steps.iter().enumerate().collect();
        indexed.sort_by_key(|(idx, step)| (step.order.unwrap_or(*idx as u32), *idx));
        indexed.into_iter().map(|(_, step)| step).collect()
    }

    /// Look up a step by alias
    pub fn step(&self, alias: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.alias == alias)
    }

    /// Whether this definition reacts to the given trigger
    pub fn matches_trigger(&self, event_type: &str, module: &str) -> bool {
        self.trigger_event_type == event_type && self.trigger_module == module
    }
}

/// One action invocation within a chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique local name, used by mappings and compensation lookups
    pub alias: String,

    pub name: String,

    pub action_type: String,

    #[serde(default = "default_action_version")]
    pub action_version: u32,

    pub module: String,

    /// Expression building this step's input from the context
    #[serde(default = "empty_mappings")]
    pub input_mappings: Value,

    /// Guard: when it evaluates false the step is skipped
    #[serde(default, alias = "condition", skip_serializing_if = "Option::is_none")]
    pub condition_expression: Option<Condition>,

    #[serde(default)]
    pub is_compensatable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_action_type: Option<String>,

    /// Explicit sequencing; declaration index when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
}

fn default_action_version() -> u32 {
    1
}

fn empty_mappings() -> Value {
    Value::Object(Default::default())
}

/// Boolean guard evaluated against the execution context
///
/// YAML forms:
/// - `{ field: trigger.count, operator: gt, value: 2 }`
/// - `{ all: [ ... ] }`, `{ any: [ ... ] }`, `{ not: { ... } }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    All {
        all: Vec<Condition>,
    },
    Any {
        any: Vec<Condition>,
    },
    Not {
        not: Box<Condition>,
    },
    Compare {
        field: String,
        operator: Operator,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
}

impl Condition {
    /// Every context path referenced by this condition
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Self::All { all } => all.iter().flat_map(|c| c.fields()).collect(),
            Self::Any { any } => any.iter().flat_map(|c| c.fields()).collect(),
            Self::Not { not } => not.fields(),
            Self::Compare { field, .. } => vec![field.as_str()],
        }
    }
}

/// Comparison operator for condition leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    /// Substring for strings, element membership for arrays
    Contains,
    /// Field resolves to a non-null value
    Exists,
}

/// Authoring document for a new definition (YAML or API input)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChainDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_enabled")]
    pub is_enabled: bool,

    #[serde(default)]
    pub is_template: bool,

    #[serde(default)]
    pub template_name: Option<String>,

    pub trigger_event_type: String,

    pub trigger_module: String,

    pub steps: Vec<Step>,
}

fn default_enabled() -> bool {
    true
}

impl NewChainDefinition {
    /// Load a definition document from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read chain definition: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a definition document from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse chain definition YAML")
    }

    /// Materialize into a definition owned by `family_id`, version 1
    pub fn into_definition(self, family_id: FamilyId, created_by: UserId) -> ChainDefinition {
        let now = Utc::now();
        ChainDefinition {
            id: ChainDefinitionId::new(),
            family_id,
            name: self.name,
            description: self.description,
            is_enabled: self.is_enabled,
            is_template: self.is_template,
            template_name: self.template_name,
            trigger_event_type: self.trigger_event_type,
            trigger_module: self.trigger_module,
            steps: self.steps,
            created_by_user_id: created_by,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETUP_YAML: &str = r#"
name: New family setup
trigger_event_type: FamilyCreated
trigger_module: family
steps:
  - alias: shopping
    name: Create shopping list
    action_type: create_list
    module: lists
    order: 1
  - alias: calendar
    name: Create calendar
    action_type: create_calendar
    action_version: 2
    module: calendar
    order: 0
    input_mappings:
      family_id: "{{ trigger.family_id }}"
    condition:
      field: trigger.member_count
      operator: gte
      value: 1
    is_compensatable: true
    compensation_action_type: delete_calendar
"#;

    #[test]
    fn test_definition_parsing() {
        let draft = NewChainDefinition::from_yaml(SETUP_YAML).unwrap();
        assert!(draft.is_enabled);
        assert_eq!(draft.steps.len(), 2);

        let calendar = &draft.steps[1];
        assert_eq!(calendar.action_version, 2);
        assert!(calendar.is_compensatable);
        assert!(matches!(
            calendar.condition_expression,
            Some(Condition::Compare { operator: Operator::Gte, .. })
        ));

        // Defaults
        let shopping = &draft.steps[0];
        assert_eq!(shopping.action_version, 1);
        assert!(shopping.input_mappings.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_ordered_steps_use_explicit_order() {
        let def = NewChainDefinition::from_yaml(SETUP_YAML)
            .unwrap()
            .into_definition(FamilyId::new(), UserId::new());

        let aliases: Vec<&str> = def.ordered_steps().iter().map(|s| s.alias.as_str()).collect();
        assert_eq!(aliases, vec!["calendar", "shopping"]);
        assert_eq!(def.version, 1);
    }

    #[test]
    fn test_order_ties_break_by_declaration() {
        let yaml = r#"
name: ties
trigger_event_type: E
trigger_module: m
steps:
  - { alias: a, name: a, action_type: x, module: m, order: 3 }
  - { alias: b, name: b, action_type: x, module: m, order: 3 }
  - { alias: c, name: c, action_type: x, module: m, order: 0 }
"#;
        let def = NewChainDefinition::from_yaml(yaml)
            .unwrap()
            .into_definition(FamilyId::new(), UserId::new());
        let aliases: Vec<&str> = def.ordered_steps().iter().map(|s| s.alias.as_str()).collect();
        assert_eq!(aliases, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_nested_condition_parsing() {
        let yaml = r#"
all:
  - { field: trigger.kind, operator: eq, value: birthday }
  - not:
      field: steps.calendar.id
      operator: exists
"#;
        let condition: Condition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(condition.fields(), vec!["trigger.kind", "steps.calendar.id"]);
    }
}
