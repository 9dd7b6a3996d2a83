//! Chain definition validation.
//!
//! `validate` is a pure function of the definition and the catalog snapshot.
//! It reports every issue it finds rather than stopping at the first.

use std::collections::{HashMap, HashSet};

use crate::catalog::{ActionCatalog, TriggerCatalog, TriggerDescriptor};
use crate::domain::{ChainDefinition, Step};
use crate::error::{ChainValidationError, ValidationIssue};

use super::expression::{mapping_references, referenced_step, referenced_trigger_field};
use super::safety::SafetyLimits;

/// Validate a definition against the catalogs
pub fn validate(
    definition: &ChainDefinition,
    actions: &dyn ActionCatalog,
    triggers: &dyn TriggerCatalog,
    limits: &SafetyLimits,
) -> Result<(), ChainValidationError> {
    let mut issues = Vec::new();

    if definition.name.trim().is_empty() {
        issues.push(ValidationIssue::EmptyName);
    }

    if definition.steps.is_empty() {
        issues.push(ValidationIssue::NoSteps);
    } else if definition.steps.len() > limits.max_steps as usize {
        issues.push(ValidationIssue::TooManySteps {
            actual: definition.steps.len(),
            limit: limits.max_steps,
        });
    }

    let trigger = triggers.resolve(&definition.trigger_event_type, &definition.trigger_module);
    if trigger.is_none() {
        issues.push(ValidationIssue::UnknownTrigger {
            event_type: definition.trigger_event_type.clone(),
            module: definition.trigger_module.clone(),
        });
    }

    let mut seen = HashSet::new();
    for (index, step) in definition.steps.iter().enumerate() {
        if step.alias.trim().is_empty() {
            issues.push(ValidationIssue::EmptyAlias { index });
        } else if !seen.insert(step.alias.as_str()) {
            issues.push(ValidationIssue::DuplicateAlias {
                alias: step.alias.clone(),
            });
        }

        check_action(step, actions, &mut issues);
    }

    let positions: HashMap<&str, usize> = definition
        .ordered_steps()
        .into_iter()
        .enumerate()
        .map(|(pos, step)| (step.alias.as_str(), pos))
        .collect();

    for step in definition.ordered_steps() {
        check_references(step, &positions, trigger.as_ref(), &mut issues);
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ChainValidationError::new(issues))
    }
}

fn check_action(step: &Step, actions: &dyn ActionCatalog, issues: &mut Vec<ValidationIssue>) {
    match actions.resolve(&step.action_type, &step.module, step.action_version) {
        None => issues.push(ValidationIssue::UnknownAction {
            alias: step.alias.clone(),
            action_type: step.action_type.clone(),
            module: step.module.clone(),
            version: step.action_version,
        }),
        Some(descriptor) => {
            if descriptor.is_deprecated {
                issues.push(ValidationIssue::DeprecatedAction {
                    alias: step.alias.clone(),
                    action_type: step.action_type.clone(),
                    version: step.action_version,
                });
            }
            if step.is_compensatable && !descriptor.is_compensatable {
                issues.push(ValidationIssue::ActionNotCompensatable {
                    alias: step.alias.clone(),
                    action_type: step.action_type.clone(),
                });
            }
        }
    }

    match &step.compensation_action_type {
        Some(compensation) => {
            if actions.resolve_latest(compensation, &step.module).is_none() {
                issues.push(ValidationIssue::UnknownCompensationAction {
                    alias: step.alias.clone(),
                    action_type: compensation.clone(),
                    module: step.module.clone(),
                });
            }
        }
        None if step.is_compensatable => {
            issues.push(ValidationIssue::MissingCompensationAction {
                alias: step.alias.clone(),
            });
        }
        None => {}
    }
}

fn check_references(
    step: &Step,
    positions: &HashMap<&str, usize>,
    trigger: Option<&TriggerDescriptor>,
    issues: &mut Vec<ValidationIssue>,
) {
    let own_position = positions.get(step.alias.as_str()).copied();

    let mut paths = mapping_references(&step.input_mappings);
    if let Some(condition) = &step.condition_expression {
        paths.extend(condition.fields().into_iter().map(str::to_string));
    }

    let mut reported = HashSet::new();
    for path in &paths {
        if let Some(reference) = referenced_step(path) {
            if !reported.insert(reference.to_string()) {
                continue;
            }
            match (positions.get(reference), own_position) {
                (None, _) => issues.push(ValidationIssue::UnknownStepReference {
                    alias: step.alias.clone(),
                    reference: reference.to_string(),
                }),
                (Some(target), Some(own)) if *target >= own => {
                    issues.push(ValidationIssue::ForwardReference {
                        alias: step.alias.clone(),
                        reference: reference.to_string(),
                    })
                }
                _ => {}
            }
        }

        if let (Some(field), Some(trigger)) = (referenced_trigger_field(path), trigger) {
            let schema = &trigger.output_schema;
            if !schema.is_open() && !schema.has_field(field) && reported.insert(path.clone()) {
                issues.push(ValidationIssue::UnknownTriggerField {
                    alias: step.alias.clone(),
                    field: field.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::catalog::{
        ActionDescriptor, ActionError, ActionExecutor, ActionInvocation, ActionOutput,
        ActionRegistry, FieldKind, FieldSchema, Schema, TriggerRegistry,
    };
    use crate::domain::{FamilyId, NewChainDefinition, UserId};

    struct Noop;

    #[async_trait]
    impl ActionExecutor for Noop {
        async fn execute(&self, _invocation: ActionInvocation) -> Result<ActionOutput, ActionError> {
            Ok(ActionOutput::default())
        }
    }

    fn catalogs() -> (ActionRegistry, TriggerRegistry) {
        let mut actions = ActionRegistry::new();
        actions.register(
            ActionDescriptor::new("create_calendar", "calendar", 1).compensatable(),
            Arc::new(Noop),
        );
        actions.register(ActionDescriptor::new("delete_calendar", "calendar", 1), Arc::new(Noop));
        actions.register(ActionDescriptor::new("create_list", "lists", 1), Arc::new(Noop));
        actions.register(
            ActionDescriptor::new("create_list", "lists", 0).deprecated(),
            Arc::new(Noop),
        );

        let mut triggers = TriggerRegistry::new();
        triggers.register(
            TriggerDescriptor::new("FamilyCreated", "family").with_output_schema(Schema::new(vec![
                FieldSchema::required("family_id", FieldKind::String),
            ])),
        );
        (actions, triggers)
    }

    fn definition(yaml: &str) -> ChainDefinition {
        NewChainDefinition::from_yaml(yaml)
            .unwrap()
            .into_definition(FamilyId::new(), UserId::new())
    }

    fn issues(def: &ChainDefinition) -> Vec<ValidationIssue> {
        let (actions, triggers) = catalogs();
        match validate(def, &actions, &triggers, &SafetyLimits::default()) {
            Ok(()) => Vec::new(),
            Err(err) => err.issues,
        }
    }

    #[test]
    fn test_valid_definition() {
        let def = definition(
            r#"
name: setup
trigger_event_type: FamilyCreated
trigger_module: family
steps:
  - alias: calendar
    name: Calendar
    action_type: create_calendar
    module: calendar
    input_mappings: { family_id: "{{ trigger.family_id }}" }
    is_compensatable: true
    compensation_action_type: delete_calendar
  - alias: list
    name: List
    action_type: create_list
    module: lists
    input_mappings: { calendar: "{{ steps.calendar.calendar_id }}" }
"#,
        );
        assert!(issues(&def).is_empty());
    }

    #[test]
    fn test_collects_all_issues() {
        let def = definition(
            r#"
name: ""
trigger_event_type: Unknown
trigger_module: family
steps:
  - { alias: a, name: a, action_type: create_list, module: lists }
  - { alias: a, name: a2, action_type: nope, module: lists }
  - { alias: c, name: c, action_type: create_list, module: lists, action_version: 0 }
"#,
        );
        let found = issues(&def);
        assert!(found.contains(&ValidationIssue::EmptyName));
        assert!(found.contains(&ValidationIssue::UnknownTrigger {
            event_type: "Unknown".into(),
            module: "family".into()
        }));
        assert!(found.contains(&ValidationIssue::DuplicateAlias { alias: "a".into() }));
        assert!(found
            .iter()
            .any(|i| matches!(i, ValidationIssue::UnknownAction { action_type, .. } if action_type == "nope")));
        assert!(found
            .iter()
            .any(|i| matches!(i, ValidationIssue::DeprecatedAction { alias, .. } if alias == "c")));
    }

    #[test]
    fn test_compensation_checks() {
        let def = definition(
            r#"
name: comp
trigger_event_type: FamilyCreated
trigger_module: family
steps:
  - { alias: a, name: a, action_type: create_calendar, module: calendar, is_compensatable: true }
  - { alias: b, name: b, action_type: create_list, module: lists, is_compensatable: true, compensation_action_type: delete_list }
"#,
        );
        let found = issues(&def);
        assert!(found.contains(&ValidationIssue::MissingCompensationAction { alias: "a".into() }));
        assert!(found.contains(&ValidationIssue::ActionNotCompensatable {
            alias: "b".into(),
            action_type: "create_list".into()
        }));
        assert!(found.contains(&ValidationIssue::UnknownCompensationAction {
            alias: "b".into(),
            action_type: "delete_list".into(),
            module: "lists".into()
        }));
    }

    #[test]
    fn test_reference_checks() {
        let def = definition(
            r#"
name: refs
trigger_event_type: FamilyCreated
trigger_module: family
steps:
  - alias: first
    name: first
    action_type: create_list
    module: lists
    input_mappings: { later: "{{ steps.second.id }}", who: "{{ trigger.nickname }}" }
  - alias: second
    name: second
    action_type: create_list
    module: lists
    condition: { field: steps.ghost.id, operator: exists }
"#,
        );
        let found = issues(&def);
        assert_eq!(found.len(), 3, "{:?}", found);
        assert!(found.contains(&ValidationIssue::ForwardReference {
            alias: "first".into(),
            reference: "second".into()
        }));
        assert!(found.contains(&ValidationIssue::UnknownTriggerField {
            alias: "first".into(),
            field: "nickname".into()
        }));
        assert!(found.contains(&ValidationIssue::UnknownStepReference {
            alias: "second".into(),
            reference: "ghost".into()
        }));
    }

    #[test]
    fn test_step_limit_and_empty() {
        let mut def = definition(
            r#"
name: tiny
trigger_event_type: FamilyCreated
trigger_module: family
steps:
  - { alias: a, name: a, action_type: create_list, module: lists }
  - { alias: b, name: b, action_type: create_list, module: lists }
"#,
        );
        let (actions, triggers) = catalogs();
        let limits = SafetyLimits {
            max_steps: 1,
            ..Default::default()
        };
        let err = validate(&def, &actions, &triggers, &limits).unwrap_err();
        assert!(err.contains(|i| matches!(i, ValidationIssue::TooManySteps { actual: 2, limit: 1 })));

        def.steps.clear();
        assert_eq!(issues(&def), vec![ValidationIssue::NoSteps]);
    }

    #[test]
    fn test_validation_is_repeatable() {
        let def = definition(
            r#"
name: twice
trigger_event_type: FamilyCreated
trigger_module: family
steps:
  - { alias: a, name: a, action_type: missing, module: lists, input_mappings: { x: 1 } }
"#,
        );
        assert_eq!(issues(&def), issues(&def));
    }
}
