//! Execution Integration Tests
//!
//! Forward processing of chains: context flow between steps, guards,
//! entity mappings, dispatch-time checks and the execution journal.

mod common;

use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use common::{Harness, FAMILY_SETUP};
use event_chains::core::{Journal, RetryPolicy, SafetyLimits, TriggerDispatcher};
use event_chains::domain::{EventType, ExecutionStatus, FamilyId, StepStatus};
use event_chains::store::{ExecutionFilter, MemoryStore};

const GUARDED: &str = r#"
name: Large family welcome
trigger_event_type: FamilyCreated
trigger_module: family
steps:
  - alias: shopping
    name: Bulk shopping list
    action_type: create_list
    module: lists
    condition:
      field: trigger.member_count
      operator: gt
      value: 4
  - alias: notify
    name: Tell the family
    action_type: send
    module: notify
    input_mappings:
      list_id: "{{ steps.shopping.id }}"
      family_id: "{{ trigger.family_id }}"
"#;

fn family_created(harness: &Harness, members: u64) -> event_chains::domain::TriggerEvent {
    harness.trigger(
        "FamilyCreated",
        "family",
        json!({"family_id": "fam-1", "name": "Smith", "member_count": members}),
    )
}

#[tokio::test]
async fn test_family_setup_completes_with_two_mappings() {
    let harness = Harness::new();
    let definition = harness.create(FAMILY_SETUP).await;

    let executions = harness.fire(family_created(&harness, 3)).await;
    assert_eq!(executions.len(), 1);

    let execution = &executions[0];
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.chain_definition_id, definition.id);
    assert!(execution.completed_at.is_some());
    assert!(execution.error_message.is_none());
    assert_eq!(execution.step_executions.len(), 2);
    assert!(execution
        .step_executions
        .iter()
        .all(|s| s.status == StepStatus::Succeeded));

    let mappings = harness
        .store
        .mappings_for_execution(execution.id)
        .await
        .unwrap();
    assert_eq!(mappings.len(), 2);
    let mut types: Vec<&str> = mappings.iter().map(|m| m.entity_type.as_str()).collect();
    types.sort();
    assert_eq!(types, vec!["calendar", "shopping_list"]);

    assert_eq!(
        harness
            .service
            .count_executions(harness.family, definition.id)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_context_flows_between_steps() {
    let harness = Harness::new();
    harness.create(FAMILY_SETUP).await;

    let execution = harness.fire(family_created(&harness, 3)).await.remove(0);

    let calendar = harness.log.calls_to("create_calendar").remove(0);
    assert_eq!(
        calendar.input,
        json!({"family_id": "fam-1", "title": "Smith calendar"})
    );
    assert_eq!(calendar.idempotency_key, format!("{}:calendar", execution.id));

    let shopping = harness.log.calls_to("create_list").remove(0);
    let calendar_id = format!("calendar-{}", execution.id);
    assert_eq!(shopping.input, json!({ "calendar_id": calendar_id }));

    // Persisted context carries both outputs under their aliases
    assert_eq!(execution.context["steps"]["calendar"]["id"], json!(calendar_id));
    assert_eq!(execution.context["trigger"]["name"], json!("Smith"));
    assert!(execution.context["steps"]["shopping"].is_object());
}

#[tokio::test]
async fn test_false_guard_skips_step() {
    let harness = Harness::new();
    harness.create(GUARDED).await;

    let execution = harness.fire(family_created(&harness, 2)).await.remove(0);
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let shopping = execution.step_execution("shopping").unwrap();
    assert_eq!(shopping.status, StepStatus::Skipped);
    assert!(shopping.output_payload.is_none());
    assert!(execution.context["steps"].get("shopping").is_none());

    // Downstream mapping to the skipped alias binds null
    let notify = harness.log.calls_to("send").remove(0);
    assert_eq!(notify.input, json!({"list_id": Value::Null, "family_id": "fam-1"}));
    assert!(harness.log.calls_to("create_list").is_empty());
}

#[tokio::test]
async fn test_true_guard_runs_step() {
    let harness = Harness::new();
    harness.create(GUARDED).await;

    let execution = harness.fire(family_created(&harness, 6)).await.remove(0);
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        execution.step_execution("shopping").unwrap().status,
        StepStatus::Succeeded
    );

    let notify = harness.log.calls_to("send").remove(0);
    assert_eq!(
        notify.input["list_id"],
        json!(format!("shopping_list-{}", execution.id))
    );
}

#[tokio::test]
async fn test_disabled_definition_never_runs() {
    let harness = Harness::new();
    let disabled = FAMILY_SETUP.replace(
        "trigger_module: family\n",
        "trigger_module: family\nis_enabled: false\n",
    );
    harness.create(&disabled).await;

    let executions = harness.fire(family_created(&harness, 3)).await;
    assert!(executions.is_empty());
    assert!(harness.log.calls().is_empty());

    let listed = harness
        .service
        .list_executions(harness.family, &ExecutionFilter::default())
        .await
        .unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn test_templates_and_other_families_never_run() {
    let harness = Harness::new();
    let template = FAMILY_SETUP.replace(
        "trigger_module: family\n",
        "trigger_module: family\nis_template: true\ntemplate_name: family-setup\n",
    );
    harness.create(&template).await;
    harness.create(GUARDED).await;

    // Neighbouring family's event
    let foreign = event_chains::domain::TriggerEvent::new(
        "FamilyCreated",
        "family",
        json!({"family_id": "fam-2", "member_count": 9}),
        FamilyId::new(),
    );
    assert!(harness.fire(foreign).await.is_empty());

    // Only the non-template definition handles our own event
    let executions = harness.fire(family_created(&harness, 9)).await;
    assert_eq!(executions.len(), 1);
    assert!(harness.log.calls_to("create_calendar").is_empty());
}

#[tokio::test]
async fn test_executions_of_one_definition_run_independently() {
    let harness = Harness::new();
    harness.create(FAMILY_SETUP).await;

    let first = harness
        .engine
        .on_trigger(family_created(&harness, 1))
        .await
        .unwrap();
    let second = harness
        .engine
        .on_trigger(family_created(&harness, 2))
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_ne!(first[0], second[0]);

    for id in first.into_iter().chain(second) {
        let execution = harness.engine.join(id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }
    assert_eq!(harness.log.calls_to("create_calendar").len(), 2);
}

#[tokio::test]
async fn test_missing_required_input_fails_before_dispatch() {
    let harness = Harness::new();
    harness.create(FAMILY_SETUP).await;

    let event = harness.trigger("FamilyCreated", "family", json!({"name": "Nobody"}));
    let execution = harness.fire(event).await.remove(0);

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.failed_step_alias.as_deref(), Some("calendar"));

    let calendar = execution.step_execution("calendar").unwrap();
    assert_eq!(calendar.status, StepStatus::Failed);
    assert!(calendar
        .error_message
        .as_deref()
        .unwrap()
        .contains("family_id"));
    assert!(harness.log.calls().is_empty());
    assert!(execution.step_execution("shopping").is_none());
}

#[tokio::test]
async fn test_oversized_input_is_terminal() {
    let harness = Harness::build(
        Arc::new(MemoryStore::new()),
        |_, _| {},
        |executor| {
            executor.with_limits(SafetyLimits {
                max_payload_bytes: 64,
                ..Default::default()
            })
        },
    );
    harness
        .create(
            r#"
name: Echo note
trigger_event_type: event.created
trigger_module: calendar
steps:
  - alias: echo
    name: Echo the note
    action_type: echo
    module: core
    input_mappings:
      note: "{{ trigger.note }}"
"#,
        )
        .await;

    let event = harness.trigger("event.created", "calendar", json!({"note": "x".repeat(200)}));
    let execution = harness.fire(event).await.remove(0);

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let echo = execution.step_execution("echo").unwrap();
    assert_eq!(echo.retry_count, 0);
    assert!(echo
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("invalid input: Payload too large"));
}

#[tokio::test]
async fn test_step_timeout_is_retryable_failure() {
    let harness = Harness::build(
        Arc::new(MemoryStore::new()),
        |_, _| {},
        |executor| {
            executor
                .with_retry_policy(RetryPolicy::none())
                .with_limits(SafetyLimits {
                    step_timeout_seconds: 1,
                    ..Default::default()
                })
        },
    );
    harness
        .create(
            r#"
name: Slow step
trigger_event_type: event.created
trigger_module: calendar
steps:
  - alias: slow
    name: Takes too long
    action_type: wait
    module: core
    input_mappings:
      ms: 30000
"#,
        )
        .await;

    let execution = harness
        .fire(harness.trigger("event.created", "calendar", json!({})))
        .await
        .remove(0);

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let slow = execution.step_execution("slow").unwrap();
    assert_eq!(slow.status, StepStatus::Failed);
    assert_eq!(
        slow.error_message.as_deref(),
        Some("transient: Step timeout after 1s")
    );
}

#[tokio::test]
async fn test_run_timeout_fails_between_steps() {
    let harness = Harness::build(
        Arc::new(MemoryStore::new()),
        |_, _| {},
        |executor| {
            executor.with_limits(SafetyLimits {
                run_timeout_seconds: 1,
                ..Default::default()
            })
        },
    );
    harness
        .create(
            r#"
name: Setup with a slow middle
trigger_event_type: FamilyCreated
trigger_module: family
steps:
  - alias: calendar
    name: Create family calendar
    action_type: create_calendar
    module: calendar
    input_mappings:
      family_id: "{{ trigger.family_id }}"
    is_compensatable: true
    compensation_action_type: delete_calendar
  - alias: slow
    name: Wait a moment
    action_type: wait
    module: core
    input_mappings:
      ms: 1100
  - alias: shopping
    name: Create shopping list
    action_type: create_list
    module: lists
"#,
        )
        .await;

    let execution = harness.fire(family_created(&harness, 3)).await.remove(0);

    // The run timeout belongs to no step
    assert!(execution.failed_step_alias.is_none());
    assert!(execution
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("Run timeout"));
    assert_eq!(
        execution.step_execution("slow").unwrap().status,
        StepStatus::Succeeded
    );
    assert!(execution.step_execution("shopping").is_none());
    assert!(harness.log.calls_to("create_list").is_empty());

    assert_eq!(execution.status, ExecutionStatus::Compensated);
    assert_eq!(
        execution.step_execution("calendar").unwrap().status,
        StepStatus::Compensated
    );
    assert_eq!(harness.log.calls_to("delete_calendar").len(), 1);
}

#[tokio::test]
async fn test_journal_records_execution_history() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().to_path_buf();
    let harness = Harness::build(
        Arc::new(MemoryStore::new()),
        |_, _| {},
        |executor| executor.with_observer(Arc::new(Journal::new(base))),
    );
    harness.create(FAMILY_SETUP).await;

    let execution = harness.fire(family_created(&harness, 3)).await.remove(0);

    let journal = Journal::new(temp.path());
    let events = journal.replay(execution.id).await.unwrap();
    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::ExecutionStarted,
            EventType::StepStarted,
            EventType::StepSucceeded,
            EventType::StepStarted,
            EventType::StepSucceeded,
            EventType::ExecutionCompleted,
        ]
    );

    let started = &events[1];
    assert_eq!(started.step_alias.as_deref(), Some("calendar"));
    assert_eq!(started.idempotency_key, format!("{}:calendar", execution.id));
    // Summaries never carry payload contents
    assert!(events.iter().all(|e| !e.summary.contains("fam-1")));

    assert_eq!(journal.list_executions().await.unwrap(), vec![execution.id]);

    let succeeded = journal
        .events_of_type(execution.id, EventType::StepSucceeded)
        .await
        .unwrap();
    let aliases: Vec<_> = succeeded.iter().map(|e| e.step_alias.as_deref()).collect();
    assert_eq!(aliases, vec![Some("calendar"), Some("shopping")]);
}
