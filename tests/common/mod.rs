//! Shared fixtures for the integration tests.
//!
//! Actions here stand in for the calendar and lists modules. Every call is
//! recorded in a `CallLog` so tests can assert dispatch order, inputs and
//! idempotency keys.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use event_chains::adapters::register_builtin;
use event_chains::catalog::{
    ActionDescriptor, ActionError, ActionExecutor, ActionInvocation, ActionOutput,
    ActionRegistry, FieldKind, FieldSchema, Schema, TriggerDescriptor, TriggerRegistry,
};
use event_chains::core::{ChainService, Engine, RetryPolicy, StepExecutor};
use event_chains::domain::{
    ChainDefinition, ChainDefinitionId, ChainEntityMapping, ChainExecution, ChainExecutionId,
    EntityRef, ExecutionStatus, FamilyId, NewChainDefinition, StepExecution, StepStatus,
    TriggerEvent, UserId,
};
use event_chains::error::StoreError;
use event_chains::store::{ChainStore, ExecutionFilter, MemoryStore};

/// One recorded action call
#[derive(Debug, Clone)]
pub struct Call {
    pub action: String,
    pub step_alias: String,
    pub idempotency_key: String,
    pub input: Value,
}

#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn record(&self, action: &str, invocation: &ActionInvocation) {
        self.0.lock().unwrap().push(Call {
            action: action.to_string(),
            step_alias: invocation.step_alias.clone(),
            idempotency_key: invocation.idempotency_key.clone(),
            input: invocation.input.clone(),
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    /// Action names in call order
    pub fn actions(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.action).collect()
    }

    pub fn calls_to(&self, action: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.action == action)
            .collect()
    }
}

/// Succeeds, optionally reporting a created entity `<entity_type>-<n>`
pub struct Recording {
    name: String,
    module: String,
    creates: Option<String>,
    output: Option<Value>,
    log: CallLog,
}

impl Recording {
    pub fn new(name: &str, module: &str, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            module: module.to_string(),
            creates: None,
            output: None,
            log: log.clone(),
        }
    }

    pub fn creating(mut self, entity_type: &str) -> Self {
        self.creates = Some(entity_type.to_string());
        self
    }

    pub fn returning(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

#[async_trait]
impl ActionExecutor for Recording {
    async fn execute(&self, invocation: ActionInvocation) -> Result<ActionOutput, ActionError> {
        self.log.record(&self.name, &invocation);

        match &self.creates {
            Some(entity_type) => {
                let id = format!("{}-{}", entity_type, invocation.execution_id);
                Ok(ActionOutput::new(json!({ "id": id }))
                    .with_entity(EntityRef::new(entity_type, id, &self.module)))
            }
            None => Ok(ActionOutput::new(
                self.output.clone().unwrap_or(invocation.input),
            )),
        }
    }
}

/// Fails with each scripted error in turn, then succeeds with its input
pub struct Flaky {
    name: String,
    failures: Mutex<VecDeque<ActionError>>,
    log: CallLog,
}

impl Flaky {
    pub fn new(name: &str, failures: Vec<ActionError>, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            failures: Mutex::new(failures.into()),
            log: log.clone(),
        }
    }

    /// Transient failures forever
    pub fn always(name: &str, log: &CallLog) -> Self {
        let failures = (0..100)
            .map(|_| ActionError::Transient("downstream unavailable".to_string()))
            .collect();
        Self::new(name, failures, log)
    }
}

#[async_trait]
impl ActionExecutor for Flaky {
    async fn execute(&self, invocation: ActionInvocation) -> Result<ActionOutput, ActionError> {
        self.log.record(&self.name, &invocation);

        let next = self.failures.lock().unwrap().pop_front();
        match next {
            Some(failure) => Err(failure),
            None => Ok(ActionOutput::new(invocation.input)),
        }
    }
}

/// Signals `started`, then waits for the run to be cancelled
pub struct Blocking {
    name: String,
    started: Arc<Notify>,
    log: CallLog,
}

impl Blocking {
    pub fn new(name: &str, started: &Arc<Notify>, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            started: Arc::clone(started),
            log: log.clone(),
        }
    }
}

#[async_trait]
impl ActionExecutor for Blocking {
    async fn execute(&self, invocation: ActionInvocation) -> Result<ActionOutput, ActionError> {
        self.log.record(&self.name, &invocation);
        self.started.notify_one();
        invocation.cancel.cancelled().await;
        Err(ActionError::Terminal("cancelled".to_string()))
    }
}

/// `MemoryStore` with scripted backend failures.
///
/// Ledger reads fail only once an execution has entered `Compensating`;
/// writes of `Compensated` step rows fail regardless.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    compensating: AtomicBool,
    ledger_read_failures: AtomicUsize,
    compensated_write_failures: AtomicUsize,
}

impl FaultyStore {
    pub fn failing_ledger_reads(self, times: usize) -> Self {
        self.ledger_read_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn failing_compensated_writes(self, times: usize) -> Self {
        self.compensated_write_failures.store(times, Ordering::SeqCst);
        self
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn backend_down() -> StoreError {
        StoreError::Backend("transient io".to_string())
    }
}

#[async_trait]
impl ChainStore for FaultyStore {
    async fn insert_definition(&self, definition: &ChainDefinition) -> Result<(), StoreError> {
        self.inner.insert_definition(definition).await
    }

    async fn update_definition(
        &self,
        definition: &ChainDefinition,
        expected_version: u32,
    ) -> Result<(), StoreError> {
        self.inner.update_definition(definition, expected_version).await
    }

    async fn get_definition(
        &self,
        family_id: FamilyId,
        id: ChainDefinitionId,
    ) -> Result<Option<ChainDefinition>, StoreError> {
        self.inner.get_definition(family_id, id).await
    }

    async fn list_definitions(
        &self,
        family_id: FamilyId,
        enabled: Option<bool>,
    ) -> Result<Vec<ChainDefinition>, StoreError> {
        self.inner.list_definitions(family_id, enabled).await
    }

    async fn find_enabled_by_trigger(
        &self,
        family_id: FamilyId,
        event_type: &str,
        module: &str,
    ) -> Result<Vec<ChainDefinition>, StoreError> {
        self.inner
            .find_enabled_by_trigger(family_id, event_type, module)
            .await
    }

    async fn find_template(
        &self,
        template_name: &str,
    ) -> Result<Option<ChainDefinition>, StoreError> {
        self.inner.find_template(template_name).await
    }

    async fn insert_execution(&self, execution: &ChainExecution) -> Result<(), StoreError> {
        self.inner.insert_execution(execution).await
    }

    async fn update_execution(&self, execution: &ChainExecution) -> Result<(), StoreError> {
        self.inner.update_execution(execution).await?;
        if execution.status == ExecutionStatus::Compensating {
            self.compensating.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn get_execution(
        &self,
        family_id: FamilyId,
        id: ChainExecutionId,
    ) -> Result<Option<ChainExecution>, StoreError> {
        self.inner.get_execution(family_id, id).await
    }

    async fn list_executions(
        &self,
        family_id: FamilyId,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ChainExecution>, StoreError> {
        self.inner.list_executions(family_id, filter).await
    }

    async fn count_executions(
        &self,
        family_id: FamilyId,
        definition_id: ChainDefinitionId,
    ) -> Result<u64, StoreError> {
        self.inner.count_executions(family_id, definition_id).await
    }

    async fn upsert_step_execution(&self, step: &StepExecution) -> Result<(), StoreError> {
        if step.status == StepStatus::Compensated
            && Self::take(&self.compensated_write_failures)
        {
            return Err(Self::backend_down());
        }
        self.inner.upsert_step_execution(step).await
    }

    async fn append_mapping(&self, mapping: &ChainEntityMapping) -> Result<(), StoreError> {
        self.inner.append_mapping(mapping).await
    }

    async fn mappings_for_entity(
        &self,
        family_id: FamilyId,
        entity_id: &str,
        entity_type: Option<&str>,
    ) -> Result<Vec<ChainEntityMapping>, StoreError> {
        self.inner
            .mappings_for_entity(family_id, entity_id, entity_type)
            .await
    }

    async fn mappings_for_execution(
        &self,
        execution_id: ChainExecutionId,
    ) -> Result<Vec<ChainEntityMapping>, StoreError> {
        if self.compensating.load(Ordering::SeqCst) && Self::take(&self.ledger_read_failures) {
            return Err(Self::backend_down());
        }
        self.inner.mappings_for_execution(execution_id).await
    }
}

/// calendar/lists/notify actions on top of the builtins
pub fn family_catalog(log: &CallLog) -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    register_builtin(&mut registry);

    registry.register(
        ActionDescriptor::new("create_calendar", "calendar", 1)
            .with_input_schema(Schema::new(vec![FieldSchema::required(
                "family_id",
                FieldKind::String,
            )]))
            .compensatable(),
        Arc::new(Recording::new("create_calendar", "calendar", log).creating("calendar")),
    );
    registry.register(
        ActionDescriptor::new("delete_calendar", "calendar", 1),
        Arc::new(Recording::new("delete_calendar", "calendar", log)),
    );
    registry.register(
        ActionDescriptor::new("create_list", "lists", 1).compensatable(),
        Arc::new(Recording::new("create_list", "lists", log).creating("shopping_list")),
    );
    registry.register(
        ActionDescriptor::new("delete_list", "lists", 1),
        Arc::new(Recording::new("delete_list", "lists", log)),
    );
    registry.register(
        ActionDescriptor::new("send", "notify", 1),
        Arc::new(Recording::new("send", "notify", log)),
    );

    registry
}

pub fn family_triggers() -> TriggerRegistry {
    let mut registry = TriggerRegistry::new();
    registry.register(TriggerDescriptor::new("FamilyCreated", "family").with_output_schema(
        Schema::new(vec![
            FieldSchema::required("family_id", FieldKind::String),
            FieldSchema::optional("member_count", FieldKind::Integer),
            FieldSchema::optional("name", FieldKind::String),
        ]),
    ));
    registry.register(TriggerDescriptor::new("event.created", "calendar"));
    registry
}

/// Engine, service and store sharing one family catalog
pub struct Harness {
    pub store: Arc<dyn ChainStore>,
    pub engine: Engine,
    pub service: ChainService,
    pub log: CallLog,
    pub family: FamilyId,
    pub user: UserId,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(Arc::new(MemoryStore::new()), |_, _| {}, |executor| executor)
    }

    /// `extra` may register more actions; `configure` adjusts the executor
    pub fn build(
        store: Arc<dyn ChainStore>,
        extra: impl FnOnce(&mut ActionRegistry, &CallLog),
        configure: impl FnOnce(StepExecutor) -> StepExecutor,
    ) -> Self {
        let log = CallLog::default();
        let mut registry = family_catalog(&log);
        extra(&mut registry, &log);
        let actions = Arc::new(registry);

        let executor = StepExecutor::new(Arc::clone(&store), actions.clone())
            .with_retry_policy(RetryPolicy::immediate(3));
        let executor = configure(executor);

        let service = ChainService::new(Arc::clone(&store), actions, Arc::new(family_triggers()));

        Self {
            store,
            engine: Engine::new(executor),
            service,
            log,
            family: FamilyId::new(),
            user: UserId::new(),
        }
    }

    /// Validate and persist a YAML definition for this harness's family
    pub async fn create(&self, yaml: &str) -> ChainDefinition {
        let new = NewChainDefinition::from_yaml(yaml).unwrap();
        self.service
            .create_definition(self.family, self.user, new)
            .await
            .unwrap()
    }

    pub fn trigger(&self, event_type: &str, module: &str, payload: Value) -> TriggerEvent {
        TriggerEvent::new(event_type, module, payload, self.family)
    }

    /// Fire and wait; returns the executions as stored afterwards
    pub async fn fire(&self, event: TriggerEvent) -> Vec<ChainExecution> {
        let finished = self.engine.dispatch_and_wait(event).await.unwrap();
        let mut stored = Vec::with_capacity(finished.len());
        for execution in finished {
            stored.push(self.stored(&execution).await);
        }
        stored
    }

    pub async fn stored(&self, execution: &ChainExecution) -> ChainExecution {
        self.store
            .get_execution(self.family, execution.id)
            .await
            .unwrap()
            .expect("execution persisted")
    }
}

pub const FAMILY_SETUP: &str = r#"
name: New family setup
trigger_event_type: FamilyCreated
trigger_module: family
steps:
  - alias: calendar
    name: Create family calendar
    action_type: create_calendar
    module: calendar
    input_mappings:
      family_id: "{{ trigger.family_id }}"
      title: "{{ trigger.name }} calendar"
    is_compensatable: true
    compensation_action_type: delete_calendar
  - alias: shopping
    name: Create shopping list
    action_type: create_list
    module: lists
    input_mappings:
      calendar_id: "{{ steps.calendar.id }}"
    is_compensatable: true
    compensation_action_type: delete_list
"#;
