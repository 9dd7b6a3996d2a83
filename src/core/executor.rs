//! Step executor for a single chain execution.
//!
//! Drives the steps of one run strictly in order: resolve input, evaluate the
//! guard, dispatch with retry, merge the output into the context. On a
//! terminal failure the executor walks back over the succeeded compensatable
//! steps in reverse order. Every state change is persisted before the next
//! step starts.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::{
    ActionCatalog, ActionDescriptor, ActionError, ActionInvocation, ActionOutput,
};
use crate::domain::{
    ChainDefinition, ChainEntityMapping, ChainExecution, EventType, ExecutionEvent,
    ExecutionStatus, Step, StepExecution, StepStatus,
};
use crate::error::ChainError;
use crate::store::ChainStore;

use super::expression::{evaluate, resolve_mappings, ExecutionContext};
use super::journal::{generate_idempotency_key, hash_payload, ExecutionObserver};
use super::retry::RetryPolicy;
use super::safety::{SafetyLimits, SafetyViolation};

/// Result of driving one step
enum StepOutcome {
    /// Succeeded or skipped; continue with the next step
    Advanced,
    Failed(String),
    Cancelled,
}

/// Result of one action call
enum Dispatch {
    Output(ActionOutput),
    Failed(ActionError),
    Cancelled,
}

pub struct StepExecutor {
    store: Arc<dyn ChainStore>,
    actions: Arc<dyn ActionCatalog>,
    observers: Vec<Arc<dyn ExecutionObserver>>,
    retry_policy: RetryPolicy,
    limits: SafetyLimits,
}

impl StepExecutor {
    pub fn new(store: Arc<dyn ChainStore>, actions: Arc<dyn ActionCatalog>) -> Self {
        Self {
            store,
            actions,
            observers: Vec::new(),
            retry_policy: RetryPolicy::default(),
            limits: SafetyLimits::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_limits(mut self, limits: SafetyLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn store(&self) -> &Arc<dyn ChainStore> {
        &self.store
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Drive a `Running` execution to a terminal state.
    ///
    /// Steps already settled (from an interrupted earlier run) are not
    /// re-run. Store failures abort the drive and leave the execution
    /// `Running` so it can be resumed. A `Failed` or `Compensating`
    /// execution goes straight to the compensation walk.
    #[instrument(skip_all, fields(execution_id = %execution.id, definition = %definition.name))]
    pub async fn run(
        &self,
        definition: &ChainDefinition,
        mut execution: ChainExecution,
        cancel: CancellationToken,
    ) -> Result<ChainExecution, ChainError> {
        match execution.status {
            ExecutionStatus::Running => {}
            ExecutionStatus::Failed | ExecutionStatus::Compensating => {
                return self.compensate(definition, execution).await;
            }
            other => {
                return Err(ChainError::IllegalTransition {
                    from: other.to_string(),
                    to: ExecutionStatus::Running.to_string(),
                });
            }
        }

        let started = Instant::now();
        let mut context = ExecutionContext::from_value(&execution.context)
            .unwrap_or_else(|| ExecutionContext::for_execution(&execution));

        for (position, step) in definition.ordered_steps().into_iter().enumerate() {
            if cancel.is_cancelled() {
                return self.cancel_execution(execution).await;
            }

            let prior = execution
                .step_execution(&step.alias)
                .map(|s| (s.status, s.error_message.clone()));
            match prior {
                // Failed before the execution row caught up
                Some((StepStatus::Failed, error)) => {
                    let message = error.unwrap_or_else(|| "step failed".to_string());
                    return self
                        .fail_execution(definition, execution, Some(step.alias.clone()), message)
                        .await;
                }
                Some((status, _)) if status.is_settled() => {
                    debug!(alias = %step.alias, "Step already settled, skipping");
                    continue;
                }
                _ => {}
            }

            if let Err(violation) = self.limits.check_run(started) {
                return self
                    .fail_execution(definition, execution, None, violation.to_string())
                    .await;
            }

            match self
                .run_step(&mut execution, &mut context, step, position as u32, &cancel)
                .await?
            {
                StepOutcome::Advanced => {}
                StepOutcome::Failed(message) => {
                    return self
                        .fail_execution(definition, execution, Some(step.alias.clone()), message)
                        .await;
                }
                StepOutcome::Cancelled => return self.cancel_execution(execution).await,
            }
        }

        self.complete_execution(execution, started).await
    }

    #[instrument(skip_all, fields(alias = %step.alias))]
    async fn run_step(
        &self,
        execution: &mut ChainExecution,
        context: &mut ExecutionContext,
        step: &Step,
        position: u32,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, ChainError> {
        let key = generate_idempotency_key(execution.id, &step.alias);
        let mut record = match execution.step_execution(&step.alias) {
            Some(interrupted) => interrupted.clone(),
            None => StepExecution::pending(
                execution.id,
                position,
                &step.alias,
                &step.name,
                &step.action_type,
            ),
        };
        // A step left Running already passed its guard before the interruption
        let interrupted = record.status == StepStatus::Running;

        let input = resolve_mappings(&step.input_mappings, context);

        if !interrupted {
            if let Some(condition) = &step.condition_expression {
                if !evaluate(condition, context) {
                    record.transition_to(StepStatus::Skipped)?;
                    self.save_step(execution, &record).await?;
                    info!("Condition evaluated false, step skipped");
                    self.emit(ExecutionEvent::new(
                        execution.id,
                        Some(step.alias.clone()),
                        EventType::StepSkipped,
                        key,
                        format!("Step '{}' skipped by its condition", step.alias),
                    ))
                    .await;
                    return Ok(StepOutcome::Advanced);
                }
            }
        }

        record.input_payload = Some(input.clone());
        let descriptor = match self.prepare_dispatch(step, &input) {
            Ok(descriptor) => descriptor,
            Err(message) => {
                error!(error = %message, "Step rejected before dispatch");
                return self.fail_step(execution, record, key, message, None).await;
            }
        };

        if interrupted {
            record.retry_count += 1;
        }
        record.transition_to(StepStatus::Running)?;
        self.save_step(execution, &record).await?;

        info!(action = %descriptor.key, retries = record.retry_count, "Dispatching step");
        self.emit(ExecutionEvent::new(
            execution.id,
            Some(step.alias.clone()),
            EventType::StepStarted,
            key.clone(),
            format!(
                "Step '{}' dispatching {} (input {})",
                step.alias,
                descriptor.key,
                hash_payload(&input)
            ),
        ))
        .await;

        loop {
            let attempt_start = Instant::now();
            let invocation = ActionInvocation {
                execution_id: execution.id,
                step_alias: step.alias.clone(),
                idempotency_key: key.clone(),
                input: input.clone(),
                cancel: cancel.clone(),
            };

            let outcome = self.dispatch(&descriptor, invocation, cancel).await;
            let duration_ms = attempt_start.elapsed().as_millis() as u64;

            let failure = match outcome {
                Dispatch::Cancelled => {
                    warn!("Execution cancelled mid-dispatch");
                    return Ok(StepOutcome::Cancelled);
                }
                Dispatch::Output(output) => match self.check_output(&descriptor, &output) {
                    Ok(()) => {
                        self.record_success(execution, context, record, key, output, duration_ms)
                            .await?;
                        return Ok(StepOutcome::Advanced);
                    }
                    Err(message) => {
                        error!(error = %message, "Step output rejected");
                        return self
                            .fail_step(execution, record, key, message, Some(duration_ms))
                            .await;
                    }
                },
                Dispatch::Failed(failure) => failure,
            };

            if failure.is_transient() && self.retry_policy.should_retry(record.retry_count) {
                record.retry_count += 1;
                record.error_message = Some(failure.to_string());
                record.transition_to(StepStatus::Running)?;
                self.save_step(execution, &record).await?;

                let delay = self.retry_policy.delay_for_retry(record.retry_count);
                warn!(
                    retry = record.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Step failed, retrying"
                );
                self.emit(
                    ExecutionEvent::new(
                        execution.id,
                        Some(step.alias.clone()),
                        EventType::StepRetrying,
                        key.clone(),
                        format!(
                            "Step '{}' retry {} in {:?}",
                            step.alias, record.retry_count, delay
                        ),
                    )
                    .with_duration(duration_ms)
                    .with_error(failure.to_string()),
                )
                .await;

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        warn!("Execution cancelled during retry backoff");
                        return Ok(StepOutcome::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            error!(retries = record.retry_count, error = %failure, "Step failed permanently");
            return self
                .fail_step(execution, record, key, failure.to_string(), Some(duration_ms))
                .await;
        }
    }

    /// Resolve the action and check the input against its declared schema
    fn prepare_dispatch(
        &self,
        step: &Step,
        input: &serde_json::Value,
    ) -> Result<ActionDescriptor, String> {
        let descriptor = self
            .actions
            .resolve(&step.action_type, &step.module, step.action_version)
            .ok_or_else(|| {
                format!(
                    "action {}.{}@v{} is not registered",
                    step.module, step.action_type, step.action_version
                )
            })?;

        descriptor
            .input_schema
            .check(input)
            .map_err(|v| format!("invalid input: {}", v))?;
        self.limits
            .validate_payload(input)
            .map_err(|v| format!("invalid input: {}", v))?;

        Ok(descriptor)
    }

    fn check_output(
        &self,
        descriptor: &ActionDescriptor,
        output: &ActionOutput,
    ) -> Result<(), String> {
        self.limits
            .validate_payload(&output.payload)
            .map_err(|v| format!("invalid output: {}", v))?;
        descriptor
            .output_schema
            .check(&output.payload)
            .map_err(|v| format!("invalid output: {}", v))
    }

    /// One action call, bounded by the step timeout and the cancel token.
    /// A timeout counts as a transient failure.
    async fn dispatch(
        &self,
        descriptor: &ActionDescriptor,
        invocation: ActionInvocation,
        cancel: &CancellationToken,
    ) -> Dispatch {
        let timeout = self.limits.step_timeout();
        // Cancellation wins over an action that returns because of it
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Dispatch::Cancelled,
            result = tokio::time::timeout(timeout, self.actions.invoke(descriptor, invocation)) => {
                match result {
                    Ok(Ok(output)) => Dispatch::Output(output),
                    Ok(Err(failure)) => Dispatch::Failed(failure),
                    Err(_) => Dispatch::Failed(ActionError::Transient(
                        SafetyViolation::StepTimeout {
                            limit_seconds: self.limits.step_timeout_seconds,
                        }
                        .to_string(),
                    )),
                }
            }
        }
    }

    /// Context first, then mappings, then the step row: a crash in between
    /// leaves the step Running and it is re-dispatched on resume.
    async fn record_success(
        &self,
        execution: &mut ChainExecution,
        context: &mut ExecutionContext,
        mut record: StepExecution,
        key: String,
        output: ActionOutput,
        duration_ms: u64,
    ) -> Result<(), ChainError> {
        context.insert_step_output(&record.step_alias, output.payload.clone());
        execution.context = context.as_value().clone();
        self.store.update_execution(execution).await?;

        if !output.entities.is_empty() {
            // A re-dispatched step may have recorded some of these already
            let recorded = self.store.mappings_for_execution(execution.id).await?;
            for entity in &output.entities {
                let known = recorded.iter().any(|m| {
                    m.step_alias == record.step_alias
                        && m.entity_id == entity.entity_id
                        && m.entity_type == entity.entity_type
                });
                if known {
                    debug!(entity_id = %entity.entity_id, "Entity already recorded");
                    continue;
                }
                let mapping = ChainEntityMapping::record(execution.id, &record.step_alias, entity);
                self.store.append_mapping(&mapping).await?;
            }
        }

        record.output_payload = Some(output.payload);
        record.error_message = None;
        record.transition_to(StepStatus::Succeeded)?;
        self.save_step(execution, &record).await?;

        info!(duration_ms, entities = output.entities.len(), "Step succeeded");
        self.emit(
            ExecutionEvent::new(
                execution.id,
                Some(record.step_alias.clone()),
                EventType::StepSucceeded,
                key,
                format!(
                    "Step '{}' succeeded in {}ms with {} entities",
                    record.step_alias,
                    duration_ms,
                    output.entities.len()
                ),
            )
            .with_duration(duration_ms),
        )
        .await;
        Ok(())
    }

    async fn fail_step(
        &self,
        execution: &mut ChainExecution,
        mut record: StepExecution,
        key: String,
        message: String,
        duration_ms: Option<u64>,
    ) -> Result<StepOutcome, ChainError> {
        record.error_message = Some(message.clone());
        record.transition_to(StepStatus::Failed)?;
        self.save_step(execution, &record).await?;

        let mut event = ExecutionEvent::new(
            execution.id,
            Some(record.step_alias.clone()),
            EventType::StepFailed,
            key,
            format!(
                "Step '{}' failed after {} retries",
                record.step_alias, record.retry_count
            ),
        )
        .with_error(message.clone());
        if let Some(duration_ms) = duration_ms {
            event = event.with_duration(duration_ms);
        }
        self.emit(event).await;

        Ok(StepOutcome::Failed(message))
    }

    async fn complete_execution(
        &self,
        mut execution: ChainExecution,
        started: Instant,
    ) -> Result<ChainExecution, ChainError> {
        execution.transition_to(ExecutionStatus::Completed)?;
        self.store.update_execution(&execution).await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            duration_ms,
            succeeded = execution.count_steps(StepStatus::Succeeded),
            skipped = execution.count_steps(StepStatus::Skipped),
            "Execution completed"
        );
        self.emit(
            ExecutionEvent::new(
                execution.id,
                None,
                EventType::ExecutionCompleted,
                execution.id.to_string(),
                format!(
                    "Execution completed: {} steps succeeded, {} skipped",
                    execution.count_steps(StepStatus::Succeeded),
                    execution.count_steps(StepStatus::Skipped)
                ),
            )
            .with_duration(duration_ms),
        )
        .await;
        Ok(execution)
    }

    async fn cancel_execution(
        &self,
        mut execution: ChainExecution,
    ) -> Result<ChainExecution, ChainError> {
        execution.error_message = Some("cancelled".to_string());
        execution.transition_to(ExecutionStatus::Cancelled)?;
        self.store.update_execution(&execution).await?;

        info!("Execution cancelled");
        self.emit(ExecutionEvent::new(
            execution.id,
            None,
            EventType::ExecutionCancelled,
            execution.id.to_string(),
            "Execution cancelled".to_string(),
        ))
        .await;
        Ok(execution)
    }

    /// Mark the execution failed, then compensate in reverse step order.
    ///
    /// Compensation is best effort: every eligible step is attempted and the
    /// individual failures are appended to the execution's error message.
    #[instrument(skip_all, fields(failed_step = ?failed_step_alias))]
    async fn fail_execution(
        &self,
        definition: &ChainDefinition,
        mut execution: ChainExecution,
        failed_step_alias: Option<String>,
        message: String,
    ) -> Result<ChainExecution, ChainError> {
        execution.error_message = Some(message.clone());
        execution.failed_step_alias = failed_step_alias;
        execution.transition_to(ExecutionStatus::Failed)?;
        self.store.update_execution(&execution).await?;

        error!(error = %message, "Execution failed");
        self.emit(
            ExecutionEvent::new(
                execution.id,
                execution.failed_step_alias.clone(),
                EventType::ExecutionFailed,
                execution.id.to_string(),
                "Execution failed".to_string(),
            )
            .with_error(message.clone()),
        )
        .await;

        self.compensate(definition, execution).await
    }

    /// Succeeded compensatable steps, latest position first
    pub fn pending_compensation(
        definition: &ChainDefinition,
        execution: &ChainExecution,
    ) -> Vec<StepExecution> {
        let mut pending: Vec<StepExecution> = execution
            .step_executions
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .filter(|s| {
                definition
                    .step(&s.step_alias)
                    .map_or(false, |step| step.is_compensatable)
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.position.cmp(&a.position));
        pending
    }

    /// Walk back a `Failed` or `Compensating` execution.
    ///
    /// Every pending step is attempted even when earlier ones fail. If a
    /// step's outcome cannot be persisted the execution stays `Compensating`
    /// and the store error is returned after the walk, so a resume retries
    /// the steps still `Succeeded`.
    #[instrument(skip_all, fields(execution_id = %execution.id))]
    pub async fn compensate(
        &self,
        definition: &ChainDefinition,
        mut execution: ChainExecution,
    ) -> Result<ChainExecution, ChainError> {
        let to_compensate = Self::pending_compensation(definition, &execution);

        let status = execution.status;
        match status {
            ExecutionStatus::Failed if to_compensate.is_empty() => return Ok(execution),
            ExecutionStatus::Failed => {
                execution.transition_to(ExecutionStatus::Compensating)?;
                self.store.update_execution(&execution).await?;
                info!(steps = to_compensate.len(), "Starting compensation");
                self.emit(ExecutionEvent::new(
                    execution.id,
                    None,
                    EventType::CompensationStarted,
                    execution.id.to_string(),
                    format!("Compensating {} steps", to_compensate.len()),
                ))
                .await;
            }
            ExecutionStatus::Compensating => {
                info!(steps = to_compensate.len(), "Continuing compensation");
            }
            other => {
                return Err(ChainError::IllegalTransition {
                    from: other.to_string(),
                    to: ExecutionStatus::Compensating.to_string(),
                })
            }
        }

        let message = execution.error_message.clone().unwrap_or_default();
        // Failures recorded by an earlier, interrupted walk
        let mut errors: Vec<String> = execution
            .step_executions
            .iter()
            .filter(|s| s.status == StepStatus::CompensationFailed)
            .map(|s| {
                format!(
                    "{}: {}",
                    s.step_alias,
                    s.error_message.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();
        let mut unrecorded = None;

        let mut mappings = self.store.mappings_for_execution(execution.id).await;
        for record in to_compensate {
            if mappings.is_err() {
                mappings = self.store.mappings_for_execution(execution.id).await;
            }
            let entities: Result<Vec<ChainEntityMapping>, String> = match &mappings {
                Ok(all) => Ok(all
                    .iter()
                    .filter(|m| m.step_alias == record.step_alias)
                    .cloned()
                    .collect()),
                Err(e) => Err(format!("entity lookup failed: {}", e)),
            };

            let alias = record.step_alias.clone();
            let (failure, persisted) = self
                .compensate_step(definition, &mut execution, record, entities)
                .await;
            if let Some(failure) = failure {
                errors.push(format!("{}: {}", alias, failure));
            }
            if let Err(e) = persisted {
                unrecorded = Some(e);
            }
        }

        if let Some(e) = unrecorded {
            error!(error = %e, "Compensation outcome not persisted, execution left compensating");
            return Err(e);
        }

        if !errors.is_empty() {
            execution.error_message = Some(format!(
                "{}; compensation errors: {}",
                message,
                errors.join(", ")
            ));
        }
        execution.transition_to(ExecutionStatus::Compensated)?;
        self.store.update_execution(&execution).await?;

        info!(failures = errors.len(), "Compensation finished");
        let mut event = ExecutionEvent::new(
            execution.id,
            None,
            EventType::ExecutionCompensated,
            execution.id.to_string(),
            format!("Compensation finished with {} failures", errors.len()),
        );
        if let Some(message) = &execution.error_message {
            event = event.with_error(message.clone());
        }
        self.emit(event).await;

        Ok(execution)
    }

    /// Returns the failure message if the compensation did not succeed,
    /// and whether the step's new status reached the store
    #[instrument(skip_all, fields(alias = %record.step_alias))]
    async fn compensate_step(
        &self,
        definition: &ChainDefinition,
        execution: &mut ChainExecution,
        mut record: StepExecution,
        entities: Result<Vec<ChainEntityMapping>, String>,
    ) -> (Option<String>, Result<(), ChainError>) {
        let key = format!(
            "{}:compensate",
            generate_idempotency_key(execution.id, &record.step_alias)
        );
        let started = Instant::now();

        let outcome = match (entities, self.resolve_compensation(definition, &record)) {
            (Ok(entities), Ok(descriptor)) => {
                let invocation = ActionInvocation {
                    execution_id: execution.id,
                    step_alias: record.step_alias.clone(),
                    idempotency_key: key.clone(),
                    input: json!({
                        "output": record.output_payload.clone().unwrap_or_default(),
                        "entities": entities,
                    }),
                    cancel: CancellationToken::new(),
                };
                self.invoke_compensation(&descriptor, invocation).await
            }
            (Err(message), _) | (_, Err(message)) => Err(message),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                let persisted = self
                    .settle_step(execution, &mut record, StepStatus::Compensated)
                    .await;
                if let Err(e) = persisted {
                    error!(error = %e, "Step compensated but not recorded");
                    let message = format!("not recorded: {}", e);
                    return (Some(message), Err(e));
                }

                info!(duration_ms, "Step compensated");
                self.emit(
                    ExecutionEvent::new(
                        execution.id,
                        Some(record.step_alias.clone()),
                        EventType::StepCompensated,
                        key,
                        format!("Step '{}' compensated", record.step_alias),
                    )
                    .with_duration(duration_ms),
                )
                .await;
                (None, Ok(()))
            }
            Err(message) => {
                record.error_message = Some(message.clone());
                let persisted = self
                    .settle_step(execution, &mut record, StepStatus::CompensationFailed)
                    .await;
                if let Err(e) = &persisted {
                    error!(error = %e, "Compensation failure not recorded");
                }

                warn!(error = %message, "Compensation failed, continuing");
                self.emit(
                    ExecutionEvent::new(
                        execution.id,
                        Some(record.step_alias.clone()),
                        EventType::CompensationFailed,
                        key,
                        format!("Compensation of step '{}' failed", record.step_alias),
                    )
                    .with_duration(duration_ms)
                    .with_error(message.clone()),
                )
                .await;
                (Some(message), persisted)
            }
        }
    }

    fn resolve_compensation(
        &self,
        definition: &ChainDefinition,
        record: &StepExecution,
    ) -> Result<ActionDescriptor, String> {
        let step = definition
            .step(&record.step_alias)
            .ok_or_else(|| format!("step '{}' is not in the definition", record.step_alias))?;
        let action_type = step
            .compensation_action_type
            .as_deref()
            .ok_or_else(|| "no compensation action configured".to_string())?;

        self.actions
            .resolve_latest(action_type, &step.module)
            .ok_or_else(|| {
                format!(
                    "compensation action {}.{} is not registered",
                    step.module, action_type
                )
            })
    }

    /// Compensation runs to the end even if the execution was cancelled,
    /// so it gets a token of its own.
    async fn invoke_compensation(
        &self,
        descriptor: &ActionDescriptor,
        invocation: ActionInvocation,
    ) -> Result<(), String> {
        let cancel = invocation.cancel.clone();
        let mut retries = 0u32;

        loop {
            match self.dispatch(descriptor, invocation.clone(), &cancel).await {
                Dispatch::Output(_) => return Ok(()),
                Dispatch::Failed(failure)
                    if failure.is_transient() && self.retry_policy.should_retry(retries) =>
                {
                    retries += 1;
                    let delay = self.retry_policy.delay_for_retry(retries);
                    warn!(
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Compensation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Dispatch::Failed(failure) => return Err(failure.to_string()),
                Dispatch::Cancelled => return Err("cancelled".to_string()),
            }
        }
    }

    async fn settle_step(
        &self,
        execution: &mut ChainExecution,
        record: &mut StepExecution,
        status: StepStatus,
    ) -> Result<(), ChainError> {
        record.transition_to(status)?;
        self.save_step(execution, record).await
    }

    async fn save_step(
        &self,
        execution: &mut ChainExecution,
        record: &StepExecution,
    ) -> Result<(), ChainError> {
        self.store.upsert_step_execution(record).await?;
        execution.upsert_step_execution(record.clone());
        Ok(())
    }

    /// Deliver an event to every observer; observer failures only get logged
    pub(crate) async fn emit(&self, event: ExecutionEvent) {
        for observer in &self.observers {
            if let Err(e) = observer.on_event(&event).await {
                warn!(error = %e, event_type = ?event.event_type, "Observer failed");
            }
        }
    }
}
