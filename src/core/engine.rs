//! Engine: turns trigger events into running chain executions.
//!
//! Each matching definition gets its own execution and its own tokio task.
//! Executions of the same definition run independently; only the steps
//! inside one execution are ordered.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::domain::{
    ChainDefinition, ChainExecution, ChainExecutionId, EventType, ExecutionEvent, ExecutionStatus,
    FamilyId, TriggerEvent,
};
use crate::error::{ChainError, StoreError};
use crate::store::ChainStore;

use super::executor::StepExecutor;
use super::expression::ExecutionContext;

/// Entry point the surrounding event bus calls for every trigger occurrence
#[async_trait]
pub trait TriggerDispatcher: Send + Sync {
    /// Start one execution per matching enabled definition and return
    /// their ids. Redelivered occurrences start nothing.
    async fn on_trigger(&self, event: TriggerEvent) -> Result<Vec<ChainExecutionId>, ChainError>;
}

struct RunningExecution {
    handle: JoinHandle<Result<ChainExecution, ChainError>>,
    cancel: CancellationToken,
}

pub struct Engine {
    store: Arc<dyn ChainStore>,
    executor: Arc<StepExecutor>,
    shutdown: CancellationToken,
    running: Mutex<HashMap<ChainExecutionId, RunningExecution>>,
}

impl Engine {
    pub fn new(executor: StepExecutor) -> Self {
        Self {
            store: Arc::clone(executor.store()),
            executor: Arc::new(executor),
            shutdown: CancellationToken::new(),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ChainStore> {
        &self.store
    }

    /// Fire a trigger and wait for every started execution to finish
    pub async fn dispatch_and_wait(
        &self,
        event: TriggerEvent,
    ) -> Result<Vec<ChainExecution>, ChainError> {
        let ids = self.on_trigger(event).await?;
        let mut finished = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(execution) = self.join(id).await? {
                finished.push(execution);
            }
        }
        Ok(finished)
    }

    /// Wait for a spawned execution. `None` if this engine is not tracking it.
    pub async fn join(&self, id: ChainExecutionId) -> Result<Option<ChainExecution>, ChainError> {
        let running = self.running.lock().await.remove(&id);
        match running {
            Some(running) => running
                .handle
                .await
                .map_err(|e| ChainError::Task(e.to_string()))?
                .map(Some),
            None => Ok(None),
        }
    }

    /// Forget finished executions nobody joined; returns how many
    pub async fn reap(&self) -> usize {
        let mut running = self.running.lock().await;
        let before = running.len();
        running.retain(|_, r| !r.handle.is_finished());
        before - running.len()
    }

    /// Request cancellation of a running execution; false if not tracked
    pub async fn cancel(&self, id: ChainExecutionId) -> bool {
        let running = self.running.lock().await;
        match running.get(&id) {
            Some(execution) => {
                info!(execution_id = %id, "Cancelling execution");
                execution.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running execution and wait for the tasks to wind down
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let drained: Vec<(ChainExecutionId, RunningExecution)> =
            self.running.lock().await.drain().collect();

        for (id, running) in drained {
            match running.handle.await {
                Ok(Ok(execution)) => {
                    info!(execution_id = %id, status = %execution.status, "Execution stopped")
                }
                Ok(Err(e)) => warn!(execution_id = %id, error = %e, "Execution ended with error"),
                Err(e) => error!(execution_id = %id, error = %e, "Execution task panicked"),
            }
        }
    }

    /// Continue an interrupted execution.
    ///
    /// For a `Running` execution succeeded and skipped steps are kept and a
    /// step left `Running` is dispatched again under the same idempotency
    /// key. A `Compensating` execution, or a `Failed` one with steps still
    /// to undo, resumes its compensation walk.
    #[instrument(skip(self), fields(execution_id = %id))]
    pub async fn resume(
        &self,
        family_id: FamilyId,
        id: ChainExecutionId,
    ) -> Result<ChainExecution, ChainError> {
        let execution = self
            .store
            .get_execution(family_id, id)
            .await?
            .ok_or(ChainError::ExecutionNotFound(id))?;

        let next = match execution.status {
            ExecutionStatus::Running => ExecutionStatus::Running,
            ExecutionStatus::Failed | ExecutionStatus::Compensating => {
                ExecutionStatus::Compensating
            }
            other => {
                return Err(ChainError::IllegalTransition {
                    from: other.to_string(),
                    to: ExecutionStatus::Running.to_string(),
                })
            }
        };

        {
            let running = self.running.lock().await;
            if running.get(&id).map_or(false, |r| !r.handle.is_finished()) {
                return Err(ChainError::AlreadyRunning(id));
            }
        }

        let definition = self
            .store
            .get_definition(family_id, execution.chain_definition_id)
            .await?
            .ok_or(ChainError::DefinitionNotFound(execution.chain_definition_id))?;

        if execution.status == ExecutionStatus::Failed
            && StepExecutor::pending_compensation(&definition, &execution).is_empty()
        {
            return Err(ChainError::IllegalTransition {
                from: execution.status.to_string(),
                to: next.to_string(),
            });
        }

        info!(
            status = %execution.status,
            settled = execution
                .step_executions
                .iter()
                .filter(|s| s.status.is_settled())
                .count(),
            "Resuming execution"
        );
        self.executor
            .emit(ExecutionEvent::new(
                id,
                None,
                EventType::ExecutionResumed,
                id.to_string(),
                format!("Execution of '{}' resumed", definition.name),
            ))
            .await;

        self.spawn(definition, execution).await;
        self.join(id)
            .await?
            .ok_or(ChainError::ExecutionNotFound(id))
    }

    async fn spawn(&self, definition: ChainDefinition, execution: ChainExecution) {
        let id = execution.id;
        let cancel = self.shutdown.child_token();
        let token = cancel.clone();
        let executor = Arc::clone(&self.executor);

        let handle = tokio::spawn(async move { executor.run(&definition, execution, token).await });

        self.running
            .lock()
            .await
            .insert(id, RunningExecution { handle, cancel });
    }
}

#[async_trait]
impl TriggerDispatcher for Engine {
    #[instrument(skip_all, fields(event_type = %event.event_type, module = %event.module, correlation_id = %event.correlation_id))]
    async fn on_trigger(&self, event: TriggerEvent) -> Result<Vec<ChainExecutionId>, ChainError> {
        let definitions = self
            .store
            .find_enabled_by_trigger(event.family_id, &event.event_type, &event.module)
            .await?;

        let mut started = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let mut execution = ChainExecution::pending(definition.id, &event);
            execution.transition_to(ExecutionStatus::Running)?;
            execution.context = ExecutionContext::for_execution(&execution).into_value();

            match self.store.insert_execution(&execution).await {
                Ok(()) => {}
                Err(StoreError::DuplicateExecution { .. }) => {
                    info!(definition = %definition.name, "Trigger already handled, ignoring redelivery");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            info!(execution_id = %execution.id, definition = %definition.name, "Execution started");
            self.executor
                .emit(ExecutionEvent::new(
                    execution.id,
                    None,
                    EventType::ExecutionStarted,
                    execution.id.to_string(),
                    format!(
                        "Chain '{}' started by {}/{}",
                        definition.name, event.module, event.event_type
                    ),
                ))
                .await;

            started.push(execution.id);
            self.spawn(definition, execution).await;
        }

        Ok(started)
    }
}
