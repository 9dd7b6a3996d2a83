//! Domain types for the chain engine.
//!
//! - Definition: authored chains and their steps
//! - Execution: runs, step executions and their state machines
//! - Mapping: the entity mapping ledger rows
//! - Events: execution history emitted to observers

pub mod definition;
pub mod events;
pub mod execution;
pub mod ids;
pub mod mapping;
pub mod trigger;

pub use definition::{ChainDefinition, Condition, NewChainDefinition, Operator, Step};
pub use events::{EventType, ExecutionEvent};
pub use execution::{ChainExecution, ExecutionStatus, StepExecution, StepStatus};
pub use ids::{ChainDefinitionId, ChainExecutionId, CorrelationId, FamilyId, StepExecutionId, UserId};
pub use mapping::{ChainEntityMapping, EntityRef};
pub use trigger::TriggerEvent;
