//! event_chains - Saga orchestrator for cross-module family automations
//!
//! A chain reacts to one trigger event (e.g. `calendar/event.created`) by
//! running an ordered list of steps, each dispatching an action in some
//! module. When a step fails, previously succeeded compensatable steps are
//! undone in reverse order.
//!
//! # Architecture
//!
//! - Every execution and step record follows a strict state machine, and
//!   the store refuses writes that break it
//! - Inputs are built from an accumulated context: the trigger payload
//!   plus each succeeded step's output under its alias
//! - Every entity an action reports is recorded in an append-only ledger
//! - Execution events go to observers (the journal keeps them as JSONL)
//!
//! # Modules
//!
//! - `domain`: Definitions, executions, mappings and events
//! - `catalog`: Action and trigger catalogs, payload schemas
//! - `core`: Validation, expressions, executor, engine and service
//! - `store`: Persistence (in-memory and SQLite)
//! - `adapters`: Built-in `core` module actions
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Import a chain and fire its trigger
//! chains import chain.yaml --family <id> --user <id>
//! chains fire --family <id> --event-type event.created --module calendar
//!
//! # Inspect an execution
//! chains status <execution-id> --family <id>
//! ```

pub mod adapters;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod store;

// Re-export main types at crate root for convenience
pub use catalog::{ActionCatalog, ActionExecutor, ActionRegistry, TriggerCatalog, TriggerRegistry};
pub use core::{ChainService, Engine, StepExecutor, TriggerDispatcher};
pub use domain::{
    ChainDefinition, ChainEntityMapping, ChainExecution, ExecutionStatus, StepExecution,
    StepStatus, TriggerEvent,
};
pub use error::{ChainError, ChainValidationError, StoreError};
pub use store::{ChainStore, MemoryStore, SqliteStore};
