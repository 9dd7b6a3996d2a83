//! Core orchestration logic.
//!
//! This module contains:
//! - Validation: definition checks against the catalogs
//! - Expression: context, input mappings and conditions
//! - Retry/Safety: engine-level policies
//! - Journal: Append-only execution event log
//! - Executor: the per-execution step loop and compensation walk
//! - Engine: trigger dispatch, cancellation and resume
//! - Service: authoring commands and queries

pub mod engine;
pub mod executor;
pub mod expression;
pub mod journal;
pub mod retry;
pub mod safety;
pub mod service;
pub mod validation;

// Re-export commonly used types
pub use engine::{Engine, TriggerDispatcher};
pub use executor::StepExecutor;
pub use expression::{evaluate, resolve_mappings, ExecutionContext};
pub use journal::{generate_idempotency_key, hash_payload, ExecutionObserver, Journal};
pub use retry::RetryPolicy;
pub use safety::{SafetyLimits, SafetyViolation};
pub use service::ChainService;
pub use validation::validate;
