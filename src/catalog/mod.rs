//! Catalogs the engine consults: actions (what steps dispatch to) and
//! triggers (what events a chain may react to).

pub mod action;
pub mod schema;
pub mod trigger;

pub use action::{
    ActionCatalog, ActionDescriptor, ActionError, ActionExecutor, ActionInvocation, ActionKey,
    ActionOutput, ActionRegistry,
};
pub use schema::{FieldKind, FieldSchema, Schema, SchemaViolation};
pub use trigger::{TriggerCatalog, TriggerDescriptor, TriggerRegistry};
