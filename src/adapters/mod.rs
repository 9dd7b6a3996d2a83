//! Action implementations that ship with the engine.
//!
//! Domain modules register their own executors against the
//! `ActionRegistry`; the ones here belong to the `core` module.

pub mod builtin;

pub use builtin::{register_builtin, DiscardEntity, Echo, Fail, RecordEntity, Wait, CORE_MODULE};
