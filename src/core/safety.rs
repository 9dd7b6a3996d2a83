//! Safety limits for chain execution.
//!
//! Prevents runaway automations through limits on:
//! - Number of steps per definition
//! - Step input/output payload sizes
//! - Per-dispatch and whole-run timeouts

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum number of steps per definition (default: 50)
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Maximum serialized size of a step input or output (default: 1MB)
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,

    /// Per-dispatch timeout in seconds (default: 300 = 5 min)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Total run timeout in seconds (default: 3600 = 1 hour)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,
}

fn default_max_steps() -> u32 {
    50
}
fn default_max_payload_bytes() -> u64 {
    1024 * 1024
}
fn default_step_timeout() -> u64 {
    300
}
fn default_run_timeout() -> u64 {
    3600
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_payload_bytes: default_max_payload_bytes(),
            step_timeout_seconds: default_step_timeout(),
            run_timeout_seconds: default_run_timeout(),
        }
    }
}

impl SafetyLimits {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    /// Check a payload against the size limit
    pub fn validate_payload(&self, payload: &Value) -> Result<(), SafetyViolation> {
        let size = serde_json::to_vec(payload).map(|b| b.len()).unwrap_or(0) as u64;
        if size > self.max_payload_bytes {
            return Err(SafetyViolation::MaxPayloadBytes {
                actual: size,
                limit: self.max_payload_bytes,
            });
        }
        Ok(())
    }

    /// Check elapsed run time
    pub fn check_run(&self, started: Instant) -> Result<(), SafetyViolation> {
        let elapsed = started.elapsed().as_secs();
        if elapsed >= self.run_timeout_seconds {
            return Err(SafetyViolation::RunTimeout {
                elapsed_seconds: elapsed,
                limit_seconds: self.run_timeout_seconds,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    #[error("Payload too large: {actual} > {limit} bytes")]
    MaxPayloadBytes { actual: u64, limit: u64 },

    #[error("Step timeout after {limit_seconds}s")]
    StepTimeout { limit_seconds: u64 },

    #[error("Run timeout: {elapsed_seconds}s >= {limit_seconds}s")]
    RunTimeout {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },
}
