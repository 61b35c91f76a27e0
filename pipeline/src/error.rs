//! Typed errors that callers are expected to match on.
//!
//! Everything else in the crate returns `anyhow::Result` with context chains;
//! these enums cover the cases where the caller's recovery depends on *which*
//! failure happened.

use thiserror::Error;
use uuid::Uuid;

use crate::io::sandbox::SessionState;

/// Invalid construction parameters. Fatal, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_retries must be > 0")]
    MaxRetries,

    #[error("error_repeat_threshold must be > 1 (got {0})")]
    RepeatThreshold(usize),

    #[error("error_repeat_threshold {threshold} exceeds error history capacity {capacity}")]
    ThresholdExceedsHistory { threshold: usize, capacity: usize },

    #[error("{0}")]
    Invalid(String),
}

/// Sandbox contract violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    /// `run` was called on a session that already left `CREATED`.
    #[error("sandbox session {id} cannot run from state {state}")]
    NotRunnable { id: Uuid, state: SessionState },
}
