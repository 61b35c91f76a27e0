//! Stable exit codes for pipeline CLI commands.

/// Command succeeded: request safe, program valid, or every step succeeded.
pub const OK: i32 = 0;
/// Invalid input, config, or program, or any other error.
pub const INVALID: i32 = 1;
/// The ethical gate did not let the request proceed.
pub const REFUSED: i32 = 2;
/// `pipeline run` finished with a failed or cancelled step.
pub const STEP_FAILED: i32 = 3;
