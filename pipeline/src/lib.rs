//! Guarded execution pipeline for generated automation scripts.
//!
//! A request passes an ethical gate, is planned into steps, and each step's
//! generated program is statically validated before it runs in a time-boxed
//! sandbox. Failed attempts are retried with bounded, loop-aware retries.
//!
//! - **[`core`]**: Pure, deterministic logic (ethical gate, validator, retry
//!   bookkeeping, plans). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (processes, sandboxes, model calls,
//!   config, attempt records). Isolated behind traits to enable fakes in tests.
//!
//! [`orchestrator`] coordinates core logic with I/O to handle one request.

pub mod cancel;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
