//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data (request text, program text, error strings) and return deterministic
//! outputs suitable for tests.

pub mod ethics;
pub mod plan;
pub mod retry;
pub mod retry_limit;
pub mod validator;
