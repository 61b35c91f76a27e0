//! I/O for pipeline commands: processes, sandboxes, model calls, config, records.

pub mod config;
pub mod model;
pub mod process;
pub mod prompt;
pub mod recorder;
pub mod runtime;
pub mod sandbox;
