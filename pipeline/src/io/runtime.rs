//! How a sandbox turns a script file into a process.

use std::path::Path;
use std::process::Command;

use anyhow::{Result, anyhow};

/// Builds the command that runs a script inside a sandbox workspace.
pub trait Runtime {
    /// File name the script is written to inside the workspace.
    fn script_name(&self) -> &str;

    /// Command that executes `script` with `workdir` as its working directory.
    fn command(&self, script: &Path, workdir: &Path) -> Command;
}

/// Runs the script with an interpreter: `<program> <args...> <script>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterRuntime {
    program: String,
    args: Vec<String>,
    script_name: String,
}

impl InterpreterRuntime {
    /// `command` is the interpreter argv, e.g. `["python3", "-I"]`.
    pub fn new(command: &[String], script_name: impl Into<String>) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("runtime command must not be empty"))?;
        if program.trim().is_empty() {
            return Err(anyhow!("runtime command must name a program"));
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            script_name: script_name.into(),
        })
    }

    pub fn python() -> Self {
        Self {
            program: "python3".to_string(),
            args: Vec::new(),
            script_name: "main.py".to_string(),
        }
    }

    pub fn shell() -> Self {
        Self {
            program: "sh".to_string(),
            args: Vec::new(),
            script_name: "main.sh".to_string(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Runtime for InterpreterRuntime {
    fn script_name(&self) -> &str {
        &self.script_name
    }

    fn command(&self, script: &Path, workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(script).current_dir(workdir);
        cmd
    }
}
