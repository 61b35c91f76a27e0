//! Test-only fakes for the orchestrator's collaborators.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use anyhow::{Result, anyhow};

use crate::core::plan::Plan;
use crate::io::model::{CodeGenerator, Planner};
use crate::io::recorder::{ExecutionRecord, ExecutionRecorder};
use crate::io::runtime::InterpreterRuntime;
use crate::io::sandbox::SessionState;

/// Planner that returns a fixed plan (or a fixed error) and counts calls.
pub struct ScriptedPlanner {
    outcome: Result<Plan, String>,
    calls: Cell<usize>,
}

impl ScriptedPlanner {
    pub fn plan(plan: Plan) -> Self {
        Self {
            outcome: Ok(plan),
            calls: Cell::new(0),
        }
    }

    /// Skippable steps with the given descriptions.
    pub fn steps<const N: usize>(descriptions: [&str; N]) -> Self {
        Self::plan(Plan::from_descriptions(descriptions))
    }

    pub fn failing(message: &str) -> Self {
        Self {
            outcome: Err(message.to_string()),
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl Planner for ScriptedPlanner {
    fn plan(&self, _request: &str) -> Result<Plan> {
        self.calls.set(self.calls.get() + 1);
        self.outcome.clone().map_err(|message| anyhow!(message))
    }
}

/// Generator that replays queued responses. The last response repeats once
/// the queue runs dry.
pub struct ScriptedGenerator {
    responses: RefCell<VecDeque<Result<String, String>>>,
    last: RefCell<Option<Result<String, String>>>,
    prior_errors: RefCell<Vec<Option<String>>>,
}

impl ScriptedGenerator {
    pub fn with_responses(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            last: RefCell::new(None),
            prior_errors: RefCell::new(Vec::new()),
        }
    }

    pub fn sequence<const N: usize>(codes: [&str; N]) -> Self {
        Self::with_responses(codes.iter().map(|code| Ok(code.to_string())).collect())
    }

    pub fn repeating(code: &str) -> Self {
        Self::sequence([code])
    }

    /// `prior_error` passed to each call, in call order.
    pub fn prior_errors(&self) -> Vec<Option<String>> {
        self.prior_errors.borrow().clone()
    }
}

impl CodeGenerator for ScriptedGenerator {
    fn generate(&self, _step_description: &str, prior_error: Option<&str>) -> Result<String> {
        self.prior_errors
            .borrow_mut()
            .push(prior_error.map(str::to_string));
        let next = self.responses.borrow_mut().pop_front();
        let response = match next {
            Some(response) => {
                *self.last.borrow_mut() = Some(response.clone());
                response
            }
            None => self
                .last
                .borrow()
                .clone()
                .ok_or_else(|| anyhow!("no scripted response"))?,
        };
        response.map_err(|message| anyhow!(message))
    }
}

/// Owned copy of the interesting parts of an [`ExecutionRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedAttempt {
    pub step_number: usize,
    pub attempt: u32,
    pub code: String,
    pub fix_applied: bool,
    pub valid: bool,
    pub state: Option<SessionState>,
    pub error: Option<String>,
}

/// Recorder that keeps attempts in memory, or fails every write.
#[derive(Default)]
pub struct MemoryRecorder {
    records: RefCell<Vec<RecordedAttempt>>,
    fail: bool,
}

impl MemoryRecorder {
    pub fn failing() -> Self {
        Self {
            records: RefCell::new(Vec::new()),
            fail: true,
        }
    }

    pub fn records(&self) -> Vec<RecordedAttempt> {
        self.records.borrow().clone()
    }
}

impl ExecutionRecorder for MemoryRecorder {
    fn record(&self, record: &ExecutionRecord<'_>) -> Result<()> {
        if self.fail {
            return Err(anyhow!("recorder unavailable"));
        }
        self.records.borrow_mut().push(RecordedAttempt {
            step_number: record.step_number,
            attempt: record.attempt,
            code: record.code.to_string(),
            fix_applied: record.fix_applied,
            valid: record.validation.is_valid(),
            state: record.session.map(|session| session.state()),
            error: record.error.map(str::to_string),
        });
        Ok(())
    }
}

/// Runtime that ignores the script content and runs `argv` with the script
/// path appended. `["true"]` always succeeds; `["sh", "-c", ...]` runs a fixed
/// command.
pub fn runtime_running(argv: &[&str]) -> InterpreterRuntime {
    let command: Vec<String> = argv.iter().map(|arg| arg.to_string()).collect();
    InterpreterRuntime::new(&command, "main.py").expect("test runtime")
}
