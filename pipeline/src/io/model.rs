//! Planner and code-generator abstractions over a language-model CLI.
//!
//! The [`Planner`] and [`CodeGenerator`] traits decouple orchestration from the
//! model backend. The command adapters spawn a configured CLI that reads the
//! prompt on stdin and answers on stdout. Tests use scripted fakes from
//! `test_support` that never spawn processes.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::validator_for;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::plan::{Plan, PlanStep};
use crate::io::process::{Termination, run_command_with_timeout};
use crate::io::prompt::PromptEngine;

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan_output.schema.json");

/// Turns a request into ordered steps.
pub trait Planner {
    fn plan(&self, request: &str) -> Result<Plan>;
}

/// Produces program text for one step, optionally informed by the previous failure.
pub trait CodeGenerator {
    fn generate(&self, step_description: &str, prior_error: Option<&str>) -> Result<String>;
}

/// A model CLI invocation: argv, timeout, and output cap.
#[derive(Debug, Clone)]
pub struct ModelCommand {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: CancelToken,
}

impl ModelCommand {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Result<Self> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            bail!("model command must be a non-empty array");
        }
        Ok(Self {
            command,
            timeout,
            output_limit_bytes,
            cancel: CancelToken::new(),
        })
    }

    /// Kill in-flight model calls when `cancel` fires.
    pub fn with_cancel(self, cancel: CancelToken) -> Self {
        Self { cancel, ..self }
    }

    /// Send `prompt` on stdin and return stdout.
    #[instrument(skip_all, fields(program = %self.command[0], timeout_secs = self.timeout.as_secs()))]
    pub fn complete(&self, prompt: &str) -> Result<String> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
            &self.cancel,
        )
        .context("run model command")?;

        match output.termination {
            Termination::TimedOut => {
                bail!("model command timed out after {:?}", self.timeout)
            }
            Termination::Killed => bail!("model command cancelled"),
            Termination::Exited => {}
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(exit_code = ?output.status.code(), "model command failed");
            bail!(
                "model command failed with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            );
        }
        debug!(bytes = output.stdout.len(), "model command completed");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Planner that asks a model CLI for a JSON plan.
pub struct CommandPlanner {
    model: ModelCommand,
    prompts: PromptEngine,
}

impl CommandPlanner {
    pub fn new(model: ModelCommand, prompts: PromptEngine) -> Self {
        Self { model, prompts }
    }
}

impl Planner for CommandPlanner {
    fn plan(&self, request: &str) -> Result<Plan> {
        let prompt = self.prompts.render_planner(request)?;
        let raw = self.model.complete(&prompt)?;
        let plan = parse_plan_output(&raw)?;
        info!(steps = plan.len(), "planner produced plan");
        Ok(plan)
    }
}

/// Code generator that asks a model CLI for a script.
pub struct CommandGenerator {
    model: ModelCommand,
    prompts: PromptEngine,
}

impl CommandGenerator {
    pub fn new(model: ModelCommand, prompts: PromptEngine) -> Self {
        Self { model, prompts }
    }
}

impl CodeGenerator for CommandGenerator {
    fn generate(&self, step_description: &str, prior_error: Option<&str>) -> Result<String> {
        let prompt = self.prompts.render_generator(step_description, prior_error)?;
        let raw = self.model.complete(&prompt)?;
        let code = extract_code(&raw);
        if code.trim().is_empty() {
            bail!("model returned no code");
        }
        Ok(code)
    }
}

#[derive(Debug, Deserialize)]
struct PlanOutput {
    steps: Vec<PlanOutputStep>,
}

#[derive(Debug, Deserialize)]
struct PlanOutputStep {
    description: String,
    #[serde(default = "default_skippable")]
    skippable: bool,
}

fn default_skippable() -> bool {
    true
}

/// Parse a planner reply: the first `{...}` object in the text, schema-checked.
pub fn parse_plan_output(raw: &str) -> Result<Plan> {
    let start = raw.find('{').ok_or_else(|| anyhow!("planner output has no JSON object"))?;
    let end = raw
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| anyhow!("planner output has no JSON object"))?;
    let value: Value =
        serde_json::from_str(&raw[start..=end]).context("parse planner output json")?;

    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(&value) {
        let messages = compiled
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        bail!("plan schema validation failed: {}", messages.join("; "));
    }

    let output: PlanOutput = serde_json::from_value(value).context("deserialize plan")?;
    let steps = output
        .steps
        .into_iter()
        .map(|step| PlanStep {
            skippable: step.skippable,
            ..PlanStep::new(0, step.description.trim())
        })
        .collect();
    Ok(Plan::new(steps))
}

/// Body of the first fenced code block, or the whole reply when unfenced.
pub fn extract_code(raw: &str) -> String {
    let body = match raw.find("```") {
        Some(open) => {
            let after_fence = &raw[open + 3..];
            // Skip the info string (`python`, `py`, ...).
            let body_start = after_fence.find('\n').map_or(after_fence.len(), |idx| idx + 1);
            let body = &after_fence[body_start..];
            body.find("```").map_or(body, |close| &body[..close])
        }
        None => raw,
    };
    let mut code = body.trim_matches('\n').to_string();
    code.push('\n');
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::StepStatus;

    #[test]
    fn parses_fenced_plan_output() {
        let raw = "Here is the plan:\n```json\n{\"steps\": [{\"description\": \" find files \"}, {\"description\": \"zip them\", \"skippable\": false}]}\n```\n";
        let plan = parse_plan_output(raw).expect("plan");
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.steps()[0].description, "find files");
        assert!(plan.steps()[0].skippable);
        assert!(!plan.steps()[1].skippable);
        assert_eq!(plan.steps()[1].step_number, 2);
        assert_eq!(plan.steps()[1].status, StepStatus::Pending);
    }

    #[test]
    fn rejects_plan_that_violates_schema() {
        let err = parse_plan_output("{\"steps\": [{\"title\": \"x\"}]}").unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
        assert!(parse_plan_output("no json here").is_err());
    }

    #[test]
    fn extracts_code_from_fence() {
        let raw = "Sure:\n```python\nprint('hi')\n```\nDone.";
        assert_eq!(extract_code(raw), "print('hi')\n");
        assert_eq!(extract_code("print(1)"), "print(1)\n");
    }

    #[cfg(unix)]
    #[test]
    fn model_command_feeds_prompt_on_stdin() {
        let model = ModelCommand::new(
            vec!["sh".to_string(), "-c".to_string(), "cat".to_string()],
            Duration::from_secs(5),
            1024,
        )
        .expect("model");
        assert_eq!(model.complete("hello").expect("complete"), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn model_command_failure_is_an_error() {
        let model = ModelCommand::new(
            vec!["sh".to_string(), "-c".to_string(), "echo nope >&2; exit 2".to_string()],
            Duration::from_secs(5),
            1024,
        )
        .expect("model");
        let err = model.complete("hello").unwrap_err();
        assert!(format!("{err:#}").contains("nope"));
    }
}
