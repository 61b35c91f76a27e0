//! Prompt rendering for the planner and code-generator model calls.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const GENERATOR_TEMPLATE: &str = include_str!("prompts/generator.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
    timeout_secs: u64,
}

impl PromptEngine {
    /// `timeout_secs` is the sandbox budget quoted to the model.
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("planner", PLANNER_TEMPLATE)
            .context("load planner template")?;
        env.add_template("generator", GENERATOR_TEMPLATE)
            .context("load generator template")?;
        Ok(Self { env, timeout_secs })
    }

    pub fn render_planner(&self, request: &str) -> Result<String> {
        let template = self.env.get_template("planner")?;
        let rendered = template.render(context! {
            request => request.trim(),
            timeout_secs => self.timeout_secs,
        })?;
        Ok(rendered)
    }

    pub fn render_generator(&self, step: &str, prior_error: Option<&str>) -> Result<String> {
        let template = self.env.get_template("generator")?;
        let rendered = template.render(context! {
            step => step.trim(),
            prior_error => prior_error.map(str::trim).filter(|s| !s.is_empty()),
            timeout_secs => self.timeout_secs,
        })?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planner_prompt_includes_request_and_budget() {
        let engine = PromptEngine::new(30).expect("engine");
        let prompt = engine.render_planner("  list my downloads ").expect("render");
        assert!(prompt.contains("\nlist my downloads\n"));
        assert!(prompt.contains("within 30 seconds"));
    }

    #[test]
    fn generator_prompt_mentions_prior_error_only_when_present() {
        let engine = PromptEngine::new(10).expect("engine");
        let first = engine.render_generator("count files", None).expect("render");
        assert!(!first.contains("Previous attempt failed"));

        let retry = engine
            .render_generator("count files", Some("NameError: x"))
            .expect("render");
        assert!(retry.contains("Previous attempt failed"));
        assert!(retry.contains("NameError: x"));

        let blank = engine.render_generator("count files", Some("  ")).expect("render");
        assert!(!blank.contains("Previous attempt failed"));
    }
}
