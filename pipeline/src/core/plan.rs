//! Ordered plan steps produced by the planner and walked by the orchestrator.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    /// 1-based.
    pub step_number: usize,
    pub description: String,
    pub status: StepStatus,
    /// A failed skippable step does not stop the rest of the plan.
    pub skippable: bool,
}

impl PlanStep {
    pub fn new(step_number: usize, description: impl Into<String>) -> Self {
        Self {
            step_number,
            description: description.into(),
            status: StepStatus::Pending,
            skippable: true,
        }
    }

    pub fn required(self) -> Self {
        Self {
            skippable: false,
            ..self
        }
    }
}

/// Steps in execution order. Only step status changes after planning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    steps: Vec<PlanStep>,
}

impl Plan {
    /// Renumbers steps 1..=n in the given order.
    pub fn new(steps: Vec<PlanStep>) -> Self {
        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(idx, step)| PlanStep {
                step_number: idx + 1,
                ..step
            })
            .collect();
        Self { steps }
    }

    pub fn from_descriptions<I, S>(descriptions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            descriptions
                .into_iter()
                .map(|description| PlanStep::new(0, description))
                .collect(),
        )
    }

    /// Generic three-step plan used when the planner fails or returns nothing.
    pub fn fallback(request: &str) -> Self {
        let request = request.trim();
        Self::from_descriptions([
            format!("Inspect the environment and inputs needed for: {request}"),
            format!("Write and run a script that does: {request}"),
            format!("Verify the result of: {request}"),
        ])
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Set the status of the step at `index` (0-based). Out-of-range indexes
    /// are ignored.
    pub fn set_status(&mut self, index: usize, status: StepStatus) {
        if let Some(step) = self.steps.get_mut(index) {
            step.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_renumbered_in_order() {
        let plan = Plan::new(vec![PlanStep::new(9, "a"), PlanStep::new(3, "b").required()]);
        let numbers: Vec<_> = plan.steps().iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert!(plan.steps()[0].skippable);
        assert!(!plan.steps()[1].skippable);
        assert!(plan.steps().iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn fallback_has_three_generic_steps() {
        let plan = Plan::fallback("  tidy my desktop ");
        assert_eq!(plan.len(), 3);
        assert!(plan.steps()[1].description.ends_with("tidy my desktop"));
    }

    #[test]
    fn set_status_ignores_out_of_range() {
        let mut plan = Plan::from_descriptions(["only"]);
        plan.set_status(0, StepStatus::Running);
        plan.set_status(5, StepStatus::Failed);
        assert_eq!(plan.steps()[0].status, StepStatus::Running);
    }
}
