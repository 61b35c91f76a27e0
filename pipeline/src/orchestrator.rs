//! Request orchestration: ethical gate, planning, and the per-step attempt loop.
//!
//! One [`Orchestrator::handle`] call processes one request synchronously. Steps
//! run in plan order; each step gets its own [`RetryManager`] and every attempt
//! runs in a fresh sandbox session; all sessions of a request share one
//! working directory. Programs with error-severity validation issues never
//! reach the sandbox.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{Span, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::core::ethics::{self, EthicalVerdict};
use crate::core::plan::{Plan, PlanStep, StepStatus};
use crate::core::retry::{RetryManager, StopReason};
use crate::core::retry_limit::parse_retry_limit;
use crate::core::validator::{suggest_fixes, validate};
use crate::error::ConfigError;
use crate::io::config::PipelineConfig;
use crate::io::model::{CodeGenerator, Planner};
use crate::io::recorder::{ExecutionRecord, ExecutionRecorder};
use crate::io::runtime::Runtime;
use crate::io::sandbox::{
    RequestWorkdir, ResourceLimits, Sandbox, SandboxSession, SessionState,
};

/// Retry and sandbox settings for one orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Backstop for attempts per step; a limit stated in the request can only lower it.
    pub max_retries: u32,
    pub error_repeat_threshold: usize,
    pub error_history: usize,
    pub limits: ResourceLimits,
    /// Where programs run. `None`: a private directory per request.
    pub working_dir: Option<PathBuf>,
}

impl OrchestratorConfig {
    pub fn from_pipeline(cfg: &PipelineConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            error_repeat_threshold: cfg.error_repeat_threshold,
            error_history: cfg.error_history,
            limits: cfg.resource_limits(),
            working_dir: cfg.runtime.working_dir.clone(),
        }
    }

    fn retry_manager(&self, max_retries: u32) -> Result<RetryManager, ConfigError> {
        RetryManager::with_history_capacity(
            max_retries,
            self.error_repeat_threshold,
            self.error_history,
        )
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_pipeline(&PipelineConfig::default())
    }
}

/// Why a step stopped without succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepStopReason {
    MaxRetries { max_retries: u32 },
    RepeatedError { threshold: usize },
    /// The failure cannot be fixed by retrying.
    Unfixable,
    Cancelled,
}

impl From<StopReason> for StepStopReason {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::MaxRetries { max_retries } => StepStopReason::MaxRetries { max_retries },
            StopReason::RepeatedError { threshold } => StepStopReason::RepeatedError { threshold },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step_number: usize,
    pub description: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Whether any attempt ran the auto-fixer.
    pub fix_attempted: bool,
    pub stop_reason: Option<StepStopReason>,
    /// Program output of the successful attempt.
    pub stdout: Option<String>,
}

impl StepReport {
    fn new(step: &PlanStep) -> Self {
        Self {
            step_number: step.step_number,
            description: step.description.clone(),
            status: StepStatus::Running,
            attempts: 0,
            last_error: None,
            fix_attempted: false,
            stop_reason: None,
            stdout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub request_id: String,
    /// Final plan, including statuses of steps that never ran.
    pub plan: Plan,
    /// One report per step that started, in plan order.
    pub steps: Vec<StepReport>,
    pub used_fallback_plan: bool,
    pub cancelled: bool,
    /// Attempts allowed per step for this request.
    pub retry_ceiling: u32,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        !self.cancelled
            && self
                .plan
                .steps()
                .iter()
                .all(|step| step.status == StepStatus::Succeeded)
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequestOutcome {
    /// The ethical gate stopped the request; returned verbatim.
    Refused(EthicalVerdict),
    Completed(ExecutionReport),
}

enum AttemptResult {
    Succeeded { stdout: String },
    Failed { error: String },
    Cancelled,
}

struct AttemptOutcome {
    result: AttemptResult,
    fix_attempted: bool,
}

/// Per-attempt identifiers threaded through recording.
struct AttemptContext<'a> {
    request_id: &'a str,
    step: &'a PlanStep,
    workdir: &'a Path,
    attempt: u32,
    prior_error: Option<&'a str>,
    cancel: &'a CancelToken,
}

pub struct Orchestrator<P, G, R, X>
where
    P: Planner,
    G: CodeGenerator,
    R: Runtime,
    X: ExecutionRecorder,
{
    planner: P,
    generator: G,
    sandbox: Sandbox<R>,
    recorder: X,
    config: OrchestratorConfig,
}

impl<P, G, R, X> Orchestrator<P, G, R, X>
where
    P: Planner,
    G: CodeGenerator,
    R: Runtime,
    X: ExecutionRecorder,
{
    /// Fails when the retry settings could never produce a working manager.
    pub fn new(
        planner: P,
        generator: G,
        sandbox: Sandbox<R>,
        recorder: X,
        config: OrchestratorConfig,
    ) -> Result<Self, ConfigError> {
        config.retry_manager(config.max_retries)?;
        Ok(Self {
            planner,
            generator,
            sandbox,
            recorder,
            config,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn recorder(&self) -> &X {
        &self.recorder
    }

    /// Run one request to a refusal or a report.
    #[instrument(skip_all, fields(request_id = tracing::field::Empty))]
    pub fn handle(&self, request: &str, cancel: &CancelToken) -> Result<RequestOutcome> {
        let verdict = ethics::check(request);
        if !verdict.is_safe {
            info!(category = %verdict.category, action = ?verdict.action, "request stopped by ethical gate");
            return Ok(RequestOutcome::Refused(verdict));
        }

        let request_id = Uuid::new_v4().to_string();
        Span::current().record("request_id", request_id.as_str());

        let retry_ceiling = parse_retry_limit(request).ceiling(self.config.max_retries);
        let workdir = RequestWorkdir::open(self.config.working_dir.as_deref())?;
        let (mut plan, used_fallback_plan) = self.plan(request);
        info!(
            steps = plan.len(),
            used_fallback_plan,
            retry_ceiling,
            workdir = %workdir.path().display(),
            "starting plan"
        );

        let mut steps = Vec::with_capacity(plan.len());
        let mut cancelled = false;
        for index in 0..plan.len() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let step = plan.steps()[index].clone();
            plan.set_status(index, StepStatus::Running);

            let report = self.run_step(
                &request_id,
                request,
                &step,
                workdir.path(),
                retry_ceiling,
                cancel,
            )?;
            if report.stop_reason == Some(StepStopReason::Cancelled) {
                // The in-flight step keeps its last recorded status.
                info!(step = step.step_number, "request cancelled");
                steps.push(report);
                cancelled = true;
                break;
            }

            plan.set_status(index, report.status);
            let stop_plan = report.status == StepStatus::Failed && !step.skippable;
            steps.push(report);
            if stop_plan {
                warn!(
                    step = step.step_number,
                    "required step failed, skipping remaining steps"
                );
                for rest in index + 1..plan.len() {
                    plan.set_status(rest, StepStatus::Skipped);
                }
                break;
            }
        }

        Ok(RequestOutcome::Completed(ExecutionReport {
            request_id,
            plan,
            steps,
            used_fallback_plan,
            cancelled,
            retry_ceiling,
        }))
    }

    fn plan(&self, request: &str) -> (Plan, bool) {
        match self.planner.plan(request) {
            Ok(plan) if !plan.is_empty() => (plan, false),
            Ok(_) => {
                warn!("planner returned an empty plan, using fallback plan");
                (Plan::fallback(request), true)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "planner failed, using fallback plan");
                (Plan::fallback(request), true)
            }
        }
    }

    #[instrument(skip_all, fields(step = step.step_number))]
    fn run_step(
        &self,
        request_id: &str,
        request: &str,
        step: &PlanStep,
        workdir: &Path,
        retry_ceiling: u32,
        cancel: &CancelToken,
    ) -> Result<StepReport> {
        let mut retry = self.config.retry_manager(retry_ceiling)?;
        let mut report = StepReport::new(step);
        let mut prior_error: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                report.stop_reason = Some(StepStopReason::Cancelled);
                return Ok(report);
            }
            let attempt = retry.next_attempt();
            report.attempts = attempt;
            info!(attempt, "starting attempt");

            let outcome = self.attempt(&AttemptContext {
                request_id,
                step,
                workdir,
                attempt,
                prior_error: prior_error.as_deref(),
                cancel,
            });
            report.fix_attempted |= outcome.fix_attempted;

            let error = match outcome.result {
                AttemptResult::Succeeded { stdout } => {
                    info!(attempt, "step succeeded");
                    report.status = StepStatus::Succeeded;
                    report.stdout = Some(stdout);
                    return Ok(report);
                }
                AttemptResult::Cancelled => {
                    report.stop_reason = Some(StepStopReason::Cancelled);
                    return Ok(report);
                }
                AttemptResult::Failed { error } => error,
            };

            info!(attempt, error = %error, "attempt failed");
            retry.record_error(&error);
            report.last_error = Some(error.clone());

            if ethics::is_unfixable(request, &error) {
                warn!(attempt, "failure is not fixable by retrying");
                report.status = StepStatus::Failed;
                report.stop_reason = Some(StepStopReason::Unfixable);
                return Ok(report);
            }
            let decision = retry.should_retry();
            if !decision.should_retry {
                warn!(attempt, reason = ?decision.reason, "giving up on step");
                report.status = StepStatus::Failed;
                report.stop_reason = decision.reason.map(StepStopReason::from);
                return Ok(report);
            }
            prior_error = Some(error);
        }
    }

    fn attempt(&self, ctx: &AttemptContext<'_>) -> AttemptOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();

        let code = match self
            .generator
            .generate(&ctx.step.description, ctx.prior_error)
        {
            Ok(code) => code,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "code generation failed");
                return AttemptOutcome {
                    result: AttemptResult::Failed {
                        error: format!("code generation failed: {err:#}"),
                    },
                    fix_attempted: false,
                };
            }
        };

        let mut code = code;
        let mut validation = validate(&code);
        let fix_attempted = validation.has_errors();
        let mut fix_applied = false;
        if fix_attempted && let Some(fixed) = suggest_fixes(&code, &validation) {
            validation = validate(&fixed);
            code = fixed;
            fix_applied = true;
            info!(valid = validation.is_valid(), "applied validator fixes");
        }

        if validation.has_errors() {
            let error = format!("validation failed: {}", validation.error_summary());
            self.record(&ExecutionRecord {
                request_id: ctx.request_id,
                step_number: ctx.step.step_number,
                attempt: ctx.attempt,
                code: &code,
                validation: &validation,
                fix_applied,
                session: None,
                error: Some(&error),
                started_at,
                duration: clock.elapsed(),
            });
            return AttemptOutcome {
                result: AttemptResult::Failed { error },
                fix_attempted,
            };
        }

        let mut session = match self.sandbox.create_in(&code, self.config.limits, ctx.workdir) {
            Ok(session) => session,
            Err(err) => {
                let error = format!("sandbox setup failed: {err:#}");
                warn!(error = %error, "sandbox setup failed");
                return AttemptOutcome {
                    result: AttemptResult::Failed { error },
                    fix_attempted,
                };
            }
        };
        let result = match self.sandbox.run(&mut session, ctx.cancel) {
            Ok(state) => classify(&session, state, ctx.cancel),
            Err(err) => AttemptResult::Failed {
                error: err.to_string(),
            },
        };

        let error = match &result {
            AttemptResult::Failed { error } => Some(error.as_str()),
            _ => None,
        };
        self.record(&ExecutionRecord {
            request_id: ctx.request_id,
            step_number: ctx.step.step_number,
            attempt: ctx.attempt,
            code: &code,
            validation: &validation,
            fix_applied,
            session: Some(&session),
            error,
            started_at,
            duration: clock.elapsed(),
        });
        AttemptOutcome {
            result,
            fix_attempted,
        }
    }

    fn record(&self, record: &ExecutionRecord<'_>) {
        if let Err(err) = self.recorder.record(record) {
            warn!(err = %format!("{err:#}"), "failed to write execution record");
        }
    }
}

fn classify(session: &SandboxSession, state: SessionState, cancel: &CancelToken) -> AttemptResult {
    match state {
        SessionState::Completed => AttemptResult::Succeeded {
            stdout: session
                .outcome()
                .map(|outcome| outcome.stdout.clone())
                .unwrap_or_default(),
        },
        SessionState::Killed if cancel.is_cancelled() => AttemptResult::Cancelled,
        _ => AttemptResult::Failed {
            error: session
                .failure_summary()
                .unwrap_or_else(|| format!("sandbox session ended in state {state}")),
        },
    }
}
