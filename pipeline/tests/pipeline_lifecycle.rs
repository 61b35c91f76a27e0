//! Request-level lifecycle tests.
//!
//! Drives `Orchestrator::handle` across a multi-step plan with scripted model
//! fakes, a real `sh` sandbox, and on-disk attempt records.

#![cfg(unix)]

use std::fs;
use std::time::Duration;

use pipeline::cancel::CancelToken;
use pipeline::core::plan::{Plan, PlanStep, StepStatus};
use pipeline::io::recorder::{AttemptPaths, FileRecorder};
use pipeline::io::runtime::InterpreterRuntime;
use pipeline::io::sandbox::{ResourceLimits, Sandbox};
use pipeline::orchestrator::{Orchestrator, OrchestratorConfig, RequestOutcome, StepStopReason};
use pipeline::test_support::{ScriptedGenerator, ScriptedPlanner};

/// Plan:
/// 1. required step: fails once at runtime, then succeeds
/// 2. skippable step: generator keeps producing a program that does not parse
/// 3. skippable step: succeeds first time
///
/// Tests: retry with prior error, validation gate keeping invalid code out of
/// the sandbox, loop detection, continuation past a skippable failure, and the
/// attempt records left on disk.
#[test]
fn multi_step_request_records_every_attempt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let planner = ScriptedPlanner::plan(Plan::new(vec![
        PlanStep::new(1, "greet").required(),
        PlanStep::new(2, "broken"),
        PlanStep::new(3, "finish"),
    ]));
    let generator = ScriptedGenerator::sequence([
        "false\n",
        "\"echo\" \"step one\"\n",
        "def f(:\n",
        "def f(:\n",
        "def f(:\n",
        "\"echo\" \"done\"\n",
    ]);
    let config = OrchestratorConfig {
        max_retries: 5,
        error_repeat_threshold: 3,
        error_history: 5,
        limits: ResourceLimits {
            wall_clock: Duration::from_secs(10),
            ..ResourceLimits::default()
        },
        working_dir: None,
    };
    let orchestrator = Orchestrator::new(
        planner,
        generator,
        Sandbox::new(InterpreterRuntime::shell()),
        FileRecorder::new(temp.path()),
        config,
    )
    .expect("orchestrator");

    let outcome = orchestrator
        .handle("greet, then finish", &CancelToken::new())
        .expect("handle");
    let RequestOutcome::Completed(report) = outcome else {
        panic!("request should not be refused");
    };

    let statuses: Vec<_> = report.plan.steps().iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            StepStatus::Succeeded,
            StepStatus::Failed,
            StepStatus::Succeeded
        ]
    );
    assert!(!report.succeeded());
    assert!(!report.cancelled);
    assert_eq!(report.retry_ceiling, 5);

    let greet = &report.steps[0];
    assert_eq!(greet.attempts, 2);
    assert_eq!(greet.stdout.as_deref(), Some("step one\n"));
    assert!(!greet.fix_attempted);

    let broken = &report.steps[1];
    assert_eq!(broken.attempts, 3);
    assert_eq!(
        broken.stop_reason,
        Some(StepStopReason::RepeatedError { threshold: 3 })
    );

    assert_eq!(report.steps[2].stdout.as_deref(), Some("done\n"));

    let root = temp.path();
    let id = report.request_id.as_str();
    let failed_run = AttemptPaths::new(root, id, 1, 1);
    assert!(failed_run.stderr_path.is_file());
    let meta: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&failed_run.meta_path).expect("meta"))
            .expect("json");
    assert_eq!(meta["state"], "FAILED");
    assert_eq!(meta["exit"]["kind"], "exit_code");

    for attempt in 1..=3 {
        let paths = AttemptPaths::new(root, id, 2, attempt);
        assert!(paths.validation_path.is_file());
        assert!(
            !paths.stdout_path.exists(),
            "invalid program reached the sandbox"
        );
    }
    assert!(!AttemptPaths::new(root, id, 2, 4).dir.exists());
    assert!(AttemptPaths::new(root, id, 3, 1).stdout_path.is_file());
}

/// A limit stated in the request lowers the per-step attempt budget.
#[test]
fn request_retry_limit_caps_attempts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let orchestrator = Orchestrator::new(
        ScriptedPlanner::steps(["fail forever"]),
        ScriptedGenerator::sequence(["false\n", "true\nfalse\n"]),
        Sandbox::new(InterpreterRuntime::shell()),
        FileRecorder::new(temp.path()),
        OrchestratorConfig::default(),
    )
    .expect("orchestrator");

    let outcome = orchestrator
        .handle("clean up temp files, max 2 attempts", &CancelToken::new())
        .expect("handle");
    let RequestOutcome::Completed(report) = outcome else {
        panic!("request should not be refused");
    };
    assert_eq!(report.retry_ceiling, 2);
    assert_eq!(report.steps[0].attempts, 2);
    assert_eq!(
        report.steps[0].stop_reason,
        Some(StepStopReason::MaxRetries { max_retries: 2 })
    );
}
