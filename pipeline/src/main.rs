//! Guarded execution pipeline CLI.
//!
//! Checks requests against the ethical gate, validates generated programs, and
//! runs full requests through plan, validate, sandbox, and retry.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pipeline::cancel::CancelToken;
use pipeline::core::ethics;
use pipeline::core::validator::{suggest_fixes, validate};
use pipeline::exit_codes;
use pipeline::io::config::{PipelineConfig, load_config, write_config};
use pipeline::io::model::{CommandGenerator, CommandPlanner, ModelCommand};
use pipeline::io::prompt::PromptEngine;
use pipeline::io::recorder::FileRecorder;
use pipeline::io::runtime::InterpreterRuntime;
use pipeline::io::sandbox::Sandbox;
use pipeline::logging;
use pipeline::orchestrator::{
    ExecutionReport, Orchestrator, OrchestratorConfig, RequestOutcome,
};

#[derive(Parser)]
#[command(
    name = "pipeline",
    version,
    about = "Guarded execution pipeline for generated automation scripts"
)]
struct Cli {
    /// Project root holding `.pipeline/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// More diagnostics on stderr (-v info, -vv debug). `RUST_LOG` wins.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.pipeline/config.toml` with defaults if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the ethical gate on a request.
    Check { request: String },
    /// Statically validate a Python program.
    Validate {
        file: PathBuf,
        /// Print the auto-fixed program to stdout.
        #[arg(long)]
        fix: bool,
    },
    /// Handle a request end to end.
    Run {
        request: String,
        /// Override the sandbox wall-clock budget.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Override the per-step attempt backstop.
        #[arg(long)]
        max_retries: Option<u32>,
        /// Directory for attempt records (default `.pipeline/attempts`).
        #[arg(long)]
        records: Option<PathBuf>,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => cmd_init(&cli.root, force),
        Command::Check { request } => Ok(cmd_check(&request)),
        Command::Validate { file, fix } => cmd_validate(&file, fix),
        Command::Run {
            request,
            timeout_secs,
            max_retries,
            records,
            json,
        } => {
            let mut cfg = load_config(&config_path(&cli.root))?;
            if let Some(dir) = cfg.runtime.working_dir.as_mut()
                && dir.is_relative()
            {
                let resolved = cli.root.join(&*dir);
                *dir = resolved;
            }
            if let Some(timeout_secs) = timeout_secs {
                cfg.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = max_retries {
                cfg.max_retries = max_retries;
            }
            cfg.validate().context("invalid overrides")?;
            let records = records.unwrap_or_else(|| FileRecorder::in_project(&cli.root).root().to_path_buf());
            cmd_run(&cfg, &request, records, json)
        }
    }
}

fn config_path(root: &Path) -> PathBuf {
    root.join(".pipeline").join("config.toml")
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let path = config_path(root);
    if !force && path.exists() {
        println!("{} already exists", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&path, &PipelineConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_check(request: &str) -> i32 {
    let verdict = ethics::check(request);
    println!("{}: {}", verdict.category, verdict.message);
    if verdict.is_safe {
        exit_codes::OK
    } else {
        exit_codes::REFUSED
    }
}

fn cmd_validate(file: &Path, fix: bool) -> Result<i32> {
    let code = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let result = validate(&code);
    for issue in result.issues() {
        let severity = if issue.is_error() { "error" } else { "warning" };
        eprintln!("{severity}: {issue}");
        if let Some(suggestion) = &issue.suggestion {
            eprintln!("  suggestion: {suggestion}");
        }
    }
    if !fix {
        return Ok(if result.is_valid() {
            exit_codes::OK
        } else {
            exit_codes::INVALID
        });
    }

    let fixed = suggest_fixes(&code, &result).unwrap_or(code);
    let revalidated = validate(&fixed);
    print!("{fixed}");
    if revalidated.is_valid() {
        Ok(exit_codes::OK)
    } else {
        eprintln!("still invalid after fixes: {}", revalidated.error_summary());
        Ok(exit_codes::INVALID)
    }
}

fn cmd_run(cfg: &PipelineConfig, request: &str, records: PathBuf, json: bool) -> Result<i32> {
    let cancel = CancelToken::new();
    let model_timeout = Duration::from_secs(cfg.model.model_timeout_secs);
    let planner_model = ModelCommand::new(
        cfg.model.planner_command.clone(),
        model_timeout,
        cfg.model.model_output_limit_bytes,
    )?
    .with_cancel(cancel.clone());
    let generator_model = ModelCommand::new(
        cfg.model.generator_command.clone(),
        model_timeout,
        cfg.model.model_output_limit_bytes,
    )?
    .with_cancel(cancel.clone());
    let runtime = InterpreterRuntime::new(&cfg.runtime.command, cfg.runtime.script_name.clone())?;

    let orchestrator = Orchestrator::new(
        CommandPlanner::new(planner_model, PromptEngine::new(cfg.timeout_secs)?),
        CommandGenerator::new(generator_model, PromptEngine::new(cfg.timeout_secs)?),
        Sandbox::new(runtime),
        FileRecorder::new(records),
        OrchestratorConfig::from_pipeline(cfg),
    )?;

    let outcome = orchestrator.handle(request, &cancel)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&outcome).context("serialize report")?
        );
    }
    match outcome {
        RequestOutcome::Refused(verdict) => {
            if !json {
                println!("{}: {}", verdict.category, verdict.message);
            }
            Ok(exit_codes::REFUSED)
        }
        RequestOutcome::Completed(report) => {
            if !json {
                print_report(&report);
            }
            Ok(if report.succeeded() {
                exit_codes::OK
            } else {
                exit_codes::STEP_FAILED
            })
        }
    }
}

fn print_report(report: &ExecutionReport) {
    println!("request {}", report.request_id);
    if report.used_fallback_plan {
        println!("(planner unavailable, used fallback plan)");
    }
    for step in report.plan.steps() {
        println!(
            "  {}. [{:?}] {}",
            step.step_number, step.status, step.description
        );
        let Some(detail) = report
            .steps
            .iter()
            .find(|detail| detail.step_number == step.step_number)
        else {
            continue;
        };
        println!("     attempts: {}", detail.attempts);
        if let Some(reason) = &detail.stop_reason {
            println!("     stopped: {reason:?}");
        }
        if let Some(error) = &detail.last_error {
            println!("     last error: {error}");
        }
        if let Some(stdout) = detail.stdout.as_deref().filter(|s| !s.trim().is_empty()) {
            for line in stdout.lines() {
                println!("     | {line}");
            }
        }
    }
    if report.cancelled {
        println!("cancelled");
    }
}
