//! Per-attempt execution records under `.pipeline/attempts/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::validator::ValidationResult;
use crate::io::sandbox::{ExitClassification, SandboxSession, SessionState};

/// Everything known about one attempt once it has finished.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRecord<'a> {
    pub request_id: &'a str,
    pub step_number: usize,
    pub attempt: u32,
    /// The program that was validated (after any fix).
    pub code: &'a str,
    pub validation: &'a ValidationResult,
    pub fix_applied: bool,
    /// `None` when the attempt never reached the sandbox.
    pub session: Option<&'a SandboxSession>,
    /// Failure signature recorded for the attempt, if it failed.
    pub error: Option<&'a str>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Sink for attempt records. Failures are reported, never fatal to the pipeline.
pub trait ExecutionRecorder {
    fn record(&self, record: &ExecutionRecord<'_>) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
struct AttemptMeta<'a> {
    request_id: &'a str,
    step_number: usize,
    attempt: u32,
    valid: bool,
    fix_applied: bool,
    session_id: Option<String>,
    state: Option<SessionState>,
    exit: Option<&'a ExitClassification>,
    error: Option<&'a str>,
    started_at: String,
    duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub code_path: PathBuf,
    pub validation_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(root: &Path, request_id: &str, step_number: usize, attempt: u32) -> Self {
        let dir = root
            .join(request_id)
            .join(format!("step-{step_number}"))
            .join(format!("attempt-{attempt}"));
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            code_path: dir.join("code.py"),
            validation_path: dir.join("validation.json"),
            stdout_path: dir.join("stdout.log"),
            stderr_path: dir.join("stderr.log"),
        }
    }
}

/// Writes each attempt to its own directory below `root`.
#[derive(Debug, Clone)]
pub struct FileRecorder {
    root: PathBuf,
}

impl FileRecorder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default location inside a project: `<project>/.pipeline/attempts`.
    pub fn in_project(project_root: &Path) -> Self {
        Self::new(project_root.join(".pipeline").join("attempts"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ExecutionRecorder for FileRecorder {
    fn record(&self, record: &ExecutionRecord<'_>) -> Result<()> {
        let paths = AttemptPaths::new(
            &self.root,
            record.request_id,
            record.step_number,
            record.attempt,
        );
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;

        let outcome = record.session.and_then(SandboxSession::outcome);
        let meta = AttemptMeta {
            request_id: record.request_id,
            step_number: record.step_number,
            attempt: record.attempt,
            valid: record.validation.is_valid(),
            fix_applied: record.fix_applied,
            session_id: record.session.map(|session| session.id().to_string()),
            state: record.session.map(SandboxSession::state),
            exit: outcome.map(|outcome| &outcome.exit),
            error: record.error,
            started_at: record.started_at.to_rfc3339(),
            duration_ms: u64::try_from(record.duration.as_millis()).unwrap_or(u64::MAX),
        };

        // Write in deterministic order to keep logs stable.
        write_json(&paths.meta_path, &meta)?;
        write_text(&paths.code_path, record.code)?;
        write_json(&paths.validation_path, record.validation)?;
        if let Some(outcome) = outcome {
            write_text(&paths.stdout_path, &outcome.stdout)?;
            write_text(&paths.stderr_path, &outcome.stderr)?;
        }
        Ok(())
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
