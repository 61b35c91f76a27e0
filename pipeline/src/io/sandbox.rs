//! Single-use isolated execution sessions for generated programs.
//!
//! A session owns a private temp workspace holding the script. The program runs
//! in a working directory that may be shared with other sessions of the same
//! request, so files written by one step are visible to the next. It moves through
//! `CREATED -> RUNNING -> {COMPLETED, FAILED, TIMED_OUT, KILLED}` exactly once;
//! terminal sessions are never re-run. The workspace is released exactly once on
//! every terminal path, and on drop for sessions that never ran.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::SandboxError;
use crate::io::process::{Termination, run_command_with_timeout};
use crate::io::runtime::Runtime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Created,
    Running,
    Completed,
    Failed,
    TimedOut,
    Killed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "CREATED",
            SessionState::Running => "RUNNING",
            SessionState::Completed => "COMPLETED",
            SessionState::Failed => "FAILED",
            SessionState::TimedOut => "TIMED_OUT",
            SessionState::Killed => "KILLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionState::Created | SessionState::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Hard wall-clock budget for one run.
    pub wall_clock: Duration,
    /// Per-stream cap on captured stdout/stderr.
    pub output_limit_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_clock: Duration::from_secs(30),
            output_limit_bytes: 100_000,
        }
    }
}

/// How the program ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitClassification {
    Success,
    ExitCode { code: i32 },
    Signal { signal: Option<i32> },
    LaunchFailed { message: String },
    TimedOut,
    Killed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionOutcome {
    pub exit: ExitClassification,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

fn serialize_millis<S: serde::Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// One isolated execution of one program.
#[derive(Debug)]
pub struct SandboxSession {
    id: Uuid,
    state: SessionState,
    created_at: DateTime<Utc>,
    limits: ResourceLimits,
    workspace_path: PathBuf,
    script_path: PathBuf,
    working_dir: PathBuf,
    workspace: Option<TempDir>,
    outcome: Option<SessionOutcome>,
    releases: u32,
}

impl SandboxSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    /// Workspace directory. Gone from disk once the session is released.
    pub fn workspace_path(&self) -> &Path {
        &self.workspace_path
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    /// Directory the program runs in.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Present once the session reached a terminal state through `run`.
    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    pub fn workspace_released(&self) -> bool {
        self.workspace.is_none()
    }

    /// Times the workspace was actually released. 0 or 1.
    pub fn release_count(&self) -> u32 {
        self.releases
    }

    /// One-line description of a non-successful terminal state, used as the
    /// error signature for retries.
    pub fn failure_summary(&self) -> Option<String> {
        let outcome = self.outcome.as_ref()?;
        let summary = match &outcome.exit {
            ExitClassification::Success => return None,
            ExitClassification::ExitCode { code } => {
                format!("{} (exit code {code})", last_line(&outcome.stderr))
            }
            ExitClassification::Signal { signal } => match signal {
                Some(signal) => format!(
                    "{} (terminated by signal {signal})",
                    last_line(&outcome.stderr)
                ),
                None => format!("{} (terminated by signal)", last_line(&outcome.stderr)),
            },
            ExitClassification::LaunchFailed { message } => {
                format!("failed to launch runtime: {message}")
            }
            ExitClassification::TimedOut => format!(
                "execution timed out after {:.1}s",
                self.limits.wall_clock.as_secs_f64()
            ),
            ExitClassification::Killed => {
                "execution cancelled; program was killed".to_string()
            }
        };
        Some(summary)
    }

    fn release(&mut self) {
        let Some(workspace) = self.workspace.take() else {
            return;
        };
        self.releases += 1;
        if let Err(e) = workspace.close() {
            warn!(session = %self.id, err = %e, "failed to remove sandbox workspace");
        } else {
            debug!(session = %self.id, "released sandbox workspace");
        }
    }

    fn finish(&mut self, state: SessionState, outcome: SessionOutcome) {
        self.state = state;
        self.outcome = Some(outcome);
        self.release();
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        self.release();
    }
}

fn last_line(stderr: &str) -> &str {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("program failed with no error output")
}

/// Creates and runs sessions with one runtime.
#[derive(Debug, Clone)]
pub struct Sandbox<R: Runtime> {
    runtime: R,
}

impl<R: Runtime> Sandbox<R> {
    pub fn new(runtime: R) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Allocate a private workspace and write the program into it. The program
    /// also runs there.
    pub fn create(&self, code: &str, limits: ResourceLimits) -> Result<SandboxSession> {
        self.create_session(code, limits, None)
    }

    /// Like [`Sandbox::create`], but the program runs in `working_dir`, which
    /// outlives the session.
    pub fn create_in(
        &self,
        code: &str,
        limits: ResourceLimits,
        working_dir: &Path,
    ) -> Result<SandboxSession> {
        self.create_session(code, limits, Some(working_dir))
    }

    fn create_session(
        &self,
        code: &str,
        limits: ResourceLimits,
        working_dir: Option<&Path>,
    ) -> Result<SandboxSession> {
        let workspace = tempfile::Builder::new()
            .prefix("pipeline-sandbox-")
            .tempdir()
            .context("create sandbox workspace")?;
        let script_path = workspace.path().join(self.runtime.script_name());
        fs::write(&script_path, code)
            .with_context(|| format!("write script {}", script_path.display()))?;

        let session = SandboxSession {
            id: Uuid::new_v4(),
            state: SessionState::Created,
            created_at: Utc::now(),
            limits,
            workspace_path: workspace.path().to_path_buf(),
            working_dir: working_dir.unwrap_or(workspace.path()).to_path_buf(),
            script_path,
            workspace: Some(workspace),
            outcome: None,
            releases: 0,
        };
        debug!(session = %session.id, workspace = %session.workspace_path.display(), "created sandbox session");
        Ok(session)
    }

    /// Run a `CREATED` session to a terminal state.
    ///
    /// Blocks for at most the session's wall-clock budget (plus kill time).
    #[instrument(skip_all, fields(session = %session.id))]
    pub fn run(
        &self,
        session: &mut SandboxSession,
        cancel: &CancelToken,
    ) -> Result<SessionState, SandboxError> {
        if session.state != SessionState::Created {
            return Err(SandboxError::NotRunnable {
                id: session.id,
                state: session.state,
            });
        }
        session.state = SessionState::Running;

        if cancel.is_cancelled() {
            session.finish(SessionState::Killed, empty_outcome(ExitClassification::Killed));
            return Ok(SessionState::Killed);
        }

        let cmd = self
            .runtime
            .command(&session.script_path, &session.working_dir);
        let output = run_command_with_timeout(
            cmd,
            None,
            session.limits.wall_clock,
            session.limits.output_limit_bytes,
            cancel,
        );

        let (state, outcome) = match output {
            Err(err) => {
                warn!(err = %format!("{err:#}"), "sandbox runtime failed to launch");
                let exit = ExitClassification::LaunchFailed {
                    message: format!("{err:#}"),
                };
                (SessionState::Failed, empty_outcome(exit))
            }
            Ok(out) => {
                let exit = match out.termination {
                    Termination::TimedOut => ExitClassification::TimedOut,
                    Termination::Killed => ExitClassification::Killed,
                    Termination::Exited if out.status.success() => ExitClassification::Success,
                    Termination::Exited => match out.status.code() {
                        Some(code) => ExitClassification::ExitCode { code },
                        None => ExitClassification::Signal {
                            signal: exit_signal(&out.status),
                        },
                    },
                };
                let state = match exit {
                    ExitClassification::Success => SessionState::Completed,
                    ExitClassification::TimedOut => SessionState::TimedOut,
                    ExitClassification::Killed => SessionState::Killed,
                    _ => SessionState::Failed,
                };
                let outcome = SessionOutcome {
                    exit,
                    stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                    stdout_truncated: out.stdout_truncated,
                    stderr_truncated: out.stderr_truncated,
                    duration: out.elapsed,
                };
                (state, outcome)
            }
        };

        match state {
            SessionState::TimedOut => warn!(
                budget_ms = session.limits.wall_clock.as_millis() as u64,
                "sandbox session timed out"
            ),
            SessionState::Killed => warn!("sandbox session killed"),
            _ => info!(state = %state, "sandbox session finished"),
        }
        session.finish(state, outcome);
        Ok(state)
    }
}

/// Working directory shared by every session of one request.
#[derive(Debug)]
pub enum RequestWorkdir {
    /// A configured directory. Created if missing, never removed.
    Fixed(PathBuf),
    /// A private directory removed when the request ends.
    Private(TempDir),
}

impl RequestWorkdir {
    pub fn open(configured: Option<&Path>) -> Result<Self> {
        match configured {
            Some(dir) => {
                fs::create_dir_all(dir)
                    .with_context(|| format!("create working dir {}", dir.display()))?;
                Ok(RequestWorkdir::Fixed(dir.to_path_buf()))
            }
            None => tempfile::Builder::new()
                .prefix("pipeline-request-")
                .tempdir()
                .context("create request working dir")
                .map(RequestWorkdir::Private),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            RequestWorkdir::Fixed(dir) => dir,
            RequestWorkdir::Private(dir) => dir.path(),
        }
    }
}

fn empty_outcome(exit: ExitClassification) -> SessionOutcome {
    SessionOutcome {
        exit,
        stdout: String::new(),
        stderr: String::new(),
        stdout_truncated: 0,
        stderr_truncated: 0,
        duration: Duration::ZERO,
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use std::thread;

    use super::*;
    use crate::io::runtime::InterpreterRuntime;

    fn sandbox() -> Sandbox<InterpreterRuntime> {
        Sandbox::new(InterpreterRuntime::shell())
    }

    fn limits(wall_clock: Duration) -> ResourceLimits {
        ResourceLimits {
            wall_clock,
            ..ResourceLimits::default()
        }
    }

    #[test]
    fn create_writes_script_into_private_workspace() {
        let session = sandbox()
            .create("echo hi\n", ResourceLimits::default())
            .expect("create");
        assert_eq!(session.state(), SessionState::Created);
        assert!(session.script_path().starts_with(session.workspace_path()));
        assert_eq!(
            fs::read_to_string(session.script_path()).expect("read"),
            "echo hi\n"
        );
        assert_eq!(session.id().get_version_num(), 4);
    }

    #[test]
    fn zero_exit_completes_and_releases_once() {
        let sandbox = sandbox();
        let mut session = sandbox
            .create("echo done\n", ResourceLimits::default())
            .expect("create");
        let state = sandbox.run(&mut session, &CancelToken::new()).expect("run");
        assert_eq!(state, SessionState::Completed);
        let outcome = session.outcome().expect("outcome");
        assert_eq!(outcome.exit, ExitClassification::Success);
        assert_eq!(outcome.stdout, "done\n");
        assert!(session.failure_summary().is_none());
        assert_eq!(session.release_count(), 1);
        assert!(!session.workspace_path().exists());
    }

    #[test]
    fn non_zero_exit_fails_with_summary() {
        let sandbox = sandbox();
        let mut session = sandbox
            .create("echo 'ValueError: bad input' >&2\nexit 4\n", ResourceLimits::default())
            .expect("create");
        let state = sandbox.run(&mut session, &CancelToken::new()).expect("run");
        assert_eq!(state, SessionState::Failed);
        assert_eq!(
            session.outcome().expect("outcome").exit,
            ExitClassification::ExitCode { code: 4 }
        );
        assert_eq!(
            session.failure_summary().as_deref(),
            Some("ValueError: bad input (exit code 4)")
        );
        assert_eq!(session.release_count(), 1);
    }

    #[test]
    fn never_terminating_program_times_out() {
        let sandbox = sandbox();
        let budget = Duration::from_millis(300);
        let mut session = sandbox.create("exec sleep 30\n", limits(budget)).expect("create");
        let state = sandbox.run(&mut session, &CancelToken::new()).expect("run");
        assert_eq!(state, SessionState::TimedOut);
        let outcome = session.outcome().expect("outcome");
        assert!(outcome.duration >= budget);
        assert!(outcome.duration < Duration::from_secs(10));
        assert!(
            session
                .failure_summary()
                .expect("summary")
                .contains("timed out")
        );
        assert_eq!(session.release_count(), 1);
        assert!(!session.workspace_path().exists());
    }

    #[test]
    fn cancellation_kills_the_session() {
        let sandbox = sandbox();
        let mut session = sandbox
            .create("exec sleep 30\n", limits(Duration::from_secs(20)))
            .expect("create");
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let state = sandbox.run(&mut session, &cancel).expect("run");
        handle.join().expect("join");
        assert_eq!(state, SessionState::Killed);
        assert_eq!(session.release_count(), 1);
    }

    #[test]
    fn launch_failure_is_a_failed_session() {
        let runtime = InterpreterRuntime::new(
            &["definitely-not-an-interpreter-xyz".to_string()],
            "main.py",
        )
        .expect("runtime");
        let sandbox = Sandbox::new(runtime);
        let mut session = sandbox.create("true\n", ResourceLimits::default()).expect("create");
        let state = sandbox.run(&mut session, &CancelToken::new()).expect("run");
        assert_eq!(state, SessionState::Failed);
        assert!(matches!(
            session.outcome().expect("outcome").exit,
            ExitClassification::LaunchFailed { .. }
        ));
        assert!(
            session
                .failure_summary()
                .expect("summary")
                .starts_with("failed to launch runtime")
        );
        assert_eq!(session.release_count(), 1);
    }

    #[test]
    fn background_process_is_killed_when_the_script_exits() {
        let sandbox = sandbox();
        let budget = Duration::from_millis(500);
        let mut session = sandbox
            .create("sleep 6 &\necho started\n", limits(budget))
            .expect("create");
        let state = sandbox.run(&mut session, &CancelToken::new()).expect("run");
        assert_eq!(state, SessionState::Completed);
        let outcome = session.outcome().expect("outcome");
        assert_eq!(outcome.stdout, "started\n");
        assert!(outcome.duration < Duration::from_secs(2));
        assert_eq!(session.release_count(), 1);
    }

    #[test]
    fn output_held_past_the_budget_times_out() {
        let has_setsid = std::process::Command::new("setsid")
            .arg("true")
            .status()
            .is_ok_and(|status| status.success());
        if !has_setsid {
            return;
        }
        let sandbox = sandbox();
        let mut session = sandbox
            .create("setsid sleep 3 &\necho started\n", limits(Duration::from_millis(300)))
            .expect("create");
        let state = sandbox.run(&mut session, &CancelToken::new()).expect("run");
        assert_eq!(state, SessionState::TimedOut);
        assert!(session.outcome().expect("outcome").duration < Duration::from_millis(2500));
        assert_eq!(session.release_count(), 1);
    }

    #[test]
    fn shared_working_dir_outlives_the_session() {
        let sandbox = sandbox();
        let workdir = RequestWorkdir::open(None).expect("workdir");
        let mut first = sandbox
            .create_in("touch report.txt\n", ResourceLimits::default(), workdir.path())
            .expect("create");
        assert_eq!(
            sandbox.run(&mut first, &CancelToken::new()).expect("run"),
            SessionState::Completed
        );
        assert!(!first.workspace_path().exists());
        assert!(workdir.path().join("report.txt").is_file());
        assert!(!workdir.path().join("main.sh").exists());

        let mut second = sandbox
            .create_in("test -f report.txt\n", ResourceLimits::default(), workdir.path())
            .expect("create");
        assert_eq!(second.working_dir(), workdir.path());
        assert_eq!(
            sandbox.run(&mut second, &CancelToken::new()).expect("run"),
            SessionState::Completed
        );

        let path = workdir.path().to_path_buf();
        drop(workdir);
        assert!(!path.exists());
    }

    #[test]
    fn fixed_working_dir_is_created_and_kept() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("work").join("nested");
        let workdir = RequestWorkdir::open(Some(&dir)).expect("workdir");
        assert!(dir.is_dir());
        drop(workdir);
        assert!(dir.is_dir());
    }

    #[test]
    fn terminal_session_cannot_run_again() {
        let sandbox = sandbox();
        let mut session = sandbox.create("true\n", ResourceLimits::default()).expect("create");
        sandbox.run(&mut session, &CancelToken::new()).expect("run");
        let err = sandbox
            .run(&mut session, &CancelToken::new())
            .unwrap_err();
        assert_eq!(
            err,
            SandboxError::NotRunnable {
                id: session.id(),
                state: SessionState::Completed
            }
        );
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(session.release_count(), 1);
    }

    #[test]
    fn dropping_an_unrun_session_releases_the_workspace() {
        let session = sandbox()
            .create("true\n", ResourceLimits::default())
            .expect("create");
        let path = session.workspace_path().to_path_buf();
        assert!(path.exists());
        drop(session);
        assert!(!path.exists());
    }
}
