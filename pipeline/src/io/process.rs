//! Helpers for running child processes with timeouts, cancellation, and bounded output.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;

/// How often the wait loop checks the cancel token.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time allowed for the output pipes to drain once the process group is gone,
/// even when the budget is already spent.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Why the child stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own (any status).
    Exited,
    /// Killed because the wall-clock budget elapsed, or its output was still
    /// held open by an escaped process when the budget ran out.
    TimedOut,
    /// Killed because the request was cancelled.
    Killed,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub termination: Termination,
    pub elapsed: Duration,
}

type StreamResult = Result<(Vec<u8>, usize)>;

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
///
/// On unix the child leads its own process group. The group is killed once the child is gone,
/// whatever the reason, so background processes never outlive the call. Draining the pipes is
/// bounded by the same budget; a stream still open at the deadline counts as a timeout.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        if let Err(e) = child_stdin.write_all(input) {
            // The child may exit without reading its input; its status says more.
            warn!(err = %e, "failed to write child stdin");
        }
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_rx = spawn_reader(stdout, output_limit_bytes);
    let stderr_rx = spawn_reader(stderr, output_limit_bytes);

    let (status, mut termination) = wait_bounded(&mut child, started, timeout, cancel)?;
    if termination == Termination::Exited && kill_group(&child) {
        warn!("killed processes left running by command");
    }

    let drain = timeout.saturating_sub(started.elapsed()).max(DRAIN_GRACE);
    let deadline = Instant::now().checked_add(drain);
    let stdout = collect_output(&stdout_rx, deadline).context("collect stdout")?;
    let stderr = collect_output(&stderr_rx, deadline).context("collect stderr")?;
    let elapsed = started.elapsed();

    if (stdout.is_none() || stderr.is_none()) && termination == Termination::Exited {
        warn!(
            timeout_secs = timeout.as_secs(),
            "output still held open at the deadline, treating as timeout"
        );
        termination = Termination::TimedOut;
    }
    let (stdout, stdout_truncated) = stdout.unwrap_or_default();
    let (stderr, stderr_truncated) = stderr.unwrap_or_default();

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), ?termination, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        termination,
        elapsed,
    })
}

fn wait_bounded(
    child: &mut Child,
    started: Instant,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<(ExitStatus, Termination)> {
    loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            let status = kill_tree(child)?;
            return Ok((status, Termination::TimedOut));
        }
        if cancel.is_cancelled() {
            warn!("request cancelled, killing command");
            let status = kill_tree(child)?;
            return Ok((status, Termination::Killed));
        }
        if let Some(status) = child
            .wait_timeout(remaining.min(POLL_INTERVAL))
            .context("wait for command")?
        {
            return Ok((status, Termination::Exited));
        }
    }
}

/// Kill the child's process group and the child itself, then reap it.
fn kill_tree(child: &mut Child) -> Result<ExitStatus> {
    kill_group(child);
    if let Err(e) = child.kill() {
        // Already reaped by the group kill.
        debug!(err = %e, "child kill");
    }
    child.wait().context("wait command after kill")
}

/// SIGKILL every process still in the child's group. Returns whether any
/// process was signalled.
#[cfg(unix)]
fn kill_group(child: &Child) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(child.id()) else {
        return false;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pgid, err = %e, "failed to kill process group");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) -> bool {
    false
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> Receiver<StreamResult> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver is gone once the deadline passed; nothing left to report.
        let _ = tx.send(read_stream_limited(reader, limit));
    });
    rx
}

/// `None` when the stream is still open at `deadline`. A deadline too far out
/// to represent waits for the stream to close.
fn collect_output(
    rx: &Receiver<StreamResult>,
    deadline: Option<Instant>,
) -> Result<Option<(Vec<u8>, usize)>> {
    let received = match deadline {
        Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
    };
    match received {
        Ok(result) => result.map(Some),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> StreamResult {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn captures_output_and_status() {
        let out = run_command_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(5),
            1024,
            &CancelToken::new(),
        )
        .expect("run");
        assert_eq!(out.termination, Termination::Exited);
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout, b"out\n");
        assert_eq!(out.stderr, b"err\n");
    }

    #[test]
    fn output_beyond_limit_is_counted_not_stored() {
        let out = run_command_with_timeout(
            sh("printf 0123456789"),
            None,
            Duration::from_secs(5),
            4,
            &CancelToken::new(),
        )
        .expect("run");
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.stdout_truncated, 6);
    }

    #[test]
    fn stdin_is_forwarded() {
        let out = run_command_with_timeout(
            sh("cat"),
            Some(b"prompt"),
            Duration::from_secs(5),
            1024,
            &CancelToken::new(),
        )
        .expect("run");
        assert_eq!(out.stdout, b"prompt");
    }

    #[test]
    fn times_out_and_kills_the_group() {
        let out = run_command_with_timeout(
            sh("sleep 30 & sleep 30"),
            None,
            Duration::from_millis(200),
            1024,
            &CancelToken::new(),
        )
        .expect("run");
        assert_eq!(out.termination, Termination::TimedOut);
        assert!(out.elapsed >= Duration::from_millis(200));
        assert!(out.elapsed < Duration::from_secs(10));
    }

    #[test]
    fn cancellation_kills_the_child() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let out = run_command_with_timeout(
            sh("sleep 30"),
            None,
            Duration::from_secs(20),
            1024,
            &cancel,
        )
        .expect("run");
        handle.join().expect("join");
        assert_eq!(out.termination, Termination::Killed);
        assert!(out.elapsed < Duration::from_secs(10));
    }

    #[test]
    fn background_processes_do_not_outlive_the_child() {
        let out = run_command_with_timeout(
            sh("sleep 30 & echo started"),
            None,
            Duration::from_secs(5),
            1024,
            &CancelToken::new(),
        )
        .expect("run");
        assert_eq!(out.termination, Termination::Exited);
        assert!(out.status.success());
        assert_eq!(out.stdout, b"started\n");
        assert!(out.elapsed < Duration::from_secs(3));
    }

    #[test]
    fn output_held_by_an_escaped_process_times_out() {
        let has_setsid = Command::new("setsid")
            .arg("true")
            .status()
            .is_ok_and(|status| status.success());
        if !has_setsid {
            return;
        }
        let out = run_command_with_timeout(
            sh("setsid sleep 3 & echo started"),
            None,
            Duration::from_millis(300),
            1024,
            &CancelToken::new(),
        )
        .expect("run");
        assert_eq!(out.termination, Termination::TimedOut);
        assert!(out.elapsed < Duration::from_millis(2500));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = run_command_with_timeout(
            Command::new("definitely-not-a-real-program-xyz"),
            None,
            Duration::from_secs(1),
            16,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("spawn command"));
    }
}
