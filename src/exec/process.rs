//! Run one child process to completion under a timeout.
//!
//! The child is placed in its own process group so that a timeout or a
//! parent shutdown can kill everything it started with a single `killpg`.
//! Stdout and stderr are drained on separate tasks while the child runs, so a
//! chatty child can never block on a full pipe. Only a bounded amount of each
//! stream is retained: the head of stdout and the tail of stderr.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ExecError;

/// How long to wait for stdout/stderr to reach EOF after the child exits.
/// A background grandchild holding the pipe open past this gets killed.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

/// How many bytes of each stream the parent keeps in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    /// Leading bytes of stdout retained.
    pub stdout_bytes: usize,
    /// Trailing bytes of stderr retained.
    pub stderr_tail_bytes: usize,
}

/// Captured output of one child process.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecResult {
    /// Head of stdout, at most `CaptureLimits::stdout_bytes` bytes.
    pub stdout: String,
    /// Characters the child wrote to stdout in total, retained or not.
    pub stdout_chars: usize,
    /// Tail of stderr, at most `CaptureLimits::stderr_tail_bytes` bytes.
    pub stderr: String,
    /// `None` when the process was killed (timeout, cancellation or signal).
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }
}

/// Spawn `command` and wait for it, enforcing `timeout`.
///
/// On timeout or cancellation the whole process group receives `SIGKILL` and
/// the child is reaped before returning. Only a failure to launch (or to wait
/// on) the process is an `Err`; every other outcome is an [`ExecResult`].
pub async fn run_process(
    mut command: Command,
    timeout: Duration,
    cancel: &CancellationToken,
    limits: CaptureLimits,
) -> Result<ExecResult, ExecError> {
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();

    command
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|source| ExecError::SpawnFailed { program, source })?;

    let pid = child.id();
    let mut stdout_task = tokio::spawn(capture_head(child.stdout.take(), limits.stdout_bytes));
    let mut stderr_task = tokio::spawn(capture_tail(child.stderr.take(), limits.stderr_tail_bytes));

    let mut timed_out = false;
    let mut cancelled = false;

    let exit_code = tokio::select! {
        wait_result = child.wait() => {
            let status = wait_result.map_err(ExecError::WaitFailed)?;
            status.code()
        }
        _ = tokio::time::sleep(timeout) => {
            tracing::warn!(pid, timeout_secs = timeout.as_secs(), "Child timed out, killing process group");
            kill_group(pid);
            // Reap the child to prevent zombies.
            let _ = child.wait().await;
            timed_out = true;
            None
        }
        _ = cancel.cancelled() => {
            tracing::info!(pid, "Parent shutting down, killing child process group");
            kill_group(pid);
            let _ = child.wait().await;
            cancelled = true;
            None
        }
    };

    let stdout = drain(&mut stdout_task, pid).await;
    let stderr = drain(&mut stderr_task, pid).await;

    Ok(ExecResult {
        stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
        stdout_chars: stdout.total_chars,
        stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
        exit_code,
        timed_out,
        cancelled,
    })
}

/// Bytes retained from one stream plus the size of the whole stream.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    total_chars: usize,
}

/// UTF-8 characters in `chunk`, counted by their leading bytes.
fn count_chars(chunk: &[u8]) -> usize {
    chunk.iter().filter(|&&b| (b & 0xC0) != 0x80).count()
}

/// Read to EOF, keeping only the first `budget` bytes.
async fn capture_head<R: AsyncRead + Unpin>(pipe: Option<R>, budget: usize) -> Captured {
    let mut captured = Captured::default();
    let Some(mut pipe) = pipe else {
        return captured;
    };
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let data = &chunk[..n];
                captured.total_chars += count_chars(data);
                let room = budget.saturating_sub(captured.bytes.len());
                captured.bytes.extend_from_slice(&data[..n.min(room)]);
            }
            Err(e) => {
                tracing::debug!("Pipe read ended with error: {}", e);
                break;
            }
        }
    }
    captured
}

/// Read to EOF, keeping only the last `budget` bytes.
async fn capture_tail<R: AsyncRead + Unpin>(pipe: Option<R>, budget: usize) -> Captured {
    let mut tail: VecDeque<u8> = VecDeque::with_capacity(budget.min(READ_CHUNK));
    let mut total_chars = 0;
    if let Some(mut pipe) = pipe {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    let data = &chunk[..n];
                    total_chars += count_chars(data);
                    tail.extend(data);
                    let excess = tail.len().saturating_sub(budget);
                    tail.drain(..excess);
                }
                Err(e) => {
                    tracing::debug!("Pipe read ended with error: {}", e);
                    break;
                }
            }
        }
    }
    // Drop a leading partial character left by the cut.
    while tail.front().is_some_and(|&b| (b & 0xC0) == 0x80) {
        tail.pop_front();
    }
    Captured {
        bytes: tail.into(),
        total_chars,
    }
}

/// Wait for a reader task to hit EOF. If something in the child's process
/// group still holds the pipe after the grace period, kill the group and try
/// once more.
async fn drain(task: &mut JoinHandle<Captured>, pid: Option<u32>) -> Captured {
    if let Ok(joined) = tokio::time::timeout(PIPE_DRAIN_GRACE, &mut *task).await {
        return joined.unwrap_or_default();
    }

    tracing::warn!(pid, "Child left processes holding its output pipe, killing group");
    kill_group(pid);
    match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut *task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            task.abort();
            Captured::default()
        }
    }
}

/// Kill the entire process group via SIGKILL. Errors (typically ESRCH when
/// the group is already gone) are ignored.
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        let pgid = nix::unistd::Pid::from_raw(pid as i32);
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const LIMITS: CaptureLimits = CaptureLimits {
        stdout_bytes: 64 * 1024,
        stderr_tail_bytes: 8 * 1024,
    };

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let token = CancellationToken::new();
        let result = run_process(sh("echo hello; echo oops >&2; exit 4"), Duration::from_secs(5), &token, LIMITS)
            .await
            .unwrap();
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stdout_chars, 6);
        assert_eq!(result.stderr, "oops\n");
        assert_eq!(result.exit_code, Some(4));
        assert!(!result.timed_out);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn timeout_kills_process_group() {
        let token = CancellationToken::new();
        let start = Instant::now();
        let result = run_process(sh("sleep 60 & sleep 60; wait"), Duration::from_secs(1), &token, LIMITS)
            .await
            .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(start.elapsed() < Duration::from_secs(6), "took {:?}", start.elapsed());
    }

    #[tokio::test]
    async fn cancellation_kills_child() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let result = run_process(sh("sleep 60"), Duration::from_secs(30), &token, LIMITS)
            .await
            .unwrap();
        assert!(result.cancelled);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, None);
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let token = CancellationToken::new();
        let err = run_process(
            Command::new("/nonexistent/fanout-child"),
            Duration::from_secs(1),
            &token,
            LIMITS,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::SpawnFailed { .. }));
        assert!(err.to_string().contains("/nonexistent/fanout-child"));
    }

    #[tokio::test]
    async fn flood_of_output_is_held_to_budget() {
        let token = CancellationToken::new();
        let limits = CaptureLimits {
            stdout_bytes: 400,
            stderr_tail_bytes: 100,
        };
        let script = "head -c 2000000 /dev/zero | tr '\\0' x; \
                      head -c 500000 /dev/zero | tr '\\0' e >&2; echo LAST-LINE >&2";
        let result = run_process(sh(script), Duration::from_secs(30), &token, limits)
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.len(), 400);
        assert!(result.stdout.chars().all(|c| c == 'x'));
        assert_eq!(result.stdout_chars, 2_000_000);
        assert_eq!(result.stderr.len(), 100);
        assert!(result.stderr.ends_with("LAST-LINE\n"));
    }

    #[tokio::test]
    async fn stderr_tail_does_not_start_mid_character() {
        let token = CancellationToken::new();
        let limits = CaptureLimits {
            stdout_bytes: 16,
            stderr_tail_bytes: 5,
        };
        // Each "é" is two bytes; a 5-byte tail would start inside one.
        let result = run_process(sh("printf 'éééééé' >&2"), Duration::from_secs(5), &token, limits)
            .await
            .unwrap();
        assert_eq!(result.stderr, "éé");
    }
}
