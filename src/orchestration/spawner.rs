//! Child agent spawner.
//!
//! Turns a [`TaskSpec`] into a [`ChildResult`] by starting a fresh instance of
//! the program as an OS process:
//!
//! `<program> [program_args..] --agent <kind> --new-session -m <task>`
//!
//! The child gets its own session id, a recursion context one level deeper
//! than ours, and (optionally) a working-notes file seeded with the task's
//! initial context. Depth and parent shutdown are checked before anything
//! touches the filesystem.
//! The parent removes the child's ephemeral state once the result is in hand,
//! so cleanup happens even when the child crashed.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::recursion::{RecursionContext, SESSION_VAR};
use super::types::{ChildResult, TaskSpec, NO_EXIT_STATUS};
use crate::config::AppConfig;
use crate::error::DelegationError;
use crate::exec::{run_process, CaptureLimits, ExecResult};
use crate::session::store::{new_session_id, remove_session_dir, session_path, Session, SessionId};

/// Characters of stderr kept in a failure message.
const STDERR_TAIL_CHARS: usize = 2_000;

/// Upper bound on UTF-8 bytes per character, used to size capture buffers.
const MAX_UTF8_BYTES: usize = 4;

/// Everything the spawner needs from configuration.
#[derive(Clone, Debug)]
pub struct SpawnerConfig {
    pub program: PathBuf,
    pub program_args: Vec<String>,
    pub state_dir: PathBuf,
    pub max_parallel: usize,
    pub max_output_chars: usize,
    pub keep_child_sessions: bool,
}

impl From<&AppConfig> for SpawnerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            program: config.program.clone(),
            program_args: config.program_args.clone(),
            state_dir: config.state_dir.clone(),
            max_parallel: config.max_parallel,
            max_output_chars: config.max_output_chars,
            keep_child_sessions: config.keep_child_sessions,
        }
    }
}

/// Launches isolated child instances and enforces depth, time and output limits.
pub struct ChildSpawner {
    config: SpawnerConfig,
    context: RecursionContext,
    shutdown: CancellationToken,
}

impl ChildSpawner {
    pub fn new(config: SpawnerConfig, context: RecursionContext) -> Self {
        Self {
            config,
            context,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> &RecursionContext {
        &self.context
    }

    pub fn max_parallel(&self) -> usize {
        self.config.max_parallel.max(1)
    }

    /// Token that, once cancelled, kills every in-flight child and refuses
    /// to start new ones.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Why no child may be started right now, if anything.
    fn refusal(&self) -> Option<DelegationError> {
        if self.shutdown.is_cancelled() {
            return Some(DelegationError::Cancelled);
        }
        self.context.check_spawn().err()
    }

    fn capture_limits(&self) -> CaptureLimits {
        CaptureLimits {
            stdout_bytes: self.config.max_output_chars.saturating_mul(MAX_UTF8_BYTES),
            stderr_tail_bytes: STDERR_TAIL_CHARS * MAX_UTF8_BYTES,
        }
    }

    /// Run one task in a child process and wait for its result.
    pub async fn spawn(&self, spec: &TaskSpec, timeout: Duration) -> ChildResult {
        // 1. Depth and shutdown: rejected before any session or process exists.
        if let Some(e) = self.refusal() {
            tracing::warn!(
                depth = self.context.current_depth,
                max_depth = self.context.max_depth,
                agent = %spec.agent_kind,
                "Delegation rejected: {}",
                e
            );
            return ChildResult::rejected(spec, &e);
        }

        // 2. Fresh session for the child, with optional seeded notes.
        let child_id = new_session_id();
        let child_dir = match session_path(&self.config.state_dir, &spec.agent_kind, &child_id) {
            Ok(dir) => dir,
            Err(e) => {
                return ChildResult::rejected(spec, &DelegationError::SpawnFailed(e.to_string()));
            }
        };
        let seeded = match &spec.initial_context {
            Some(context) => match self.seed_child_notes(spec, &child_id, context) {
                Ok(session) => Some(session),
                Err(e) => {
                    self.cleanup(&child_dir, None);
                    return ChildResult::rejected(spec, &e);
                }
            },
            None => None,
        };

        // 3. The child's recursion context, one level deeper.
        let child_context = match self.context.child(child_id.as_str()) {
            Ok(ctx) => ctx,
            Err(e) => return ChildResult::rejected(spec, &e),
        };

        // 4. Launch and wait.
        let command = self.build_command(spec, &child_id, &child_context);
        tracing::info!(
            session = %child_id,
            agent = %spec.agent_kind,
            depth = child_context.current_depth,
            timeout_secs = timeout.as_secs(),
            "Spawning child agent"
        );
        let start = Instant::now();
        let outcome = run_process(command, timeout, &self.shutdown, self.capture_limits()).await;
        let elapsed_secs = start.elapsed().as_secs_f64();

        // 5. Classify and cap output.
        let mut result = match outcome {
            Ok(exec) => self.classify(spec, exec, timeout),
            Err(e) => {
                tracing::error!(session = %child_id, "Child launch failed: {}", e);
                ChildResult::rejected(spec, &DelegationError::SpawnFailed(e.to_string()))
            }
        };
        result.session_id = Some(child_id.to_string());
        result.elapsed_secs = elapsed_secs;

        // 6. Parent-side cleanup of ephemeral state.
        self.cleanup(&child_dir, seeded.as_ref());

        tracing::info!(
            session = %child_id,
            success = result.success,
            exit_status = result.exit_status,
            elapsed_secs,
            "Child agent finished"
        );
        result
    }

    /// Run many tasks with at most `max_parallel` children alive at once.
    /// Results come back in input order.
    pub async fn run_parallel(&self, specs: &[TaskSpec], timeout: Duration) -> Vec<ChildResult> {
        self.run_parallel_with(specs, timeout, |_, _| {}).await
    }

    /// Like [`Self::run_parallel`], calling `on_result(index, result)` as each
    /// child finishes (in completion order).
    pub async fn run_parallel_with<F>(
        &self,
        specs: &[TaskSpec],
        timeout: Duration,
        mut on_result: F,
    ) -> Vec<ChildResult>
    where
        F: FnMut(usize, &ChildResult),
    {
        // Depth and shutdown are properties of this process, so every spawn
        // would fail the same way; answer without touching the worker pool.
        if let Some(e) = self.refusal() {
            return specs
                .iter()
                .enumerate()
                .map(|(idx, spec)| {
                    let result = ChildResult::rejected(spec, &e);
                    on_result(idx, &result);
                    result
                })
                .collect();
        }

        let mut slots: Vec<Option<ChildResult>> = specs.iter().map(|_| None).collect();
        let mut finished = futures::stream::iter(specs.iter().enumerate())
            .map(|(idx, spec)| async move { (idx, self.spawn(spec, timeout).await) })
            .buffer_unordered(self.max_parallel());

        while let Some((idx, result)) = finished.next().await {
            on_result(idx, &result);
            slots[idx] = Some(result);
        }

        slots
            .into_iter()
            .zip(specs)
            .map(|(slot, spec)| {
                slot.unwrap_or_else(|| {
                    ChildResult::rejected(spec, &DelegationError::SpawnFailed("worker produced no result".into()))
                })
            })
            .collect()
    }

    fn seed_child_notes(
        &self,
        spec: &TaskSpec,
        child_id: &SessionId,
        context: &str,
    ) -> Result<Session, DelegationError> {
        let session = Session::with_id(&self.config.state_dir, &spec.agent_kind, child_id.clone())
            .map_err(|e| DelegationError::SpawnFailed(format!("cannot prepare child session: {e}")))?;
        session
            .seed_notes(context)
            .map_err(|e| DelegationError::SpawnFailed(format!("cannot seed working notes: {e}")))?;
        Ok(session)
    }

    fn build_command(
        &self,
        spec: &TaskSpec,
        child_id: &SessionId,
        child_context: &RecursionContext,
    ) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.program_args)
            .arg("--agent")
            .arg(&spec.agent_kind)
            .arg("--new-session")
            .arg("-m")
            .arg(&spec.description)
            .envs(child_context.to_env())
            .env(SESSION_VAR, child_id.as_str())
            .env("FANOUT_STATE_DIR", &self.config.state_dir);
        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn classify(&self, spec: &TaskSpec, exec: ExecResult, timeout: Duration) -> ChildResult {
        let success = exec.success();
        let error_message = if success {
            None
        } else if exec.timed_out {
            Some(
                DelegationError::TimedOut {
                    timeout_secs: timeout.as_secs(),
                }
                .to_string(),
            )
        } else if exec.cancelled {
            Some(DelegationError::Cancelled.to_string())
        } else {
            Some(describe_exit(&exec))
        };

        ChildResult {
            success,
            output: truncate_captured(&exec.stdout, exec.stdout_chars, self.config.max_output_chars),
            error_message,
            exit_status: exec.exit_code.unwrap_or(NO_EXIT_STATUS),
            agent_kind: spec.agent_kind.clone(),
            originating_task: spec.description.clone(),
            session_id: None,
            elapsed_secs: 0.0,
        }
    }

    /// Remove what the parent created for the child. With
    /// `keep_child_sessions` only the seeded notes go; otherwise the whole
    /// ephemeral session directory (including anything the child wrote).
    fn cleanup(&self, child_dir: &std::path::Path, seeded: Option<&Session>) {
        if let Some(session) = seeded {
            if let Err(e) = session.remove_notes() {
                tracing::warn!("Failed to remove child working notes: {}", e);
            }
        }
        if self.config.keep_child_sessions {
            return;
        }
        match remove_session_dir(child_dir) {
            Ok(()) => tracing::debug!(dir = %child_dir.display(), "Removed ephemeral child session"),
            Err(e) => tracing::warn!("Failed to remove child session: {}", e),
        }
    }
}

fn describe_exit(exec: &ExecResult) -> String {
    let mut message = match exec.exit_code {
        Some(code) => format!("exited with status {code}"),
        None => "terminated by signal".to_string(),
    };
    let stderr = exec.stderr.trim();
    if !stderr.is_empty() {
        message.push_str(": ");
        message.push_str(&tail_chars(stderr, STDERR_TAIL_CHARS));
    }
    message
}

fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        s.to_string()
    } else {
        s.chars().skip(count - max).collect()
    }
}

/// Cap `text` at `max_chars` characters. When anything is cut, the kept
/// prefix is followed by an explicit marker and the whole still fits the cap.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    truncate_captured(text, text.chars().count(), max_chars)
}

/// [`truncate_output`] for a captured head of a longer stream: `total` is the
/// character count of the whole stream, `text` only needs to cover the part
/// that is kept.
fn truncate_captured(text: &str, total: usize, max_chars: usize) -> String {
    if total <= max_chars {
        return text.to_string();
    }

    let marker_for = |kept: usize| format!("\n[output truncated: showing {kept} of {total} characters]");
    // The marker with `max_chars` in it is at least as long as the final one.
    let kept = max_chars.saturating_sub(marker_for(max_chars).chars().count());
    let marker = marker_for(kept);

    if kept == 0 {
        return marker.chars().take(max_chars).collect();
    }

    let mut out: String = text.chars().take(kept).collect();
    out.push_str(&marker);
    out
}
