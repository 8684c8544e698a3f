//! One-shot agent turn: `fanout --agent <kind> [--new-session] -m <message>`.
//!
//! The language-model side of a turn is an external command (`agent_command`
//! in the config). This module resolves the session the turn belongs to, hands
//! the message to that command with stdout/stderr inherited (a delegating
//! parent reads the child's stdout as its result) and journals the turn.

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use anyhow::Context;
use tokio::process::Command;

use crate::config::AppConfig;
use crate::orchestration::types::NO_EXIT_STATUS;
use crate::orchestration::recursion::SESSION_VAR;
use crate::orchestration::RecursionContext;
use crate::session::journal::now_iso;
use crate::session::{LogEntry, Session, SessionId, SessionJournal};

/// Environment variable naming the session directory for the turn command.
pub const SESSION_DIR_VAR: &str = "FANOUT_SESSION_DIR";
/// Environment variable naming the agent profile for the turn command.
pub const AGENT_VAR: &str = "FANOUT_AGENT";
/// Environment variable pointing at the seeded working notes, when present.
pub const NOTES_VAR: &str = "FANOUT_NOTES";

/// How the caller asked to pick a session.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub new_session: bool,
    pub resume: Option<String>,
    /// Id a delegating parent allocated, from `FANOUT_SESSION_ID`.
    pub inherited_id: Option<String>,
}

/// Open or create the session a turn runs in.
///
/// `--resume` must name an existing session. `--new-session` adopts an id the
/// parent allocated (the directory may already hold seeded notes); otherwise a
/// fresh id is allocated and any inherited id is ignored.
pub fn resolve_session(
    config: &AppConfig,
    agent_kind: &str,
    request: &SessionRequest,
) -> anyhow::Result<Session> {
    if let Some(raw) = &request.resume {
        let id = SessionId::parse(raw)?;
        return Session::open(&config.state_dir, agent_kind, id)
            .with_context(|| format!("Cannot resume session {raw}"));
    }

    let inherited = request
        .inherited_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let session = match inherited {
        Some(raw) if request.new_session => {
            Session::with_id(&config.state_dir, agent_kind, SessionId::parse(raw)?)?
        }
        _ => Session::create(&config.state_dir, agent_kind)?,
    };
    Ok(session)
}

/// Run one turn in `session` and return the exit code to propagate.
pub async fn run_turn(
    config: &AppConfig,
    context: &RecursionContext,
    session: &Session,
    message: &str,
) -> anyhow::Result<i32> {
    let Some((program, args)) = config.agent_command.split_first() else {
        anyhow::bail!(
            "No agent_command configured; set [general] agent_command in fanout.toml"
        );
    };

    let mut journal = SessionJournal::open(session)?;
    journal.record(&LogEntry::SessionStart {
        timestamp: now_iso(),
        session_id: session.id.to_string(),
        agent: session.agent_kind.clone(),
        depth: context.current_depth,
        ancestry: context.ancestry.clone(),
    });
    journal.record(&LogEntry::TurnStart {
        timestamp: now_iso(),
        message: message.to_string(),
    });

    let cwd = match session.load_cwd()? {
        Some(dir) if dir.is_dir() => dir,
        _ => std::env::current_dir().context("Cannot determine working directory")?,
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .arg(message)
        .current_dir(&cwd)
        .env(SESSION_VAR, session.id.as_str())
        .env(SESSION_DIR_VAR, &session.state_dir)
        .env(AGENT_VAR, &session.agent_kind)
        .env("FANOUT_STATE_DIR", &config.state_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    if session.notes_path().is_file() {
        cmd.env(NOTES_VAR, session.notes_path());
    } else {
        cmd.env_remove(NOTES_VAR);
    }

    tracing::info!(
        session = %session.id,
        agent = %session.agent_kind,
        depth = context.current_depth,
        program = %program,
        "Starting agent turn"
    );

    let started = Instant::now();
    let status = cmd
        .status()
        .await
        .with_context(|| format!("Failed to run agent command `{program}`"))?;
    let elapsed_secs = started.elapsed().as_secs_f64();

    journal.record(&LogEntry::TurnEnd {
        timestamp: now_iso(),
        exit_code: status.code(),
        elapsed_secs,
    });
    journal.log_session_end(if status.success() { "completed" } else { "failed" });

    save_cursor(session, &cwd);

    tracing::info!(session = %session.id, exit_code = ?status.code(), elapsed_secs, "Agent turn finished");
    Ok(status.code().unwrap_or(NO_EXIT_STATUS))
}

fn save_cursor(session: &Session, cwd: &Path) {
    if let Err(e) = session.save_cwd(cwd) {
        tracing::warn!(session = %session.id, "Failed to save working directory: {}", e);
    }
}
