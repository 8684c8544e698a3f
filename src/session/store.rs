//! Per-process session identity and private state directories.
//!
//! Every running instance gets a [`SessionId`] and a directory under
//! `<state_dir>/sessions/<agent_kind>/<session_id>/` for mutable state only it
//! touches: the JSONL history, the working-directory cursor, and ephemeral
//! working notes seeded by a delegating parent.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use uuid::Uuid;

use super::lock::{atomic_write, read_locked, with_lock};
use crate::error::SessionError;

const SESSIONS_DIR: &str = "sessions";
const HISTORY_FILE: &str = "history.jsonl";
const CWD_FILE: &str = "cwd";
const NOTES_FILE: &str = "notes.md";

/// Unique identifier for one running instance.
///
/// Format: `YYYYMMDDTHHMMSSmmm-xxxxxxxx` (UTC time with milliseconds, then
/// eight hex chars of a v4 UUID). Sorts by creation time and needs no
/// coordination between processes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Validate an id received from outside (CLI flag, environment).
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        if !is_safe_component(raw) {
            return Err(SessionError::InvalidId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Allocate a fresh session id.
pub fn new_session_id() -> SessionId {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
    let suffix = Uuid::new_v4().simple().to_string();
    SessionId(format!("{stamp}-{}", &suffix[..8]))
}

/// Compute a session directory without touching the filesystem.
pub fn session_path(base: &Path, agent_kind: &str, id: &SessionId) -> Result<PathBuf, SessionError> {
    if !is_safe_component(agent_kind) {
        return Err(SessionError::InvalidAgentKind(agent_kind.to_string()));
    }
    Ok(base.join(SESSIONS_DIR).join(agent_kind).join(id.as_str()))
}

/// Compute and create (if absent) the directory for a session.
///
/// `create_dir_all` treats an already-existing directory as success, so two
/// processes racing to create the same or sibling directories both succeed.
pub fn session_directory(
    base: &Path,
    agent_kind: &str,
    id: &SessionId,
) -> Result<PathBuf, SessionError> {
    let path = session_path(base, agent_kind, id)?;
    std::fs::create_dir_all(&path).map_err(|source| SessionError::CreateDir {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Agent kinds and session ids become path components; keep them to a safe
/// alphabet so neither can escape the state directory.
fn is_safe_component(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= 128
        && raw != "."
        && raw != ".."
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Delete a session directory and everything in it. Missing is fine.
pub fn remove_session_dir(dir: &Path) -> Result<(), SessionError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SessionError::io(dir, e)),
    }
}

/// The isolation unit for one running process.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub state_dir: PathBuf,
    pub agent_kind: String,
}

impl Session {
    /// Start a brand-new session with a freshly allocated id.
    pub fn create(base: &Path, agent_kind: &str) -> Result<Self, SessionError> {
        Self::with_id(base, agent_kind, new_session_id())
    }

    /// Start a session under an id allocated elsewhere (a delegating parent).
    pub fn with_id(base: &Path, agent_kind: &str, id: SessionId) -> Result<Self, SessionError> {
        let state_dir = session_directory(base, agent_kind, &id)?;
        Ok(Self {
            id,
            state_dir,
            agent_kind: agent_kind.to_string(),
        })
    }

    /// Reopen an existing session for an explicit resume.
    pub fn open(base: &Path, agent_kind: &str, id: SessionId) -> Result<Self, SessionError> {
        let state_dir = session_path(base, agent_kind, &id)?;
        if !state_dir.is_dir() {
            return Err(SessionError::NotFound {
                id: id.to_string(),
                base: base.to_path_buf(),
            });
        }
        Ok(Self {
            id,
            state_dir,
            agent_kind: agent_kind.to_string(),
        })
    }

    pub fn history_path(&self) -> PathBuf {
        self.state_dir.join(HISTORY_FILE)
    }

    pub fn cwd_path(&self) -> PathBuf {
        self.state_dir.join(CWD_FILE)
    }

    pub fn notes_path(&self) -> PathBuf {
        self.state_dir.join(NOTES_FILE)
    }

    /// Materialize the working-notes file with an initial context.
    pub fn seed_notes(&self, content: &str) -> Result<PathBuf, SessionError> {
        let path = self.notes_path();
        atomic_write(&path, content.as_bytes())?;
        Ok(path)
    }

    /// Delete the working-notes file. Missing is fine.
    pub fn remove_notes(&self) -> Result<(), SessionError> {
        let path = self.notes_path();
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::io(path, e)),
        }
    }

    /// Last working directory recorded for this session, if any.
    pub fn load_cwd(&self) -> Result<Option<PathBuf>, SessionError> {
        let raw = read_locked(&self.cwd_path())?;
        Ok(raw
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from))
    }

    pub fn save_cwd(&self, dir: &Path) -> Result<(), SessionError> {
        let path = self.cwd_path();
        with_lock(&path, true, || {
            atomic_write(&path, dir.to_string_lossy().as_bytes())
        })
    }

    /// Delete the whole session directory.
    pub fn remove(self) -> Result<(), SessionError> {
        remove_session_dir(&self.state_dir)
    }
}
