//! JSONL session history.
//!
//! Each session appends structured events to `history.jsonl` inside its own
//! state directory. Two processes may append to the same file: the turn that
//! owns the session and the tool server it runs (`fanout serve`). The file is
//! opened with `O_APPEND` and every event goes out as one complete line in a
//! single write, so lines from the two writers never interleave.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use super::store::Session;

/// Returns the current UTC time as an ISO 8601 string with milliseconds.
pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// A structured history entry serialized as a single JSON line.
///
/// Tagged with `event_type` so each line is self-describing for replay.
#[derive(Debug, Serialize)]
#[serde(tag = "event_type")]
pub enum LogEntry {
    /// Marks the beginning of a process attached to this session.
    #[serde(rename = "session_start")]
    SessionStart {
        timestamp: String,
        session_id: String,
        agent: String,
        depth: u32,
        ancestry: Vec<String>,
    },

    /// A one-shot message handed to the agent-turn command.
    #[serde(rename = "turn_start")]
    TurnStart { timestamp: String, message: String },

    /// The agent-turn command finished.
    #[serde(rename = "turn_end")]
    TurnEnd {
        timestamp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        elapsed_secs: f64,
    },

    /// A delegation tool call requested by the model.
    #[serde(rename = "tool_call")]
    ToolCall {
        timestamp: String,
        call_id: String,
        fn_name: String,
        fn_arguments: serde_json::Value,
    },

    /// The text returned for a tool call.
    #[serde(rename = "tool_result")]
    ToolResult {
        timestamp: String,
        call_id: String,
        fn_name: String,
        result: String,
    },

    /// Marks the end of the process's use of this session.
    #[serde(rename = "session_end")]
    SessionEnd { timestamp: String, reason: String },
}

/// Append-only JSONL writer for one session's history.
pub struct SessionJournal {
    file: fs::File,
    log_path: PathBuf,
}

impl SessionJournal {
    /// Open (or create) the history file of `session` for appending.
    pub fn open(session: &Session) -> anyhow::Result<Self> {
        Self::open_at(&session.history_path())
    }

    pub fn open_at(log_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        Ok(Self {
            file,
            log_path: log_path.to_path_buf(),
        })
    }

    /// Serialize an entry as a single JSON line and append it in one write.
    pub fn log_event(&mut self, event: &LogEntry) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        Ok(())
    }

    /// Like [`Self::log_event`] but only warns on failure; history is
    /// best-effort and must never fail a delegation.
    pub fn record(&mut self, event: &LogEntry) {
        if let Err(e) = self.log_event(event) {
            tracing::warn!(
                "Failed to write session history at {}: {:#}",
                self.log_path.display(),
                e
            );
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn log_session_end(&mut self, reason: &str) {
        self.record(&LogEntry::SessionEnd {
            timestamp: now_iso(),
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use tempfile::TempDir;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        let file = fs::File::open(path).expect("open log");
        std::io::BufReader::new(file)
            .lines()
            .map(|l| serde_json::from_str(&l.expect("read line")).expect("valid JSON"))
            .collect()
    }

    #[test]
    fn writes_history_inside_session_dir() {
        let tmp = TempDir::new().unwrap();
        let session = Session::create(tmp.path(), "general").unwrap();
        let mut journal = SessionJournal::open(&session).unwrap();
        assert!(journal.log_path().starts_with(&session.state_dir));

        journal
            .log_event(&LogEntry::SessionStart {
                timestamp: now_iso(),
                session_id: session.id.to_string(),
                agent: "general".into(),
                depth: 1,
                ancestry: vec!["root-task".into()],
            })
            .unwrap();
        journal.log_session_end("turn_complete");

        let lines = read_lines(journal.log_path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_type"], "session_start");
        assert_eq!(lines[0]["depth"], 1);
        assert_eq!(lines[0]["ancestry"][0], "root-task");
        assert_eq!(lines[1]["event_type"], "session_end");
        assert_eq!(lines[1]["reason"], "turn_complete");
    }

    #[test]
    fn turn_end_without_exit_code_omits_field() {
        let tmp = TempDir::new().unwrap();
        let mut journal = SessionJournal::open_at(&tmp.path().join("history.jsonl")).unwrap();
        journal
            .log_event(&LogEntry::TurnEnd {
                timestamp: now_iso(),
                exit_code: None,
                elapsed_secs: 0.5,
            })
            .unwrap();

        let lines = read_lines(journal.log_path());
        assert_eq!(lines[0]["event_type"], "turn_end");
        assert!(lines[0].get("exit_code").is_none());
    }

    #[test]
    fn reopening_appends() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("history.jsonl");
        for turn in 0..2 {
            let mut journal = SessionJournal::open_at(&path).unwrap();
            journal
                .log_event(&LogEntry::TurnStart {
                    timestamp: now_iso(),
                    message: format!("turn {turn}"),
                })
                .unwrap();
        }
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["message"], "turn 1");
    }

    #[test]
    fn two_writers_on_one_file_keep_lines_whole() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("history.jsonl");
        let big = "r".repeat(64 * 1024);

        let handles: Vec<_> = ["turn", "serve"]
            .into_iter()
            .map(|writer| {
                let path = path.clone();
                let big = big.clone();
                std::thread::spawn(move || {
                    let mut journal = SessionJournal::open_at(&path).unwrap();
                    for i in 0..25 {
                        journal
                            .log_event(&LogEntry::ToolResult {
                                timestamp: now_iso(),
                                call_id: format!("{writer}-{i}"),
                                fn_name: "delegate".into(),
                                result: big.clone(),
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 50);
        assert!(lines.iter().all(|l| l["result"].as_str().unwrap().len() == big.len()));
    }
}
