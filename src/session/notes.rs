//! Protected notes shared by every session under one state directory.

use std::path::{Path, PathBuf};

use super::journal::now_iso;
use super::lock::{read_locked, update_locked};
use crate::error::SessionError;

/// Markdown notes file that concurrent agent processes append to.
#[derive(Clone, Debug)]
pub struct SharedNotes {
    path: PathBuf,
}

impl SharedNotes {
    /// Notes live at `<state_dir>/shared/notes.md`.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("shared").join("notes.md"),
        }
    }

    /// Current contents; an absent file reads as empty.
    pub fn read(&self) -> Result<String, SessionError> {
        Ok(read_locked(&self.path)?.unwrap_or_default())
    }

    /// Append an entry attributed to `author` and return the new length.
    pub fn append(&self, author: &str, text: &str) -> Result<usize, SessionError> {
        let entry = format!("\n## {} ({})\n\n{}\n", now_iso(), author, text.trim_end());
        let updated = update_locked(&self.path, |prev| {
            let mut doc = prev.unwrap_or_default();
            doc.push_str(&entry);
            doc
        })?;
        tracing::debug!(path = %self.path.display(), author, "Appended shared note");
        Ok(updated.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn read_of_missing_notes_is_empty() {
        let tmp = TempDir::new().unwrap();
        let notes = SharedNotes::new(tmp.path());
        assert_eq!(notes.read().unwrap(), "");
    }

    #[test]
    fn concurrent_appends_are_all_kept() {
        let tmp = TempDir::new().unwrap();
        let notes = SharedNotes::new(tmp.path());

        let handles: Vec<_> = (0..6)
            .map(|w| {
                let notes = notes.clone();
                thread::spawn(move || {
                    for i in 0..10 {
                        notes.append(&format!("writer-{w}"), &format!("entry {w}-{i}")).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let doc = notes.read().unwrap();
        for w in 0..6 {
            for i in 0..10 {
                assert!(doc.contains(&format!("entry {w}-{i}\n")), "missing entry {w}-{i}");
            }
        }
        assert_eq!(doc.matches("## ").count(), 60);
    }
}
