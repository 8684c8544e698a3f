//! Advisory locking and atomic persistence for files shared across processes.
//!
//! Locks are taken on a sidecar `<file>.lock` rather than the resource itself,
//! so the rename performed by [`atomic_write`] never swaps out the inode a
//! lock is held on. The lock lives on the open file descriptor: when the
//! holder exits or crashes the kernel drops it, and the (empty) sidecar file
//! carries no state that could wedge a later run.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::SessionError;

/// Held advisory lock. Released on drop, including during unwinding.
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!(path = %self.path.display(), "Explicit unlock failed: {}", e);
        }
    }
}

/// Sidecar lock file path for a resource: `notes.md` -> `notes.md.lock`.
pub fn lock_path_for(resource: &Path) -> PathBuf {
    let mut name = resource
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("resource"));
    name.push(".lock");
    resource.with_file_name(name)
}

/// Block until an exclusive (writer) or shared (reader) lock on `resource`
/// is held.
pub fn acquire(resource: &Path, exclusive: bool) -> Result<LockGuard, SessionError> {
    let path = lock_path_for(resource);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| SessionError::io(parent, e))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| SessionError::io(&path, e))?;

    let locked = if exclusive {
        FileExt::lock_exclusive(&file)
    } else {
        FileExt::lock_shared(&file)
    };
    locked.map_err(|source| SessionError::Lock {
        path: path.clone(),
        source,
    })?;

    tracing::debug!(path = %path.display(), exclusive, "Lock acquired");
    Ok(LockGuard { file, path })
}

/// Run `f` while holding a lock on `resource`; the lock is released on every
/// exit path.
pub fn with_lock<T, F>(resource: &Path, exclusive: bool, f: F) -> Result<T, SessionError>
where
    F: FnOnce() -> Result<T, SessionError>,
{
    let _guard = acquire(resource, exclusive)?;
    f()
}

/// Replace `path` with `content` so that concurrent readers see either the
/// old or the new file in full.
///
/// Writes a temporary file in the same directory (same filesystem, so the
/// rename is atomic), fsyncs it, then renames it over the target.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<(), SessionError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| SessionError::io(&dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| SessionError::io(&dir, e))?;
    tmp.write_all(content)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| SessionError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| SessionError::io(path, e.error))?;
    Ok(())
}

/// Read a shared file under a shared lock. A missing file reads as `None`.
pub fn read_locked(path: &Path) -> Result<Option<String>, SessionError> {
    with_lock(path, false, || read_optional(path))
}

/// Read-modify-write under an exclusive lock, persisted with [`atomic_write`].
pub fn update_locked<F>(path: &Path, f: F) -> Result<String, SessionError>
where
    F: FnOnce(Option<String>) -> String,
{
    with_lock(path, true, || {
        let next = f(read_optional(path)?);
        atomic_write(path, next.as_bytes())?;
        Ok(next)
    })
}

fn read_optional(path: &Path) -> Result<Option<String>, SessionError> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SessionError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn lock_path_is_a_sidecar() {
        let p = lock_path_for(Path::new("/data/shared/notes.md"));
        assert_eq!(p, PathBuf::from("/data/shared/notes.md.lock"));
    }

    #[test]
    fn atomic_write_then_read_round_trips() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("state.json");
        atomic_write(&target, b"{\"a\":1}").unwrap();
        atomic_write(&target, b"{\"a\":2}").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "{\"a\":2}");

        // Only the target and nothing else: temp files were renamed away.
        let entries: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn atomic_write_creates_parent_dirs() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("a/b/c.txt");
        atomic_write(&target, b"nested").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "nested");
    }

    #[test]
    fn lock_is_released_when_closure_errors() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("res.txt");

        let result: Result<(), SessionError> = with_lock(&target, true, || {
            Err(SessionError::InvalidId("boom".into()))
        });
        assert!(result.is_err());

        // A second exclusive lock must not block.
        with_lock(&target, true, || Ok(())).unwrap();
    }

    #[test]
    fn shared_locks_coexist() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("res.txt");
        let first = acquire(&target, false).unwrap();
        let second = acquire(&target, false).unwrap();
        assert_eq!(first.lock_path(), second.lock_path());
    }

    #[test]
    fn concurrent_read_modify_write_loses_no_updates() {
        let tmp = TempDir::new().unwrap();
        let target = Arc::new(tmp.path().join("counter.txt"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let target = Arc::clone(&target);
                thread::spawn(move || {
                    for _ in 0..25 {
                        update_locked(&target, |prev| {
                            let n: u64 = prev.and_then(|s| s.trim().parse().ok()).unwrap_or(0);
                            (n + 1).to_string()
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let value = read_locked(&target).unwrap().unwrap();
        assert_eq!(value, "200");
    }
}
