//! Per-project apply lock
//!
//! Two applies against the same working tree would race on the index and on
//! the files themselves. Lock files live outside the project, keyed by a hash
//! of its canonical root, so taking the lock never writes into the working
//! tree and never needs a repository to exist yet.

use crate::error::ApplyError;
use crate::util::hash_str;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_DIR: &str = "cosmos-apply";
const LOCK_RETRY_MS: u64 = 50;

/// Directory holding the per-project lock files.
pub fn lock_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(LOCK_DIR)
        .join("locks")
}

/// Held for the duration of one apply; released on drop.
#[derive(Debug)]
pub struct ProjectLock {
    file: File,
    path: PathBuf,
}

impl ProjectLock {
    /// Take the lock for the project at `project_root`, waiting up to
    /// `timeout`.
    pub fn for_project(project_root: &Path, timeout: Duration) -> Result<Self, ApplyError> {
        let root = project_root
            .canonicalize()
            .map_err(|e| ApplyError::io(project_root, e))?;
        let dir = lock_dir();
        fs::create_dir_all(&dir).map_err(|e| ApplyError::io(&dir, e))?;
        let name = format!("{}.lock", hash_str(&root.to_string_lossy()));
        Self::acquire(&dir.join(name), timeout)
    }

    /// Take an exclusive lock on the file at `path`, waiting up to `timeout`.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, ApplyError> {
        let path = path.to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| ApplyError::io(&path, e))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) => {
                    if !is_contended(&err) {
                        return Err(ApplyError::io(&path, err));
                    }
                    if start.elapsed() >= timeout {
                        tracing::warn!(lock = %path.display(), "timed out waiting for apply lock");
                        return Err(ApplyError::Locked(path));
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
            }
        }

        tracing::debug!(lock = %path.display(), "acquired apply lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_holder_times_out_until_first_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lock");
        let first = ProjectLock::acquire(&path, Duration::from_millis(100)).unwrap();

        let err = ProjectLock::acquire(&path, Duration::from_millis(120)).unwrap_err();
        assert!(matches!(err, ApplyError::Locked(ref p) if p == first.path()));

        drop(first);
        assert!(ProjectLock::acquire(&path, Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_missing_lock_dir_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProjectLock::acquire(&dir.path().join("nope/a.lock"), Duration::ZERO).unwrap_err();
        assert!(matches!(err, ApplyError::Io { .. }));
    }

    #[test]
    fn test_project_lock_stays_out_of_the_tree() {
        let project = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();

        let held = ProjectLock::for_project(project.path(), Duration::ZERO).unwrap();
        assert!(held.path().starts_with(lock_dir()));
        assert_eq!(std::fs::read_dir(project.path()).unwrap().count(), 0);

        let same = ProjectLock::for_project(project.path(), Duration::ZERO).unwrap_err();
        assert!(matches!(same, ApplyError::Locked(_)));
        assert!(ProjectLock::for_project(other.path(), Duration::ZERO).is_ok());
    }
}
