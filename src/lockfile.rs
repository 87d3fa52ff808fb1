//! Advisory file locks for cross-process coordination.
//!
//! POSIX uses `flock`; Windows gets a best-effort lock (the open handle).
//! Lock files sit next to the data they protect, never inside a directory
//! that deletion would remove.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::CoreError;

#[cfg(unix)]
use nix::fcntl::{Flock, FlockArg};

/// An exclusive advisory lock, released on drop.
pub struct FileLock {
    path: PathBuf,
    #[cfg(unix)]
    _guard: Flock<File>,
    #[cfg(windows)]
    _file: File,
}

impl FileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

fn open_lock_file(path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    // Never truncate: another process may be inspecting the file.
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    Ok(file)
}

/// Block until the exclusive lock on `path` is held.
pub fn lock_exclusive(path: &Path) -> Result<FileLock, CoreError> {
    let file = open_lock_file(path)?;
    #[cfg(unix)]
    {
        let guard = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| CoreError::Io(std::io::Error::from_raw_os_error(errno as i32)))?;
        Ok(FileLock {
            path: path.to_path_buf(),
            _guard: guard,
        })
    }
    #[cfg(windows)]
    {
        Ok(FileLock {
            path: path.to_path_buf(),
            _file: file,
        })
    }
}

/// Try to take the exclusive lock without blocking.
/// Returns `Ok(None)` when another holder has it.
pub fn try_lock_exclusive(path: &Path) -> Result<Option<FileLock>, CoreError> {
    let file = open_lock_file(path)?;
    #[cfg(unix)]
    {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(guard) => Ok(Some(FileLock {
                path: path.to_path_buf(),
                _guard: guard,
            })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(CoreError::Io(std::io::Error::from_raw_os_error(
                errno as i32,
            ))),
        }
    }
    #[cfg(windows)]
    {
        Ok(Some(FileLock {
            path: path.to_path_buf(),
            _file: file,
        }))
    }
}

/// Acquire several locks in lexicographic key order, the deadlock-avoidance
/// rule for bulk workspace operations. Any failure releases every lock
/// already taken (by dropping them) before the error propagates.
pub fn lock_all_sorted(mut keyed_paths: Vec<(String, PathBuf)>) -> Result<Vec<FileLock>, CoreError> {
    keyed_paths.sort_by(|a, b| a.0.cmp(&b.0));
    let mut locks = Vec::with_capacity(keyed_paths.len());
    for (_, path) in &keyed_paths {
        locks.push(lock_exclusive(path)?);
    }
    Ok(locks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_creates_parent_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks").join("ws.lock");
        let lock = lock_exclusive(&path).unwrap();
        assert!(path.exists());
        assert_eq!(lock.path(), path);
    }

    #[cfg(unix)]
    #[test]
    fn exclusive_lock_blocks_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lock");
        let held = lock_exclusive(&path).unwrap();
        assert!(try_lock_exclusive(&path).unwrap().is_none());
        drop(held);
        assert!(try_lock_exclusive(&path).unwrap().is_some());
    }

    #[test]
    fn bulk_lock_orders_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let keyed = vec![
            ("b".to_string(), dir.path().join("b.lock")),
            ("a".to_string(), dir.path().join("a.lock")),
            ("c".to_string(), dir.path().join("c.lock")),
        ];
        let locks = lock_all_sorted(keyed).unwrap();
        let names: Vec<_> = locks
            .iter()
            .map(|l| l.path().file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.lock", "b.lock", "c.lock"]);
    }
}
