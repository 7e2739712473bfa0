//! `flock(2)`-based file locks.
//!
//! Used for store-wide mutations and for `--mount=type=cache,sharing=locked`.
//! The lock is released when the guard is dropped, or when the process
//! exits or crashes.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use stevedore_shared::errors::{StevedoreError, StevedoreResult};

/// A held exclusive lock on a file.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until an exclusive lock on `path` is held.
    pub fn acquire(path: &Path) -> StevedoreResult<Self> {
        Self::lock(path, libc::LOCK_EX)
    }

    /// Acquire without blocking; fails if another holder exists.
    pub fn try_acquire(path: &Path) -> StevedoreResult<Self> {
        Self::lock(path, libc::LOCK_EX | libc::LOCK_NB)
    }

    fn lock(path: &Path, operation: libc::c_int) -> StevedoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StevedoreError::io(format!("Failed to create lock dir {}", parent.display()), e)
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                StevedoreError::io(format!("Failed to open lock file {}", path.display()), e)
            })?;

        loop {
            let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
            if result == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            match err.kind() {
                std::io::ErrorKind::Interrupted => continue,
                std::io::ErrorKind::WouldBlock => {
                    return Err(StevedoreError::Resource(format!(
                        "Lock {} is held by another process",
                        path.display()
                    )));
                }
                _ => {
                    return Err(StevedoreError::io(
                        format!("Failed to acquire lock {}", path.display()),
                        err,
                    ));
                }
            }
        }

        tracing::trace!(lock_path = %path.display(), "Acquired lock");

        Ok(FileLock {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::trace!(lock_path = %self.path.display(), "Released lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_creates_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("locks/a.lock");
        let lock = FileLock::acquire(&path).unwrap();
        assert!(lock.path().exists());
    }

    #[test]
    fn test_try_acquire_conflicts() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("x.lock");

        let _lock1 = FileLock::acquire(&path).unwrap();
        let result = FileLock::try_acquire(&path);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("held by another"));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("x.lock");
        {
            let _lock = FileLock::acquire(&path).unwrap();
        }
        assert!(FileLock::try_acquire(&path).is_ok());
    }

    #[test]
    fn test_blocking_acquire_waits_for_release() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("x.lock");
        let first = FileLock::acquire(&path).unwrap();
        let acquired = Arc::new(AtomicBool::new(false));

        let waiter = {
            let path = path.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                let _second = FileLock::acquire(&path).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(first);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
