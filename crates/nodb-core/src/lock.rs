//! Advisory file locking
//!
//! [`ExclusiveFileLock`] wraps one file and one OS-level exclusive lock on
//! it. Acquisition is reentrant for the owning thread: nested acquisitions
//! bump a count, and the OS lock is released (and the descriptor closed) only
//! when the count drops back to zero. Other threads block until then.
//!
//! The lock is advisory. It serializes writers that go through this crate,
//! nothing else.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, warn};

use crate::storage::error::{Error, Result};

#[derive(Default)]
struct Held {
    count: usize,
    file: Option<File>,
}

/// Reentrant exclusive lock on a single file
pub struct ExclusiveFileLock {
    path: PathBuf,
    held: ReentrantMutex<RefCell<Held>>,
}

impl ExclusiveFileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: ReentrantMutex::new(RefCell::new(Held::default())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of outstanding acquisitions
    ///
    /// Blocks while another thread holds the lock.
    pub fn depth(&self) -> usize {
        self.held.lock().borrow().count
    }

    /// Take the lock, blocking until no other thread holds it and the OS
    /// grants it
    ///
    /// The returned guard releases one level on drop, on every exit path.
    pub fn acquire(&self) -> Result<LockGuard<'_>> {
        let owner = self.held.lock();
        {
            let mut held = owner.borrow_mut();
            if held.count == 0 {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&self.path)
                    .map_err(|e| Error::from_io(e, self.path.clone()))?;
                file.lock_exclusive()
                    .map_err(|e| Error::from_io(e, self.path.clone()))?;
                debug!(target: "nodb::storage", path = ?self.path, "Acquired exclusive lock");
                held.file = Some(file);
            }
            held.count += 1;
        }
        Ok(LockGuard {
            lock: self,
            _owner: owner,
        })
    }

    /// Drop one level of the lock, or every level if `force`
    pub fn release(&self, force: bool) {
        let owner = self.held.lock();
        let mut held = owner.borrow_mut();
        if held.count == 0 {
            return;
        }
        held.count = if force { 0 } else { held.count - 1 };
        if held.count == 0 {
            if let Some(file) = held.file.take() {
                if let Err(e) = FileExt::unlock(&file) {
                    warn!(target: "nodb::storage", path = ?self.path, error = %e, "Failed to unlock");
                }
                debug!(target: "nodb::storage", path = ?self.path, "Released exclusive lock");
            }
        }
    }
}

impl Drop for ExclusiveFileLock {
    fn drop(&mut self) {
        self.release(true);
    }
}

/// Scope of one acquisition of an [`ExclusiveFileLock`]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a ExclusiveFileLock,
    /// Keeps other threads out until this level is released
    _owner: ReentrantMutexGuard<'a, RefCell<Held>>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let temp_dir = TempDir::new().unwrap();
        let lock = ExclusiveFileLock::new(temp_dir.path().join("doc.json.lock"));

        {
            let _guard = lock.acquire().unwrap();
            assert_eq!(lock.depth(), 1);
            assert!(lock.path().exists());
        }
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn test_reentrant_acquisition() {
        let temp_dir = TempDir::new().unwrap();
        let lock = ExclusiveFileLock::new(temp_dir.path().join("doc.json.lock"));

        let outer = lock.acquire().unwrap();
        let inner = lock.acquire().unwrap();
        assert_eq!(lock.depth(), 2);

        drop(inner);
        assert_eq!(lock.depth(), 1);
        drop(outer);
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn test_excludes_other_threads() {
        let temp_dir = TempDir::new().unwrap();
        let lock = ExclusiveFileLock::new(temp_dir.path().join("doc.json.lock"));
        let released = AtomicBool::new(false);

        thread::scope(|scope| {
            let guard = lock.acquire().unwrap();
            let waiter = scope.spawn(|| {
                let _guard = lock.acquire().unwrap();
                (released.load(Ordering::SeqCst), lock.depth())
            });

            thread::sleep(Duration::from_millis(50));
            released.store(true, Ordering::SeqCst);
            drop(guard);

            // The other thread got in only after the release, at depth one
            assert_eq!(waiter.join().unwrap(), (true, 1));
        });
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn test_forced_release() {
        let temp_dir = TempDir::new().unwrap();
        let lock = ExclusiveFileLock::new(temp_dir.path().join("doc.json.lock"));

        let a = lock.acquire().unwrap();
        let b = lock.acquire().unwrap();
        lock.release(true);
        assert_eq!(lock.depth(), 0);

        // Guards dropping after a forced release are harmless
        drop(b);
        drop(a);
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn test_released_on_error_path() {
        let temp_dir = TempDir::new().unwrap();
        let lock = ExclusiveFileLock::new(temp_dir.path().join("doc.json.lock"));

        let failing = || -> Result<()> {
            let _guard = lock.acquire()?;
            Err(Error::NotFound {
                path: PathBuf::from("x"),
            })
        };
        assert!(failing().is_err());
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn test_excludes_other_handles() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.json.lock");
        let lock = ExclusiveFileLock::new(&path);

        let _guard = lock.acquire().unwrap();
        let other = File::open(&path).unwrap();
        assert!(other.try_lock_exclusive().is_err());
    }

    #[test]
    fn test_missing_directory_fails() {
        let temp_dir = TempDir::new().unwrap();
        let lock = ExclusiveFileLock::new(temp_dir.path().join("nope").join("doc.json.lock"));

        let err = lock.acquire().err().unwrap();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(lock.depth(), 0);
    }
}
