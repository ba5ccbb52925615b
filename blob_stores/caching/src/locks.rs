use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Mutex,
    thread,
    time::Duration,
};

const LOCK_ATTEMPTS: u32 = 20;
const INITIAL_DELAY: Duration = Duration::from_millis(1);
const MAX_DELAY: Duration = Duration::from_millis(100);

/// Advisory in-process locks on cache files.
///
/// Held while a file's mtime is updated on access or while it is evicted,
/// so that an eviction never deletes a file that was just touched. One
/// instance is shared by every cache of a process.
#[derive(Debug, Default)]
pub struct FileLocks {
    locked: Mutex<HashSet<PathBuf>>,
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_lock(&self, path: &Path) -> Option<FileLockGuard<'_>> {
        let mut locked = self.locked.lock().unwrap_or_else(|e| e.into_inner());
        locked.insert(path.to_path_buf()).then(|| FileLockGuard {
            locks: self,
            path: path.to_path_buf(),
        })
    }

    /// Acquires the lock with capped exponential backoff. `None` means
    /// someone else is holding it for long, and the caller should skip the
    /// file.
    pub fn lock(&self, path: &Path) -> Option<FileLockGuard<'_>> {
        let mut delay = INITIAL_DELAY;
        for attempt in 0..LOCK_ATTEMPTS {
            if let Some(guard) = self.try_lock(path) {
                return Some(guard);
            }
            thread::sleep(delay);
            if attempt >= 10 {
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
        tracing::debug!("could not lock {}", path.display());
        None
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        self.locked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
    }

    fn unlock(&self, path: &Path) {
        self.locked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }
}

#[derive(Debug)]
pub struct FileLockGuard<'a> {
    locks: &'a FileLocks,
    path: PathBuf,
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.unlock(&self.path);
    }
}
