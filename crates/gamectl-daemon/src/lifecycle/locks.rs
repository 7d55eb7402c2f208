//! Per-server mutual exclusion.
//!
//! Two layers: an async mutex per id serializes tasks of this process, and
//! an advisory lock on `<dir>/<id>.lock` serializes separate processes
//! sharing one data directory. The mutex is always taken first, so at most
//! one task per process ever waits on the file.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use fs2::FileExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Held for the duration of one mutating operation on a server.
///
/// Owned, so a spawned task (the launch) can hold it past the call that
/// acquired it. Dropping it releases the file lock, then the mutex.
pub struct ServerGuard {
    _file: File,
    _local: OwnedMutexGuard<()>,
}

/// Lock table keyed by server id.
///
/// Lock files are never unlinked: a waiter blocked on a removed file would
/// hold a lock nobody else can see.
pub struct ServerLocks {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ServerLocks {
    /// Lock table whose lock files live in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// The existing mutex for `id`, without registering one.
    fn existing(&self, id: &str) -> Option<Arc<AsyncMutex<()>>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.lock"))
    }

    /// Wait for exclusive access to `id`, across processes.
    pub async fn lock(&self, id: &str) -> io::Result<ServerGuard> {
        let local = self.entry(id).lock_owned().await;
        let path = self.lock_path(id);
        let file = tokio::task::spawn_blocking(move || -> io::Result<File> {
            let file = open_lock_file(&path)?;
            FileExt::lock_exclusive(&file)?;
            Ok(file)
        })
        .await
        .map_err(io::Error::other)??;
        Ok(ServerGuard {
            _file: file,
            _local: local,
        })
    }

    /// Exclusive access to `id` if nobody, in any process, holds it now.
    ///
    /// Never registers `id` in the table, so it cannot bring back an entry
    /// that [`remove`](Self::remove) dropped.
    pub fn try_lock(&self, id: &str) -> Option<ServerGuard> {
        let mutex = self
            .existing(id)
            .unwrap_or_else(|| Arc::new(AsyncMutex::new(())));
        let local = mutex.try_lock_owned().ok()?;

        let file = match open_lock_file(&self.lock_path(id)) {
            Ok(file) => file,
            Err(e) => {
                warn!(server_id = id, error = %e, "Cannot open server lock file");
                return None;
            }
        };
        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            debug!(server_id = id, error = %e, "Server locked by another process");
            return None;
        }
        Some(ServerGuard {
            _file: file,
            _local: local,
        })
    }

    /// Forget `id` once its server is gone. Waiters holding a clone of the
    /// old mutex still serialize among themselves and on the lock file.
    pub fn remove(&self, id: &str) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_id_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = ServerLocks::new(tmp.path());
        let guard = locks.lock("a").await.unwrap();
        assert!(locks.try_lock("a").is_none());
        assert!(locks.try_lock("b").is_some());
        drop(guard);
        assert!(locks.try_lock("a").is_some());
    }

    #[tokio::test]
    async fn removed_entries_are_recreated_by_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = ServerLocks::new(tmp.path());
        drop(locks.lock("a").await.unwrap());
        assert_eq!(locks.len(), 1);
        locks.remove("a");
        assert!(locks.is_empty());
        drop(locks.lock("a").await.unwrap());
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn try_lock_does_not_register_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = ServerLocks::new(tmp.path());
        assert!(locks.try_lock("never-locked").is_some());
        assert!(locks.is_empty());

        drop(locks.lock("a").await.unwrap());
        locks.remove("a");
        assert!(locks.try_lock("a").is_some());
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn tables_sharing_a_directory_exclude_each_other() {
        let tmp = tempfile::tempdir().unwrap();
        let first = ServerLocks::new(tmp.path());
        let second = ServerLocks::new(tmp.path());

        let guard = first.lock("a").await.unwrap();
        assert!(second.try_lock("a").is_none());
        assert!(second.try_lock("b").is_some());

        let waiter = tokio::spawn(async move { second.lock("a").await.map(drop) });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
