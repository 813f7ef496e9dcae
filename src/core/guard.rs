//! Concurrency guard: at most one pipeline run per deployment.
//!
//! Within a process the guard is a single-permit semaphore. When a lock
//! file is configured, the lease also holds an exclusive `flock` on it, so
//! separate processes sharing the file exclude each other too.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// How often a waiting caller re-checks the lock file
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum GuardError {
    /// Another run holds the lease
    #[error("another pipeline run is in progress")]
    Busy,

    #[error("failed to lock {}: {source}", path.display())]
    LockFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GuardError {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

/// Admits one run at a time
#[derive(Debug, Clone)]
pub struct ConcurrencyGuard {
    permits: Arc<Semaphore>,
    lock_file: Option<PathBuf>,
}

impl Default for ConcurrencyGuard {
    fn default() -> Self {
        Self::in_process()
    }
}

impl ConcurrencyGuard {
    /// Guard runs within this process only
    pub fn in_process() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
            lock_file: None,
        }
    }

    /// Guard runs within this process and across processes sharing `path`
    pub fn with_lock_file(path: impl Into<PathBuf>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
            lock_file: Some(path.into()),
        }
    }

    pub fn lock_file(&self) -> Option<&Path> {
        self.lock_file.as_deref()
    }

    /// Whether a run currently holds this guard's permit
    pub fn is_held(&self) -> bool {
        self.permits.available_permits() == 0
    }

    /// Take the lease if it is free, without waiting
    pub fn try_acquire(&self) -> Result<Lease, GuardError> {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| GuardError::Busy)?;

        let id = Uuid::new_v4();
        let file = match &self.lock_file {
            Some(path) => Some(lock(path, id)?),
            None => None,
        };

        Ok(Lease::new(id, permit, file))
    }

    /// Take the lease, waiting up to `wait` for the current holder to finish.
    ///
    /// Callers inside this process are served in arrival order. The lock
    /// file can only be polled, so a holder in another process is waited
    /// out by retrying until the same deadline.
    pub async fn acquire_within(&self, wait: Duration) -> Result<Lease, GuardError> {
        let deadline = Instant::now() + wait;

        let permit = tokio::time::timeout_at(deadline, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| GuardError::Busy)?
            .map_err(|_| GuardError::Busy)?;

        let id = Uuid::new_v4();
        let file = match &self.lock_file {
            Some(path) => Some(lock_until(path, id, deadline).await?),
            None => None,
        };

        Ok(Lease::new(id, permit, file))
    }
}

async fn lock_until(path: &Path, id: Uuid, deadline: Instant) -> Result<File, GuardError> {
    loop {
        match lock(path, id) {
            Err(GuardError::Busy) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(GuardError::Busy);
                }
                tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
            }
            other => return other,
        }
    }
}

fn lock(path: &Path, id: Uuid) -> Result<File, GuardError> {
    let lock_err = |source| GuardError::LockFile {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(lock_err)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(lock_err)?;

    if let Err(e) = file.try_lock_exclusive() {
        if e.kind() == fs2::lock_contended_error().kind() {
            return Err(GuardError::Busy);
        }
        return Err(lock_err(e));
    }

    // Record the holder for operators; the lock itself is what matters
    file.set_len(0).map_err(lock_err)?;
    writeln!(file, "{} pid={}", id, std::process::id()).map_err(lock_err)?;

    Ok(file)
}

/// Proof that the caller holds the guard; released on drop
#[derive(Debug)]
pub struct Lease {
    id: Uuid,
    _permit: OwnedSemaphorePermit,
    file: Option<File>,
}

impl Lease {
    fn new(id: Uuid, permit: OwnedSemaphorePermit, file: Option<File>) -> Self {
        debug!(lease = %id, "Lease acquired");
        Self {
            id,
            _permit: permit,
            file,
        }
    }

    /// Unique id of this lease, used as the process id nonce
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = file.unlock();
        }
        debug!(lease = %self.id, "Lease released");
    }
}
