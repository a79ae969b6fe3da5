//! PID-file lock guarding a plan directory against concurrent runs.
//!
//! The lock is a file containing the holder's PID. It is hard-linked into
//! place from a fully written temp file, so creation is atomic and a reader
//! never sees it empty. A file whose PID is not a live process is stale and
//! may be reclaimed by anyone.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::error::LockError;

/// Distinguishes temp files of concurrent acquires within one process.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Cross-process lock for a single plan.
#[derive(Debug, Clone)]
pub struct PlanLock {
    path: PathBuf,
}

impl PlanLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock or fail immediately; never waits.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn acquire(&self) -> Result<()> {
        self.acquire_with(|| {})
    }

    /// `acquire` with a callback between stale-lock removal and the retry.
    fn acquire_with(&self, before_retry: impl FnOnce()) -> Result<()> {
        if self.try_create()? {
            debug!("lock acquired");
            return Ok(());
        }

        if let Some(pid) = self.live_holder()? {
            return Err(LockError::Held { pid }.into());
        }

        info!("reclaiming stale lock");
        self.remove_file()?;
        before_retry();

        // One retry only: a second collision means someone else won the race.
        if self.try_create()? {
            debug!("lock acquired after reclaim");
            return Ok(());
        }
        Err(LockError::Raced {
            path: self.path.clone(),
        }
        .into())
    }

    /// Remove the lock file. Absence is not an error.
    pub fn release(&self) -> Result<()> {
        debug!(path = %self.path.display(), "releasing lock");
        self.remove_file()
    }

    /// True if a live process currently holds the lock.
    pub fn is_locked(&self) -> Result<bool> {
        Ok(self.live_holder()?.is_some())
    }

    /// PID of the live holder, if any. Stale or unreadable records yield `None`.
    pub fn live_holder(&self) -> Result<Option<u32>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read lock {}", self.path.display()));
            }
        };
        let Ok(pid) = contents.trim().parse::<u32>() else {
            warn!(contents = %contents.trim(), "lock file holds an invalid pid");
            return Ok(None);
        };
        if process_alive(pid) {
            Ok(Some(pid))
        } else {
            debug!(pid, "lock holder is not running");
            Ok(None)
        }
    }

    /// Acquire and wrap the lock in a guard that releases it on drop.
    pub fn lock(self) -> Result<LockGuard> {
        self.acquire()?;
        Ok(LockGuard { lock: self })
    }

    /// Create the lock file with our PID already in it.
    ///
    /// The PID goes to a private temp file first and is hard-linked into
    /// place, so the lock never exists empty.
    fn try_create(&self) -> Result<bool> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
        let pid = std::process::id();
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(format!(".{pid}.{seq}.tmp"));
        let tmp_path = PathBuf::from(tmp_name);
        fs::write(&tmp_path, format!("{pid}\n"))
            .with_context(|| format!("write lock {}", tmp_path.display()))?;

        let linked = fs::hard_link(&tmp_path, &self.path);
        if let Err(err) = fs::remove_file(&tmp_path) {
            warn!(err = %err, path = %tmp_path.display(), "failed to remove temp lock file");
        }
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err).with_context(|| format!("create lock {}", self.path.display())),
        }
    }

    fn remove_file(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove lock {}", self.path.display())),
        }
    }
}

/// Holds a [`PlanLock`] until dropped.
#[derive(Debug)]
pub struct LockGuard {
    lock: PlanLock,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        self.lock.path()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release() {
            warn!(err = %err, "failed to release plan lock");
        }
    }
}

/// Our own PID always counts as alive.
fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    pid_is_alive(pid)
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // 0 and negative values address process groups, never a single owner.
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but owned by another user.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_is_alive(pid: u32) -> bool {
    // No portable zero-signal check here; assume any recorded owner is alive.
    pid != 0
}
