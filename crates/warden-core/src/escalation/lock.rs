//! Host-wide single-instance lock for the escalation listener.
//!
//! The lock is an exclusive, non-blocking `flock` on `<state_dir>/listener.lock`.
//! The holder writes its pid and start time into the file so that other
//! processes can tell who holds it, and whether a leftover file belongs to a
//! listener that is gone.
//!
//! The file is never unlinked: removing it while another process has it open
//! would let two listeners lock two different inodes. On release the content
//! is truncated instead.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::{EscalationError, EscalationResult};
use super::lock_path;

/// Owner information embedded in the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerLockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// What [`inspect_lock`] found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LockStatus {
    /// No owner recorded and nobody holds the lock.
    Free,
    /// A live listener holds the lock.
    Held { info: ListenerLockInfo },
    /// Owner info is present but the lock is not held: the listener exited
    /// without cleaning up. Safe to start a new one.
    Stale {
        info: ListenerLockInfo,
        owner_alive: bool,
    },
}

/// An acquired listener lock. Released on drop.
pub struct ListenerLock {
    lock: Flock<File>,
    path: PathBuf,
    info: ListenerLockInfo,
}

impl ListenerLock {
    /// Acquire the lock without blocking.
    ///
    /// # Errors
    ///
    /// `EscalationError::ListenerActive` if another process holds it.
    pub fn acquire(state_dir: &Path) -> EscalationResult<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = lock_path(state_dir);
        let file = open_lock_file(&path)?;

        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => {
                let pid = read_info(&path).map(|info| info.pid).unwrap_or(0);
                return Err(EscalationError::ListenerActive { pid });
            }
            Err((_, errno)) => return Err(EscalationError::Lock(errno.to_string())),
        };

        let info = ListenerLockInfo {
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        let json = serde_json::to_vec(&info)?;
        lock.set_len(0)?;
        let mut writer: &File = &lock;
        writer.write_all(&json)?;
        writer.sync_all()?;

        info!(path = %path.display(), pid = info.pid, "escalation listener lock acquired");
        Ok(Self { lock, path, info })
    }

    pub fn info(&self) -> &ListenerLockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for ListenerLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerLock")
            .field("path", &self.path)
            .field("info", &self.info)
            .finish()
    }
}

impl Drop for ListenerLock {
    fn drop(&mut self) {
        // Truncate while still holding the lock; the flock itself is
        // released when `self.lock` drops.
        if let Err(e) = self.lock.set_len(0) {
            debug!(path = %self.path.display(), error = %e, "failed to clear listener lock file");
        }
    }
}

/// Report the state of the listener lock without disturbing a live holder.
pub fn inspect_lock(state_dir: &Path) -> EscalationResult<LockStatus> {
    let path = lock_path(state_dir);
    if !path.exists() {
        return Ok(LockStatus::Free);
    }
    let info = read_info(&path);
    let file = open_lock_file(&path)?;

    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(check) => {
            drop(check);
            Ok(match info {
                None => LockStatus::Free,
                Some(info) => {
                    let owner_alive = pid_alive(info.pid);
                    LockStatus::Stale { info, owner_alive }
                }
            })
        }
        Err((_, Errno::EWOULDBLOCK)) => {
            // Held, but the holder may not have written its info yet.
            let info = info.unwrap_or(ListenerLockInfo {
                pid: 0,
                started_at: Utc::now(),
            });
            Ok(LockStatus::Held { info })
        }
        Err((_, errno)) => Err(EscalationError::Lock(errno.to_string())),
    }
}

/// Whether a process with `pid` exists (signal 0 check).
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but belongs to another user.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn read_info(path: &Path) -> Option<ListenerLockInfo> {
    let data = std::fs::read_to_string(path).ok()?;
    if data.trim().is_empty() {
        return None;
    }
    serde_json::from_str(&data).ok()
}
