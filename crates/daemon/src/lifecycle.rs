//! Daemon lifecycle: single-instance lock and run state.
//!
//! The lock file carries its owner's pid and instance id. It is written to a
//! private temp file first and hard-linked into place, so it never exists
//! without its contents. A lock whose owner process no longer exists is
//! stale and is replaced. The file is removed when the owning [`DaemonLock`]
//! drops.

use crate::jobs::current_timestamp_ms;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Run state served by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        }
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("daemon already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("lock file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock file {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub instance_id: String,
    pub started_at: i64,
    pub status_addr: String,
}

/// Whether a process with `pid` currently exists.
pub fn process_alive(pid: u32) -> bool {
    use sysinfo::{Pid, System};

    let sys = System::new_all();
    sys.process(Pid::from_u32(pid)).is_some()
}

/// Read the lock file, if present.
pub fn read_lock(path: &Path) -> Result<Option<LockOwner>, LifecycleError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| LifecycleError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Exclusive ownership of the lock file.
#[derive(Debug)]
pub struct DaemonLock {
    path: PathBuf,
    owner: LockOwner,
}

impl DaemonLock {
    /// Take the lock for this process.
    ///
    /// A lock held by a live process is `AlreadyRunning`. A stale or
    /// unreadable lock file is removed and acquisition retried once.
    pub fn acquire(path: &Path, status_addr: &str) -> Result<Self, LifecycleError> {
        let owner = LockOwner {
            pid: std::process::id(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            started_at: current_timestamp_ms(),
            status_addr: status_addr.to_string(),
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        for attempt in 0..2 {
            match Self::create_exclusive(path, &owner) {
                Ok(()) => {
                    info!(lock = %path.display(), pid = owner.pid, instance_id = %owner.instance_id, "Acquired daemon lock");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        owner,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt == 0 => {
                    match read_lock(path) {
                        Ok(Some(existing)) if process_alive(existing.pid) => {
                            return Err(LifecycleError::AlreadyRunning { pid: existing.pid });
                        }
                        Ok(Some(existing)) => {
                            warn!(lock = %path.display(), pid = existing.pid, "Removing stale daemon lock");
                            // Another starter may have replaced it meanwhile
                            if read_lock(path).ok().flatten().as_ref() != Some(&existing) {
                                continue;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(lock = %path.display(), error = %e, "Removing unreadable daemon lock");
                        }
                    }
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let pid = read_lock(path)?.map(|o| o.pid).unwrap_or(0);
                    return Err(LifecycleError::AlreadyRunning { pid });
                }
                Err(e) => return Err(e.into()),
            }
        }
        // Second attempt either returned or errored above
        Err(LifecycleError::AlreadyRunning { pid: 0 })
    }

    /// Publish `owner` at `path` only if nothing is there yet.
    fn create_exclusive(path: &Path, owner: &LockOwner) -> std::io::Result<()> {
        let mut name = path.file_name().map(OsString::from).unwrap_or_default();
        name.push(format!(".{}.tmp", owner.instance_id));
        let staging = path.with_file_name(name);

        let written = Self::write_staging(&staging, owner);
        let linked = written.and_then(|()| fs::hard_link(&staging, path));
        if let Err(e) = fs::remove_file(&staging) {
            if e.kind() != ErrorKind::NotFound {
                debug!(file = %staging.display(), error = %e, "Failed to remove lock staging file");
            }
        }
        linked
    }

    fn write_staging(staging: &Path, owner: &LockOwner) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(staging)?;
        let body = serde_json::to_string(owner).map_err(std::io::Error::other)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        // Never remove a lock some other instance took over
        match read_lock(&self.path) {
            Ok(Some(current)) if current.instance_id == self.owner.instance_id => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(lock = %self.path.display(), error = %e, "Failed to remove daemon lock");
                } else {
                    debug!(lock = %self.path.display(), "Released daemon lock");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_owner_and_release_removes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join("daemon.lock");
        {
            let lock = DaemonLock::acquire(&path, "127.0.0.1:7878").unwrap();
            let stored = read_lock(&path).unwrap().unwrap();
            assert_eq!(&stored, lock.owner());
            assert_eq!(stored.pid, std::process::id());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_live_owner_blocks_second_acquire() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.lock");
        let _held = DaemonLock::acquire(&path, "127.0.0.1:7878").unwrap();
        match DaemonLock::acquire(&path, "127.0.0.1:7878") {
            Err(LifecycleError::AlreadyRunning { pid }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_lock_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.lock");
        let stale = LockOwner {
            pid: u32::MAX - 1,
            instance_id: "old".to_string(),
            started_at: 0,
            status_addr: "127.0.0.1:1".to_string(),
        };
        fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let lock = DaemonLock::acquire(&path, "127.0.0.1:7878").unwrap();
        assert_ne!(lock.owner().instance_id, "old");
    }

    #[test]
    fn test_garbage_lock_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.lock");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(read_lock(&path), Err(LifecycleError::Corrupt { .. })));
        assert!(DaemonLock::acquire(&path, "127.0.0.1:7878").is_ok());
    }

    #[test]
    fn test_drop_keeps_foreign_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.lock");
        let lock = DaemonLock::acquire(&path, "a").unwrap();
        let mut other = lock.owner().clone();
        other.instance_id = "someone-else".to_string();
        fs::write(&path, serde_json::to_string(&other).unwrap()).unwrap();
        drop(lock);
        assert!(path.exists());
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        use std::sync::{Arc, Barrier};

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.lock");
        let starters = 12;
        let barrier = Arc::new(Barrier::new(starters));
        let handles: Vec<_> = (0..starters)
            .map(|_| {
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    DaemonLock::acquire(&path, "127.0.0.1:7878")
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<&DaemonLock> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        for result in &results {
            if let Err(e) = result {
                assert!(
                    matches!(e, LifecycleError::AlreadyRunning { pid } if *pid == std::process::id()),
                    "unexpected error: {:?}",
                    e
                );
            }
        }
        assert_eq!(&read_lock(&path).unwrap().unwrap(), winners[0].owner());

        // Only the lock itself is left behind
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![OsString::from("daemon.lock")]);
    }

    #[test]
    fn test_lifecycle_state_strings() {
        assert_eq!(LifecycleState::default(), LifecycleState::Stopped);
        assert_eq!(LifecycleState::Stopping.to_string(), "stopping");
        assert_eq!(
            serde_json::to_string(&LifecycleState::Running).unwrap(),
            "\"running\""
        );
    }
}
