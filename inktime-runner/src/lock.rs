// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{error, warn};
use serde::{Deserialize, Serialize};

const OWNER_FILE: &str = "owner.json";

/// Identity record written inside the lock marker, for `status` and `unlock`.
///
/// Best-effort: mutual exclusion is carried entirely by the marker directory,
/// not by this record.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LockOwner {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Result of a non-blocking acquisition attempt.
pub enum JobLock {
    /// The marker was created by this process; the guard owns its removal.
    Acquired(LockGuard),
    /// Another instance holds the marker. The benign-skip path.
    Held,
}

impl JobLock {
    /// Try to take the lock by atomically creating the marker directory.
    ///
    /// The filesystem's create-fail-if-exists semantics are the sole
    /// cross-instance synchronization primitive; an existence check followed
    /// by a create would race. Creation failures other than `AlreadyExists`
    /// (permissions, missing parent) are escalated rather than read as
    /// "already running".
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        match fs::create_dir(&path) {
            Ok(()) => {
                let guard = LockGuard::new(path);
                guard.write_owner();
                Ok(JobLock::Acquired(guard))
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(JobLock::Held),
            Err(err) => Err(err)
                .with_context(|| format!("unable to create lock marker: {}", path.display())),
        }
    }
}

/// Owning handle for an acquired lock marker.
///
/// Removal runs exactly once per acquisition, whichever path gets there
/// first: `Drop` on in-process returns, or the `atexit`-registered releaser
/// on signal-driven exits.
pub struct LockGuard {
    path: PathBuf,
    released: Arc<AtomicBool>,
}

impl LockGuard {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_owner(&self) {
        let owner = LockOwner {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };

        match serde_json::to_vec_pretty(&owner) {
            Ok(record) => {
                if let Err(err) = fs::write(self.path.join(OWNER_FILE), record) {
                    warn!("unable to write lock owner record: {}", err);
                }
            }
            Err(err) => warn!("unable to serialize lock owner record: {}", err),
        }
    }

    /// A cleanup suitable for `atexit::register`, sharing the released flag
    /// with this guard.
    pub fn releaser(&self) -> impl FnMut() + Send + 'static {
        let path = self.path.clone();
        let released = self.released.clone();
        move || release_marker(&path, &released)
    }

    pub fn release(&self) {
        release_marker(&self.path, &self.released);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn release_marker(path: &Path, released: &AtomicBool) {
    if released.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Err(err) = fs::remove_dir_all(path) {
        if err.kind() != ErrorKind::NotFound {
            error!("unable to remove lock marker {}: {}", path.display(), err);
        }
    }
}

/// Read-only view of the marker for the `status` and `unlock` commands.
#[derive(Debug)]
pub enum LockStatus {
    Free,
    Held {
        owner: Option<LockOwner>,
        /// `None` when liveness cannot be determined (no owner record, or an
        /// unsupported platform).
        alive: Option<bool>,
    },
}

impl LockStatus {
    pub fn probe(path: &Path) -> Result<Self> {
        match fs::metadata(path) {
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(LockStatus::Free),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("unable to read lock marker: {}", path.display()))
            }
            Ok(_) => {}
        }

        let owner = read_owner(path);
        let alive = owner.as_ref().and_then(|owner| process_alive(owner.pid));

        Ok(LockStatus::Held { owner, alive })
    }
}

fn read_owner(path: &Path) -> Option<LockOwner> {
    let record = fs::read(path.join(OWNER_FILE)).ok()?;
    match serde_json::from_slice(&record) {
        Ok(owner) => Some(owner),
        Err(err) => {
            warn!("malformed lock owner record: {}", err);
            None
        }
    }
}

#[cfg(target_family = "unix")]
fn process_alive(pid: u32) -> Option<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Signal 0 probes for existence without delivering anything.
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => Some(true),
        Err(Errno::ESRCH) => Some(false),
        Err(Errno::EPERM) => Some(true),
        Err(_) => None,
    }
}

#[cfg(not(target_family = "unix"))]
fn process_alive(_pid: u32) -> Option<bool> {
    None
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn lock_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("render.lock")
    }

    #[test]
    fn test_acquire_creates_marker_and_owner_record() {
        let dir = tempdir().unwrap();
        let path = lock_path(&dir);

        let lock = JobLock::acquire(&path).unwrap();
        let guard = match lock {
            JobLock::Acquired(guard) => guard,
            JobLock::Held => panic!("uncontended acquire reported as held"),
        };

        assert!(path.is_dir());

        let owner = read_owner(guard.path()).unwrap();
        assert_eq!(std::process::id(), owner.pid);
    }

    #[test]
    fn test_second_acquire_observes_held() {
        let dir = tempdir().unwrap();
        let path = lock_path(&dir);

        let _first = JobLock::acquire(&path).unwrap();
        let second = JobLock::acquire(&path).unwrap();

        assert!(matches!(second, JobLock::Held));
        // The loser must not have disturbed the winner's marker.
        assert!(path.is_dir());
    }

    #[test]
    fn test_drop_releases_marker() {
        let dir = tempdir().unwrap();
        let path = lock_path(&dir);

        match JobLock::acquire(&path).unwrap() {
            JobLock::Acquired(guard) => drop(guard),
            JobLock::Held => panic!("uncontended acquire reported as held"),
        }

        assert!(!path.exists());
    }

    #[test]
    fn test_release_is_exactly_once() {
        let dir = tempdir().unwrap();
        let path = lock_path(&dir);

        let guard = match JobLock::acquire(&path).unwrap() {
            JobLock::Acquired(guard) => guard,
            JobLock::Held => panic!("uncontended acquire reported as held"),
        };
        let mut releaser = guard.releaser();

        guard.release();
        assert!(!path.exists());

        // A marker recreated by a later instance must survive both the stale
        // releaser and the guard's drop.
        fs::create_dir(&path).unwrap();
        releaser();
        drop(guard);
        assert!(path.is_dir());
    }

    #[test]
    fn test_acquire_escalates_other_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing-parent").join("render.lock");

        let result = JobLock::acquire(&path);
        assert!(result.is_err());
    }

    #[test]
    fn test_probe_free() {
        let dir = tempdir().unwrap();

        let status = LockStatus::probe(&lock_path(&dir)).unwrap();
        assert!(matches!(status, LockStatus::Free));
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn test_probe_held_by_live_owner() {
        let dir = tempdir().unwrap();
        let path = lock_path(&dir);

        let _guard = match JobLock::acquire(&path).unwrap() {
            JobLock::Acquired(guard) => guard,
            JobLock::Held => panic!("uncontended acquire reported as held"),
        };

        match LockStatus::probe(&path).unwrap() {
            LockStatus::Held { owner, alive } => {
                assert_eq!(std::process::id(), owner.unwrap().pid);
                assert_eq!(Some(true), alive);
            }
            LockStatus::Free => panic!("held marker reported as free"),
        }
    }

    #[test]
    fn test_probe_held_without_owner_record() {
        let dir = tempdir().unwrap();
        let path = lock_path(&dir);

        // A marker left by a crashed holder that never wrote its record.
        fs::create_dir(&path).unwrap();

        match LockStatus::probe(&path).unwrap() {
            LockStatus::Held { owner, alive } => {
                assert!(owner.is_none());
                assert!(alive.is_none());
            }
            LockStatus::Free => panic!("held marker reported as free"),
        }
    }
}
