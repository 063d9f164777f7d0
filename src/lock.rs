use std::fs;
use std::path::{Path, PathBuf};

use crate::log_warn;

/// A lock guard that releases the lock file on drop.
#[must_use = "lock is released when LockGuard is dropped"]
pub struct LockGuard {
    lock: fslock::LockFile,
    pid_path: PathBuf,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("pid_path", &self.pid_path)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            log_warn!("Warning: Failed to release the workdir lock: {}", e);
        }
        if let Err(e) = fs::remove_file(&self.pid_path) {
            log_warn!(
                "Warning: Failed to remove the PID file {}: {}",
                self.pid_path.display(),
                e
            );
        }
    }
}

/// Lock a main execution directory against a second scheduler.
///
/// Two schedulers polling the same store would double-submit every pending
/// chunk, so the lock is taken before any row is touched. The file lock is
/// the mutual exclusion; the PID file only exists for diagnostics when the
/// lock is contended.
pub fn acquire_workdir_lock(workdir: &Path) -> Result<LockGuard, String> {
    fs::create_dir_all(workdir)
        .map_err(|e| format!("Failed to create {}: {}", workdir.display(), e))?;

    let lock_path = workdir.join(".seqmill.lock");
    let pid_path = workdir.join(".seqmill.pid");

    let mut lock = fslock::LockFile::open(&lock_path)
        .map_err(|e| format!("Failed to open lock file {}: {}", lock_path.display(), e))?;

    let acquired = lock
        .try_lock()
        .map_err(|e| format!("Failed to acquire the workdir lock: {}", e))?;

    if !acquired {
        let holder = fs::read_to_string(&pid_path)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok());

        return match holder {
            Some(pid) if is_pid_alive(pid) => Err(format!(
                "Another scheduler is already driving this workdir (PID {})",
                pid
            )),
            Some(pid) => Err(format!(
                "The workdir lock is held but the recorded PID {} is not alive; \
                 remove {} and {} to recover",
                pid,
                lock_path.display(),
                pid_path.display()
            )),
            None => Err(format!(
                "Another scheduler holds the workdir lock; if this is stale, remove {}",
                lock_path.display()
            )),
        };
    }

    fs::write(&pid_path, std::process::id().to_string())
        .map_err(|e| format!("Failed to write the PID file: {}", e))?;

    Ok(LockGuard { lock, pid_path })
}

fn is_pid_alive(pid: i32) -> bool {
    // Signal 0 checks process existence without sending anything.
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}
