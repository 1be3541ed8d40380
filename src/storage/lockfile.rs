//! Status File Lock
//!
//! The orchestrator's consistency model assumes one OS process owns the
//! status document. `StoreLock` writes `<status_file>.lock` holding our PID
//! and refuses to start if a live orchestrator already holds it.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::status_store::StoreError;

/// Exclusive ownership of a status file for the lifetime of the process.
#[derive(Debug)]
pub struct StoreLock {
    lock_path: PathBuf,
    owned: bool,
}

impl StoreLock {
    /// Marker looked for in `/proc/<pid>/cmdline` of the lock holder
    const PROCESS_MARKER: &'static str = "bundle-orchestrator";

    /// Acquire the lock for `status_path`.
    ///
    /// A lock left behind by a process that is no longer running is replaced.
    pub fn acquire<P: AsRef<Path>>(status_path: P) -> Result<Self, StoreError> {
        let status_path = status_path.as_ref();
        if let Some(parent) = status_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let mut lock_name = status_path.as_os_str().to_owned();
        lock_name.push(".lock");
        let lock_path = PathBuf::from(lock_name);

        if lock_path.exists() {
            match Self::holder_pid(&lock_path) {
                Some(pid) if pid != std::process::id() && Self::is_process_running(pid) => {
                    return Err(StoreError::Locked {
                        path: status_path.to_path_buf(),
                        pid,
                    });
                }
                holder => {
                    tracing::info!(pid = ?holder, path = %lock_path.display(), "Removing stale status lock");
                    fs::remove_file(&lock_path).map_err(|e| StoreError::io(&lock_path, e))?;
                }
            }
        }

        let pid = std::process::id();
        let mut file = File::create(&lock_path).map_err(|e| StoreError::io(&lock_path, e))?;
        writeln!(file, "{pid}").map_err(|e| StoreError::io(&lock_path, e))?;

        tracing::debug!(pid = pid, path = %lock_path.display(), "Acquired status lock");

        Ok(Self {
            lock_path,
            owned: true,
        })
    }

    /// PID recorded in an existing lock file, if it can be read.
    fn holder_pid(lock_path: &Path) -> Option<u32> {
        fs::read_to_string(lock_path).ok()?.trim().parse().ok()
    }

    #[cfg(unix)]
    fn is_process_running(pid: u32) -> bool {
        fs::read(format!("/proc/{pid}/cmdline"))
            .map(|cmdline| String::from_utf8_lossy(&cmdline).contains(Self::PROCESS_MARKER))
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    fn is_process_running(_pid: u32) -> bool {
        // Without /proc we cannot tell; assume the holder is alive.
        true
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Release the lock (called automatically on drop)
    pub fn release(&mut self) {
        if self.owned {
            if let Err(e) = fs::remove_file(&self.lock_path) {
                tracing::warn!(error = %e, "Failed to remove status lock");
            } else {
                tracing::debug!(path = %self.lock_path.display(), "Released status lock");
            }
            self.owned = false;
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_writes_pid() {
        let temp_dir = tempdir().unwrap();
        let lock = StoreLock::acquire(temp_dir.path().join("folderStatus.json")).unwrap();

        assert_eq!(lock.path(), temp_dir.path().join("folderStatus.json.lock"));
        let contents = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let temp_dir = tempdir().unwrap();
        let lock_path;

        {
            let lock = StoreLock::acquire(temp_dir.path().join("folderStatus.json")).unwrap();
            lock_path = lock.path().to_path_buf();
            assert!(lock_path.exists());
        }

        assert!(!lock_path.exists());
    }

    #[test]
    fn test_stale_lock_replaced() {
        let temp_dir = tempdir().unwrap();
        let lock_path = temp_dir.path().join("folderStatus.json.lock");
        fs::write(&lock_path, "999999999\n").unwrap();

        let lock = StoreLock::acquire(temp_dir.path().join("folderStatus.json")).unwrap();
        let contents = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    fn test_garbage_lock_replaced() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("folderStatus.json.lock"), "not a pid").unwrap();

        assert!(StoreLock::acquire(temp_dir.path().join("folderStatus.json")).is_ok());
    }
}
