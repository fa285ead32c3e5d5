//! Process lock for the agent data directory
//!
//! sled refuses concurrent opens of the same store, and two agents draining
//! the same queues would double-deliver anyway. The lock file holds the PID of
//! the owning process; a lock left behind by a dead process is reclaimed.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Exclusive ownership of a data directory, released on drop.
#[derive(Debug)]
pub struct ProcessLock {
    lock_path: PathBuf,
    held: bool,
}

impl ProcessLock {
    pub const LOCK_FILE_NAME: &'static str = ".nav-uplink.lock";

    /// Take the lock in `data_dir`, creating the directory if needed.
    pub fn acquire<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let lock_path = data_dir.join(Self::LOCK_FILE_NAME);
        if lock_path.exists() {
            match read_holder(&lock_path) {
                Ok(pid) if pid != std::process::id() && holder_alive(pid) => {
                    bail!(
                        "another nav-uplink agent (PID {pid}) is using {}; \
                         stop it or remove {} if it is no longer running",
                        data_dir.display(),
                        lock_path.display()
                    );
                }
                Ok(pid) => {
                    info!(pid, path = %lock_path.display(), "Reclaiming stale process lock");
                }
                Err(e) => {
                    warn!(error = %e, path = %lock_path.display(), "Unreadable lock file, replacing");
                }
            }
            fs::remove_file(&lock_path)
                .with_context(|| format!("Failed to remove stale lock {}", lock_path.display()))?;
        }

        let pid = std::process::id();
        let mut file = fs::File::create(&lock_path)
            .with_context(|| format!("Failed to create lock file {}", lock_path.display()))?;
        writeln!(file, "{pid}").context("Failed to write PID to lock file")?;

        debug!(pid, path = %lock_path.display(), "Acquired process lock");
        Ok(Self { lock_path, held: true })
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Remove the lock file; also runs on drop.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        match fs::remove_file(&self.lock_path) {
            Ok(()) => debug!(path = %self.lock_path.display(), "Released process lock"),
            Err(e) => warn!(error = %e, path = %self.lock_path.display(), "Failed to remove lock file"),
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_holder(lock_path: &Path) -> Result<u32> {
    let contents = fs::read_to_string(lock_path).context("Failed to read lock file")?;
    contents
        .trim()
        .parse()
        .with_context(|| format!("Lock file does not contain a PID: {:?}", contents.trim()))
}

/// Whether `pid` is a live nav-uplink process.
#[cfg(target_os = "linux")]
fn holder_alive(pid: u32) -> bool {
    fs::read(format!("/proc/{pid}/cmdline"))
        .map(|cmdline| String::from_utf8_lossy(&cmdline).contains("nav-uplink"))
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn holder_alive(_pid: u32) -> bool {
    // No cheap liveness check; assume the holder is running.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_written_and_released() {
        let tmp = tempfile::tempdir().unwrap();
        let path;
        {
            let lock = ProcessLock::acquire(tmp.path().join("data")).unwrap();
            path = lock.path().to_path_buf();
            let pid: u32 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
            assert_eq!(pid, std::process::id());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(ProcessLock::LOCK_FILE_NAME), "999999999\n").unwrap();

        let lock = ProcessLock::acquire(tmp.path()).unwrap();
        assert!(lock.path().exists());
    }

    #[test]
    fn test_garbage_lock_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(ProcessLock::LOCK_FILE_NAME), "not a pid").unwrap();

        let lock = ProcessLock::acquire(tmp.path()).unwrap();
        let contents = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }
}
