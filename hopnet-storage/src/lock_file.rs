//! Data directory lock.
//!
//! At most one node may use a data directory. A `LOCK` file holding the
//! owner's pid is created on startup and removed on drop. A leftover
//! file whose pid is no longer alive (crash) is reclaimed.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StorageError;

const LOCK_FILE_NAME: &str = "LOCK";

/// Exclusive hold on a data directory for the lifetime of the value.
#[derive(Debug)]
pub struct DirectoryLock {
    path: PathBuf,
}

impl DirectoryLock {
    /// Acquire the lock for `data_dir`, creating the directory if needed.
    pub fn acquire(data_dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(LOCK_FILE_NAME);

        if let Some(holder) = read_holder(&path) {
            if process_alive(holder) {
                return Err(StorageError::Locked { path: data_dir.to_path_buf(), holder });
            }
            // Stale lock from a crashed run.
            tracing::warn!(pid = holder, "reclaiming stale data directory lock");
            fs::remove_file(&path)?;
        }

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(DirectoryLock { path })
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    // Without a portable liveness probe, assume the holder is alive;
    // operators can delete the LOCK file by hand after a crash.
    true
}
