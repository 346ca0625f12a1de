//! Single-instance host lock
//!
//! The player owns its cache and credential directories exclusively, so a
//! second process on the same host must exit immediately. The lock is an
//! advisory exclusive `flock` on `{dataDir}/player.lock`, held for the
//! process lifetime and released by the OS even on a crash.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use fs2::FileExt;
use tracing::debug;

use hexmon_common::{Error, Result};

/// Held advisory lock; released on drop (or process exit)
pub struct SingleInstanceLock {
    file: File,
}

impl SingleInstanceLock {
    /// Acquire the host lock, failing fast when another instance holds it
    pub fn acquire(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("player.lock");
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|_| {
            Error::InvalidState(format!(
                "another player instance holds {}",
                path.display()
            ))
        })?;

        // Best effort: record the holder PID for operators
        let _ = writeln!(file, "{}", std::process::id());
        debug!("Acquired single-instance lock at {}", path.display());

        Ok(Self { file })
    }
}

impl Drop for SingleInstanceLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
