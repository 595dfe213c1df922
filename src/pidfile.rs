//! PID file handling for the daemon.
//!
//! The PID file doubles as a single-instance guard: it is held under an
//! advisory exclusive lock for the daemon's lifetime, so a second daemon
//! fails fast instead of fighting over the firewall tag. The file is removed
//! on clean shutdown when the guard drops.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Guard holding the locked PID file. Dropping it unlocks and removes the
/// file.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    _file: File,
}

impl PidFile {
    /// Create (or take over) the PID file at `path` and write our pid into
    /// it. Fails when another live daemon holds the lock.
    ///
    /// Open with create+read+write rather than truncate so there is no
    /// window between creation and lock acquisition.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open pid file: {}", path.display()))?;

        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "another zapret daemon is already running (pid file locked: {})",
                path.display()
            )
        })?;

        file.set_len(0)?;
        // SAFETY: getpid() reads the calling process id; it cannot fail and
        // touches no shared state.
        let pid = unsafe { libc::getpid() };
        writeln!(file, "{pid}")
            .with_context(|| format!("failed to write pid file: {}", path.display()))?;
        file.flush()?;

        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove pid file");
        }
    }
}

/// Read a PID file left behind by a previous instance, if any.
pub fn read_pid<P: AsRef<Path>>(path: P) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
