//! Exclusive writer lock over the store directory.
//!
//! A single `LOCK` file guarded by a non-blocking `flock(2)`. The OS drops
//! the lock when the holding process exits, crashed or not, so stale-lockfile
//! races cannot happen. The file body is a human-readable owner hint
//! (pid, command, acquired-at) that `doctor` surfaces; the flock itself is
//! the source of truth, never the body.

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::errors::{Error, Result};

pub const LOCK_FILE: &str = "LOCK";

/// Held writer lock. Dropping it releases the flock; [`StoreLock::release`]
/// does the same explicitly and is idempotent.
pub struct StoreLock {
    file: Option<File>,
    path: PathBuf,
}

impl StoreLock {
    /// Acquire the exclusive store lock, or fail with [`Error::LockHeld`]
    /// carrying the current owner's hint.
    pub fn acquire(store_dir: &Path) -> Result<Self> {
        fs::create_dir_all(store_dir)?;
        let path = store_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if !try_flock_exclusive(&file)? {
            return Err(Error::LockHeld(read_owner_hint(&path)));
        }

        // We own the lock now; replace whatever hint a previous owner left.
        let hint = owner_hint();
        file.set_len(0)?;
        write_hint(&file, &hint)?;

        Ok(Self {
            file: Some(file),
            path,
        })
    }

    /// Probe whether someone currently holds the lock, without keeping it.
    pub fn is_held(store_dir: &Path) -> bool {
        match Self::acquire(store_dir) {
            Ok(lk) => {
                let _ = lk.release();
                false
            }
            Err(Error::LockHeld(_)) => true,
            Err(_) => false,
        }
    }

    /// Owner hint of the current holder, if any was recorded.
    pub fn owner_hint(store_dir: &Path) -> Option<String> {
        read_owner_hint(&store_dir.join(LOCK_FILE))
    }

    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            // Closing the fd drops the flock; clear the hint so doctor does
            // not report a stale owner after a clean release.
            let _ = file.set_len(0);
            drop(file);
            tracing::debug!(path = %self.path.display(), "released store lock");
        }
        Ok(())
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.release_inner();
    }
}

fn owner_hint() -> String {
    let cmd: Vec<String> = std::env::args().collect();
    format!(
        "pid={} cmd={} acquired_at={}",
        std::process::id(),
        cmd.join(" "),
        chrono::Utc::now().to_rfc3339(),
    )
}

fn write_hint(mut file: &File, hint: &str) -> Result<()> {
    file.write_all(hint.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()?;
    Ok(())
}

fn read_owner_hint(path: &Path) -> Option<String> {
    let body = fs::read_to_string(path).ok()?;
    let trimmed = body.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err.into())
}

#[cfg(not(unix))]
fn try_flock_exclusive(_file: &File) -> Result<bool> {
    // Windows ports would use LockFileEx here; nothing in the store layer
    // depends on more than "exclusive or fail".
    Ok(true)
}
