//! Store directory discovery and runtime defaults.
//!
//! Resolution order for the store dir: `--store-dir` flag, `WACLI_STORE_DIR`,
//! then `~/.wacli`. Everything wacli persists lives under that one directory:
//! `wacli.db` (the mirror), `session.db` (protocol session state, opaque to
//! us), `media/` and the `LOCK` file.

use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_STORE_DIR: &str = "WACLI_STORE_DIR";

/// Default per-command deadline; `sync --follow` ignores it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// How long to wait for the socket to come up before calling it transient.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
/// `sync --once` exits after this much event silence.
pub const DEFAULT_IDLE_EXIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Config {
    store_dir: PathBuf,
    pub timeout: Duration,
}

impl Config {
    /// Resolve from an optional CLI override. Never touches the filesystem;
    /// directories are created lazily by the components that need them.
    pub fn resolve(store_dir_flag: Option<&str>, timeout_secs: Option<u64>) -> Self {
        let store_dir = store_dir_flag
            .map(PathBuf::from)
            .or_else(|| std::env::var(ENV_STORE_DIR).ok().map(PathBuf::from))
            .unwrap_or_else(default_store_dir);
        Self {
            store_dir,
            timeout: timeout_secs.map_or(DEFAULT_TIMEOUT, Duration::from_secs),
        }
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.store_dir.join("wacli.db")
    }

    pub fn session_db_path(&self) -> PathBuf {
        self.store_dir.join("session.db")
    }

    pub fn media_dir(&self) -> PathBuf {
        self.store_dir.join("media")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.store_dir.join("LOCK")
    }
}

pub fn default_store_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".wacli"),
        |dirs| dirs.home_dir().join(".wacli"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_overrides_everything() {
        let cfg = Config::resolve(Some("/tmp/custom-store"), None);
        assert_eq!(cfg.store_dir(), Path::new("/tmp/custom-store"));
        assert_eq!(cfg.db_path(), Path::new("/tmp/custom-store/wacli.db"));
        assert_eq!(cfg.lock_path(), Path::new("/tmp/custom-store/LOCK"));
    }

    #[test]
    fn derived_paths_live_under_store_dir() {
        let cfg = Config::resolve(Some("/srv/wa"), Some(5));
        assert_eq!(cfg.session_db_path(), Path::new("/srv/wa/session.db"));
        assert_eq!(cfg.media_dir(), Path::new("/srv/wa/media"));
        assert_eq!(cfg.timeout, Duration::from_secs(5));
    }

    #[test]
    fn default_timeout_when_unset() {
        let cfg = Config::resolve(Some("/tmp/x"), None);
        assert_eq!(cfg.timeout, DEFAULT_TIMEOUT);
    }
}
