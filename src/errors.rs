//! Error kinds surfaced at the CLI boundary.
//!
//! Every fallible path in the crate funnels into [`Error`]; `main` maps the
//! kind to a process exit code. Keeping the kinds coarse (not per-module)
//! lets callers branch on recovery policy instead of provenance.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed input (empty query, bad flag value). Exit 2.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A row-level miss that callers may want to distinguish. Exit 1.
    #[error("not found: {0}")]
    NotFound(String),

    /// Another process holds the store writer lock. Exit 3.
    #[error("store is locked by another wacli process{}", fmt_lock_info(.0))]
    LockHeld(Option<String>),

    /// A write or network operation was attempted before pairing. Exit 1.
    #[error("not authenticated (pair this device first, then retry)")]
    NotAuthenticated,

    /// Recoverable network trouble; retried only inside long-running loops.
    #[error("transient failure: {0}")]
    Transient(String),

    /// SQLite-level failure, including open/integrity errors.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Permanent failure reported by the protocol library.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn fmt_lock_info(info: &Option<String>) -> String {
    match info {
        Some(s) if !s.is_empty() => format!(" ({s})"),
        _ => String::new(),
    }
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True when a long-running loop may retry instead of propagating.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Process exit code for this kind (0 is success and never produced here).
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => 2,
            Self::LockHeld(_) => 3,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Maps the rusqlite row-miss into our typed miss so `store` getters can
/// return `NotFound` without every call site matching on the sqlite error.
pub(crate) fn row_or_not_found<T>(
    res: std::result::Result<T, rusqlite::Error>,
    what: &str,
) -> Result<T> {
    match res {
        Ok(v) => Ok(v),
        Err(rusqlite::Error::QueryReturnedNoRows) => Err(Error::not_found(what.to_string())),
        Err(e) => Err(e.into()),
    }
}
