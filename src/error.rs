//! The POSIX-like error taxonomy (spec §7).
//!
//! A read-only forensic dumper leans on `anyhow::Result` throughout
//! because it's a one-shot tool talking to a human. A filesystem
//! library needs its callers to match on *why* an operation failed, so
//! errors here are a closed `thiserror` enum instead.

use thiserror::Error;

/// Every fallible operation in this crate returns this `Result`.
pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument")]
    Inval,
    #[error("operation not supported by this build")]
    Notsup,
    #[error("device I/O error")]
    Io,
    #[error("corrupt metadata or data")]
    Corrupt,
    #[error("no such file or directory")]
    Noent,
    #[error("file or directory already exists")]
    Exist,
    #[error("not a directory")]
    Notdir,
    #[error("is a directory")]
    Isdir,
    #[error("directory not empty")]
    Notempty,
    #[error("file too large")]
    Fbig,
    #[error("no space left on device")]
    Nospc,
    #[error("out of memory")]
    Nomem,
    #[error("no such attribute")]
    Noattr,
    #[error("name too long")]
    Nametoolong,
    #[error("out of range")]
    Range,
}

impl Error {
    /// Mirrors the sign convention of spec §6: negative numbers are
    /// errors, zero is success, positive numbers carry a payload. Kept
    /// around for the CLI and for callers porting fixed reference vectors
    /// from the original C implementation.
    pub fn to_errno(self) -> i32 {
        match self {
            Error::Inval => -1,
            Error::Io => -5,
            Error::Corrupt => -84,
            Error::Noent => -2,
            Error::Exist => -17,
            Error::Notdir => -20,
            Error::Isdir => -21,
            Error::Notempty => -39,
            Error::Fbig => -27,
            Error::Nospc => -28,
            Error::Nomem => -12,
            Error::Noattr => -61,
            Error::Nametoolong => -36,
            Error::Range => -34,
            Error::Notsup => -95,
        }
    }
}
