use std::path::{Path, PathBuf};

use shm_lock::LockError;

use crate::cell::CellKind;
use crate::config::Mode;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// The broad class of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller passed something that can not be stored.
    Validation,
    /// The operation is not allowed in the session's mode or state.
    Mode,
    /// The arena file does not hold what it claims to hold.
    Corruption,
    /// The arena would have to grow beyond its maximum size.
    Capacity,
    /// A lock could not be taken, or its state is unusable.
    Concurrency,
    /// The backing file or the lock block could not be created, opened or resized.
    Io,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("value is a {found}, not a {expected}")]
    TypeMismatch { expected: CellKind, found: CellKind },
    #[error("invalid key: {0}")]
    InvalidKey(&'static str),
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
    #[error("session is read-only")]
    ReadOnly,
    #[error("mode `{0}` can not be used for this")]
    InvalidMode(Mode),
    #[error("session is closed")]
    Closed,
    #[error("session was already closed")]
    AlreadyClosed,
    #[error("session is not inside an exclusive section")]
    NotLocked,
    #[error("{} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("arena would need {requested} bytes, its maximum is {max}")]
    Capacity { requested: u64, max: u64 },
    #[error("{} is held exclusively by another session", path.display())]
    Busy { path: PathBuf },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("{} {reason}", path.display())]
    InvalidFile { path: PathBuf, reason: String },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TypeMismatch { .. } | Error::InvalidKey(_) | Error::InvalidValue(_) => {
                ErrorKind::Validation
            }
            Error::ReadOnly
            | Error::InvalidMode(_)
            | Error::Closed
            | Error::AlreadyClosed
            | Error::NotLocked => ErrorKind::Mode,
            Error::Corrupt { .. } => ErrorKind::Corruption,
            Error::Capacity { .. } => ErrorKind::Capacity,
            Error::Busy { .. } | Error::Lock(LockError::Layout { .. }) => ErrorKind::Concurrency,
            Error::Lock(LockError::Os { .. }) | Error::InvalidFile { .. } | Error::Io { .. } => {
                ErrorKind::Io
            }
        }
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Error::Io {
            path: path.to_owned(),
            source,
        }
    }

    pub(crate) fn invalid_file(path: &Path, reason: impl Into<String>) -> Self {
        Error::InvalidFile {
            path: path.to_owned(),
            reason: reason.into(),
        }
    }
}

#[test]
fn kinds_follow_the_taxonomy() {
    let mismatch = Error::TypeMismatch {
        expected: CellKind::Number,
        found: CellKind::String,
    };
    assert_eq!(mismatch.kind(), ErrorKind::Validation);
    assert_eq!(mismatch.to_string(), "value is a string, not a number");

    assert_eq!(Error::AlreadyClosed.kind(), ErrorKind::Mode);
    assert_eq!(Error::InvalidMode(Mode::ReadOnly).kind(), ErrorKind::Mode);
    assert_eq!(
        Error::Busy {
            path: PathBuf::from("/tmp/x")
        }
        .kind(),
        ErrorKind::Concurrency
    );
    assert_eq!(
        Error::io(Path::new("/tmp/x"), std::io::ErrorKind::NotFound.into()).kind(),
        ErrorKind::Io
    );
}

#[test]
fn lock_block_failures_are_classified() {
    let denied = Error::from(LockError::Os {
        op: "open",
        name: "/shm-map._tmp_x".to_owned(),
        source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
    });
    assert_eq!(denied.kind(), ErrorKind::Io);

    let foreign = Error::from(LockError::Layout {
        name: "/shm-map._tmp_x".to_owned(),
        found: 7,
        expected: 1,
    });
    assert_eq!(foreign.kind(), ErrorKind::Concurrency);
}
