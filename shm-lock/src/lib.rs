//! Cross-process locks for a memory-mapped arena.
//!
//! The locks for one arena live in a *lock block*, a named shared memory object separate from the
//! arena file. Its name is derived from the arena's path so that independently started processes
//! find the same block. It holds:
//!
//! - one global lock, taken shared by every single-key operation and exclusively by whole-table
//!   operations, arena growth and explicit exclusive sections;
//! - one lock per shard;
//! - one write-exclusivity lock, held shared by every open session and exclusively by a session
//!   that must be the only one with the arena mapped.
//!
//! All of these are plain words that are unlocked when zero. There are no destructors to run: a
//! block can be reset at any time, and it is, when a prior holder appears to have crashed.
mod backoff;
mod block;
pub mod op;
mod rwlock;

pub use backoff::Backoff;
pub use block::{block_name, remove, LockBlock, SHARD_COUNT};
pub use op::{Shm, ShmError, ShmVTable, Stat};
pub use rwlock::{ExclusiveGuard, PidLock, RawRwLock, SharedGuard};

use std::ffi::CStr;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// A system call on the shared memory object failed.
    #[error("failed to {op} lock block {name}: {source}")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        source: std::io::Error,
    },
    /// The object exists but was not laid out by this version.
    #[error("lock block {name} is incompatible: found {found}, expected {expected}")]
    Layout {
        name: String,
        found: u64,
        expected: u64,
    },
}

impl LockError {
    pub(crate) fn os(op: &'static str, name: &CStr, source: std::io::Error) -> Self {
        LockError::Os {
            op,
            name: name.to_string_lossy().into_owned(),
            source,
        }
    }
}
