//! A key/value map in a memory-mapped file, shared by independent processes.
//!
//! Every process that opens the same path maps the same file and reads values straight out of
//! it, without copying them through a server. Keys are strings, values are strings or numbers.
//!
//! ```no_run
//! use shm_map::{Mode, Options, Session};
//!
//! let mut map = Session::create("/tmp/example.map", Mode::ReadWrite, Options::default())?;
//! map.set("answer", 42)?;
//! map.set("question", "unknown")?;
//! assert_eq!(map.get("answer")?.map(|v| v.as_number()).transpose()?, Some(42.0));
//! map.close()?;
//! # Ok::<_, shm_map::Error>(())
//! ```
//!
//! The file grows on demand up to a maximum size. Coordination between processes happens through
//! a separate shared memory object named after the file's path, see the `shm-lock` crate: the key
//! space is split into shards with one lock each, a global lock orders operations that span all
//! shards, and a write-exclusivity lock lets a [`Mode::WriteOnly`] session be the only one with
//! the file mapped.
mod alloc;
mod arena;
mod cell;
mod config;
mod error;
mod grow;
mod session;
mod table;

pub use cell::{CellKind, CellRef, Value};
pub use config::{
    Mode, Options, ParseModeError, DEFAULT_BUCKET_COUNT, DEFAULT_INITIAL_SIZE,
    DEFAULT_LOCK_TIMEOUT, DEFAULT_MAX_SIZE, MINIMUM_SIZE,
};
pub use error::{Error, ErrorKind, Result};
pub use session::{remove_lock_block, Session};
pub use shm_lock::SHARD_COUNT;
pub use table::shard_of;

#[cfg(test)]
mod tests;
