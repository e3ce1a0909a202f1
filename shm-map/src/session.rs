//! Sessions: one caller's open handle on an arena and the lock block of its path.
use core::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use shm_lock::{LockBlock, Shm};

use crate::alloc::Failure;
use crate::arena::Arena;
use crate::cell::{CellRef, Value};
use crate::config::{Mode, Options};
use crate::error::{Error, Result};
use crate::grow;
use crate::table::{self, ShardTable};

/// An open key/value map, shared with every other session of the same path.
///
/// Each operation takes the locks it needs for its own duration, in the order shard lock then
/// global lock. Between [`Session::lock`] and [`Session::unlock`] the session holds the global
/// lock exclusively and operations take no locks of their own.
///
/// A session is driven by one thread at a time. Several sessions, in one or many processes, may
/// be open on the same path.
pub struct Session {
    path: PathBuf,
    mode: Mode,
    options: Options,
    state: Option<Open>,
    in_global_lock: bool,
}

struct Open {
    arena: Arena,
    locks: LockBlock,
    table: ShardTable,
    pid: u32,
}

impl Session {
    /// Open the arena at `path` for writing, creating it if it does not exist.
    pub fn create(path: impl AsRef<Path>, mode: Mode, options: Options) -> Result<Self> {
        if !mode.is_writable() {
            return Err(Error::InvalidMode(mode));
        }

        Self::open(path, mode, options)
    }

    /// Open the arena at `path`.
    ///
    /// Read-only sessions require an existing arena. Writable sessions create one as needed, with
    /// the sizes in `options`; for an existing arena only its maximum size is taken from there.
    ///
    /// Fails with [`Error::Busy`] if a write-only session of the path is open, or if this is a
    /// write-only session and any other session is.
    pub fn open(path: impl AsRef<Path>, mode: Mode, options: Options) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let options = options.normalized();

        if mode == Mode::ReadOnly {
            crate::arena::validate_file(&path)?;
        }

        let shm = Shm::new();
        let locks = LockBlock::reify(&shm, &lock_path(&path)?, options.lock_timeout)?;
        let pid = shm.pid();

        acquire_write_lock(&locks, mode, pid, &path, &options)?;

        let opened = {
            let _global = locks.global().shared();
            open_arena(&path, mode, &options, &shm)
        };

        let (arena, table) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                release_write_lock(&locks, mode, pid);
                return Err(err);
            }
        };

        tracing::debug!(path = %path.display(), %mode, size = arena.size(), "opened session");

        Ok(Session {
            path,
            mode,
            options,
            state: Some(Open {
                arena,
                locks,
                table,
                pid,
            }),
            in_global_lock: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_none()
    }

    /// Whether the session is inside an exclusive section.
    pub fn is_locked(&self) -> bool {
        self.in_global_lock
    }

    pub fn get(&mut self, key: &str) -> Result<Option<Value>> {
        self.get_with(key, |cell| cell.map(CellRef::to_value))
    }

    /// Look up `key` and pass its value, borrowed from the mapping, to `f`.
    ///
    /// `f` runs under the read locks of the key, keep it short.
    pub fn get_with<R>(
        &mut self,
        key: &str,
        f: impl FnOnce(Option<CellRef<'_>>) -> R,
    ) -> Result<R> {
        let skip = self.in_global_lock;
        let Open {
            arena,
            locks,
            table,
            ..
        } = self.state.as_mut().ok_or(Error::Closed)?;

        let _shard = (!skip).then(|| locks.shard(table::shard_of(key)).shared());
        let _global = (!skip).then(|| locks.global().shared());
        arena.refresh()?;
        table.get_with(arena, key, f)
    }

    pub fn contains(&mut self, key: &str) -> Result<bool> {
        self.get_with(key, |cell| cell.is_some())
    }

    /// Insert or replace the value of `key`.
    ///
    /// Grows the arena as needed, up to its maximum size.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.set_cell(key, value.as_cell())
    }

    /// Like [`Session::set`], for a borrowed value.
    pub fn set_cell(&mut self, key: &str, value: CellRef<'_>) -> Result<()> {
        let skip = self.in_global_lock;
        let Open {
            arena,
            locks,
            table,
            pid,
        } = self.state.as_mut().ok_or(Error::Closed)?;

        if !self.mode.is_writable() {
            return Err(Error::ReadOnly);
        }

        validate_key(key)?;
        let shard = table::shard_of(key);

        loop {
            let _shard = (!skip).then(|| locks.shard(shard).exclusive(*pid));

            let outcome = {
                let _global = (!skip).then(|| locks.global().shared());
                arena.refresh()?;
                table.set(arena, key, value)
            };

            match outcome {
                Ok(()) => return Ok(()),
                Err(Failure::Error(err)) => return Err(err),
                Err(Failure::Exhausted { requested }) => {
                    let _global = (!skip).then(|| locks.global().exclusive(*pid));
                    arena.refresh()?;
                    grow::grow_for(arena, requested)?;
                }
            }
        }
    }

    /// Remove `key`. Removing a key that is not present is not an error.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        let skip = self.in_global_lock;
        let Open {
            arena,
            locks,
            table,
            pid,
        } = self.state.as_mut().ok_or(Error::Closed)?;

        if !self.mode.is_writable() {
            return Err(Error::ReadOnly);
        }

        // Only the shard lock. Space is returned to the allocator, which has its own lock, and
        // never to the file, so concurrent growth is not a concern.
        let _shard = (!skip).then(|| locks.shard(table::shard_of(key)).exclusive(*pid));
        arena.refresh()?;
        table.delete(arena, key)?;
        Ok(())
    }

    /// A snapshot of all keys, consistent across shards.
    pub fn keys(&mut self) -> Result<Vec<String>> {
        let skip = self.in_global_lock;
        let Open {
            arena,
            locks,
            table,
            pid,
        } = self.state.as_mut().ok_or(Error::Closed)?;

        let _global = (!skip).then(|| locks.global().exclusive(*pid));
        arena.refresh()?;
        table.keys(arena)
    }

    /// Number of keys in the map.
    pub fn len(&mut self) -> Result<u64> {
        self.inspect(|arena, table| table.len(arena))
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Bytes that can be stored before the arena needs to grow.
    pub fn free_memory(&mut self) -> Result<u64> {
        self.inspect(|arena, _| Ok(arena.free_memory()))
    }

    /// Current size of the arena file.
    pub fn size(&mut self) -> Result<u64> {
        self.inspect(|arena, _| Ok(arena.size()))
    }

    pub fn bucket_count(&mut self) -> Result<u64> {
        self.inspect(|arena, table| table.bucket_count(arena))
    }

    pub fn max_bucket_count(&self) -> Result<u64> {
        self.state.as_ref().ok_or(Error::Closed)?;
        Ok(ShardTable::max_bucket_count())
    }

    pub fn load_factor(&mut self) -> Result<f64> {
        self.inspect(|arena, table| table.load_factor(arena))
    }

    pub fn max_load_factor(&mut self) -> Result<f64> {
        self.inspect(|arena, table| table.max_load_factor(arena))
    }

    /// Number of keys in each shard.
    pub fn shard_lens(&mut self) -> Result<Vec<u64>> {
        self.inspect(|arena, table| table.shard_lens(arena))
    }

    fn inspect<R>(&mut self, f: impl FnOnce(&Arena, &ShardTable) -> Result<R>) -> Result<R> {
        let skip = self.in_global_lock;
        let Open {
            arena,
            locks,
            table,
            ..
        } = self.state.as_mut().ok_or(Error::Closed)?;

        let _global = (!skip).then(|| locks.global().shared());
        arena.refresh()?;
        f(arena, table)
    }

    /// Enter an exclusive section: take the global lock exclusively until [`Session::unlock`].
    ///
    /// Every other session's operations wait meanwhile, in all processes. Calling this inside a
    /// section does nothing.
    pub fn lock(&mut self) -> Result<()> {
        let Open { locks, pid, .. } = self.state.as_ref().ok_or(Error::Closed)?;
        if self.in_global_lock {
            return Ok(());
        }

        locks.global().lock_exclusive(*pid);
        self.in_global_lock = true;
        Ok(())
    }

    /// Leave the exclusive section.
    pub fn unlock(&mut self) -> Result<()> {
        let Open { locks, pid, .. } = self.state.as_ref().ok_or(Error::Closed)?;
        if !self.in_global_lock {
            return Err(Error::NotLocked);
        }

        locks.global().unlock_exclusive(*pid);
        self.in_global_lock = false;
        Ok(())
    }

    /// Run `f` inside an exclusive section, leaving it afterwards if it was entered here.
    pub fn with_lock<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let entered = !self.in_global_lock;
        self.lock()?;
        let result = f(self);

        if entered && self.in_global_lock && self.is_open() {
            self.unlock()?;
        }

        result
    }

    /// Release the locks, shrink the arena when no other session has it mapped, and unmap it.
    pub fn close(&mut self) -> Result<()> {
        let open = self.state.take().ok_or(Error::AlreadyClosed)?;
        let in_global_lock = core::mem::take(&mut self.in_global_lock);
        let result = open.close(self.mode, in_global_lock);
        tracing::debug!(path = %self.path.display(), mode = %self.mode, "closed session");
        result
    }

    /// Close on a background thread and report the outcome to `callback`.
    ///
    /// The session counts as closed as soon as this returns.
    pub fn close_with<F>(&mut self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let Some(open) = self.state.take() else {
            callback(Err(Error::AlreadyClosed));
            return;
        };

        let mode = self.mode;
        let in_global_lock = core::mem::take(&mut self.in_global_lock);
        std::thread::spawn(move || callback(open.close(mode, in_global_lock)));
    }
}

impl Open {
    fn close(self, mode: Mode, in_global_lock: bool) -> Result<()> {
        let Open {
            mut arena,
            locks,
            pid,
            ..
        } = self;

        if in_global_lock {
            locks.global().unlock_exclusive(pid);
        }

        // Truncating is only safe when nobody else maps the file.
        let write = locks.write();
        let exclusive = match mode {
            Mode::WriteOnly => true,
            Mode::ReadWrite => {
                write.unlock_shared();
                write.try_lock_exclusive(pid)
            }
            Mode::ReadOnly => false,
        };

        let shrunk = if exclusive {
            let _global = locks.global().exclusive(pid);
            arena.shrink_to_fit()
        } else {
            Ok(())
        };

        let flushed = arena.flush();
        drop(arena);

        match mode {
            _ if exclusive => write.unlock_exclusive(pid),
            Mode::ReadOnly => write.unlock_shared(),
            // Already released above.
            Mode::ReadWrite | Mode::WriteOnly => {}
        }

        shrunk.and(flushed)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("open", &self.is_open())
            .field("locked", &self.in_global_lock)
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(open) = self.state.take() else {
            return;
        };

        if self.in_global_lock {
            open.locks.global().unlock_exclusive(open.pid);
        }

        if let Err(err) = open.arena.flush() {
            tracing::warn!(
                path = %self.path.display(),
                %err,
                "failed to flush session that was not closed",
            );
        }

        release_write_lock(&open.locks, self.mode, open.pid);
    }
}

/// Reset all lock state of the arena at `path`.
///
/// Sessions that are open keep the old state, sessions opened later get a fresh one. Only meant
/// for recovery when a lock holder died and healing at open did not catch it.
pub fn remove_lock_block(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    shm_lock::remove(&Shm::new(), &lock_path(path)?)?;
    tracing::debug!(path = %path.display(), "removed lock block");
    Ok(())
}

fn open_arena(
    path: &Path,
    mode: Mode,
    options: &Options,
    shm: &Shm,
) -> Result<(Arena, ShardTable)> {
    let arena = match mode {
        Mode::ReadOnly => Arena::open_read_only(path, shm)?,
        Mode::ReadWrite | Mode::WriteOnly => Arena::create_or_open(
            path,
            options.initial_size,
            options.max_size,
            shm,
            |arena| ShardTable::construct(arena, options.bucket_count).map(drop),
        )?,
    };

    let table = ShardTable::find(&arena)?;
    Ok((arena, table))
}

fn acquire_write_lock(
    locks: &LockBlock,
    mode: Mode,
    pid: u32,
    path: &Path,
    options: &Options,
) -> Result<()> {
    let write = locks.write();
    let take = || {
        let deadline = Some(Instant::now() + options.lock_timeout);
        match mode {
            Mode::WriteOnly => write.lock_exclusive_until(pid, deadline),
            Mode::ReadWrite | Mode::ReadOnly => write.lock_shared_until(deadline),
        }
    };

    if take() {
        return Ok(());
    }

    if let Some(owner) = write.owner() {
        if !locks.shm().is_alive(owner) {
            tracing::warn!(
                path = %path.display(),
                owner,
                "write lock is held by a process that no longer exists, resetting it",
            );
            write.reset();

            if take() {
                return Ok(());
            }
        }
    }

    Err(Error::Busy {
        path: path.to_owned(),
    })
}

fn release_write_lock(locks: &LockBlock, mode: Mode, pid: u32) {
    match mode {
        Mode::WriteOnly => locks.write().unlock_exclusive(pid),
        Mode::ReadWrite | Mode::ReadOnly => locks.write().unlock_shared(),
    }
}

/// The path that names the lock block: absolute, with symbolic links resolved.
///
/// Works for files that do not exist yet, so that creators and later openers agree.
fn lock_path(path: &Path) -> Result<PathBuf> {
    match path.canonicalize() {
        Ok(path) => return Ok(path),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(Error::io(path, err)),
    }

    let name = path
        .file_name()
        .ok_or_else(|| Error::invalid_file(path, "does not name a file"))?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let dir = dir.canonicalize().map_err(|err| Error::io(dir, err))?;
    Ok(dir.join(name))
}

fn validate_key(key: &str) -> Result<()> {
    if u32::try_from(key.len()).is_err() {
        return Err(Error::InvalidKey("keys are limited to 4 GiB"));
    }

    Ok(())
}
