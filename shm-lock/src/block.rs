//! The lock block: all lock state for one arena path, in its own shared memory object.
use core::hash::{Hash, Hasher};
use core::sync::atomic::{AtomicU32, Ordering};
use std::ffi::{CStr, CString};
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, Instant};

use memmap2::{MmapOptions, MmapRaw};
use rustc_hash::FxHasher;

use crate::backoff::Backoff;
use crate::op::{Shm, ShmError};
use crate::rwlock::RawRwLock;
use crate::LockError;

/// Number of shard locks, and so the number of shards a table may use.
pub const SHARD_COUNT: usize = 64;

const MAGIC: u32 = 0x6b63_6f6c;
const LAYOUT_VERSION: u32 = 1;
const NAME_PREFIX: &[u8] = b"/shm-map.";

#[cfg(target_vendor = "apple")]
const NAME_MAX: usize = 31;
#[cfg(not(target_vendor = "apple"))]
const NAME_MAX: usize = 255;

/// Attempts at winning or losing the creation race before giving up.
const OPEN_ATTEMPTS: u32 = 16;
/// How long an exclusive holder may take to record its pid after taking the lock.
const OWNER_GRACE: Duration = Duration::from_millis(250);

/// The binary layout of the shared object. Every field is valid when zeroed.
#[repr(C)]
struct Layout {
    /// Written last by the initializing process.
    magic: AtomicU32,
    version: AtomicU32,
    shard_count: AtomicU32,
    _reserved: AtomicU32,
    global: RawRwLock,
    write: RawRwLock,
    shards: [RawRwLock; SHARD_COUNT],
}

/// A mapped lock block.
pub struct LockBlock {
    map: MmapRaw,
    name: CString,
    shm: Shm,
}

impl LockBlock {
    /// Size of the shared memory object.
    pub const SIZE: usize = core::mem::size_of::<Layout>();

    /// Find or create the lock block for the arena at `path`, and make sure it is usable.
    ///
    /// The block is created by whichever process first fails to open it. Afterwards the global
    /// lock is tried for `timeout`; when it stays unavailable and no live process claims it
    /// exclusively, the whole block is reinitialized under the assumption that its holder died.
    /// An exclusive holder that has not recorded its pid yet is given a short grace period.
    pub fn reify(shm: &Shm, path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let name = block_name(path);
        let deadline = Instant::now() + timeout;

        let (fd, created) = open_or_create(shm, &name)?;
        let sized = created || await_size(shm, &fd, &name, deadline)?;

        let map = MmapOptions::new()
            .len(Self::SIZE)
            .map_raw(&fd)
            .map_err(|source| LockError::os("map", &name, source))?;

        let block = LockBlock {
            map,
            name,
            shm: shm.clone(),
        };

        if created {
            tracing::debug!(name = ?block.name, "created lock block");
            block.initialize();
        } else if !sized {
            tracing::warn!(name = ?block.name, "lock block was never sized by its creator");
            block.initialize();
        } else {
            block.await_initialized(deadline)?;
        }

        block.heal_global(Instant::now() + timeout);
        Ok(block)
    }

    pub fn global(&self) -> &RawRwLock {
        &self.layout().global
    }

    /// The write-exclusivity lock.
    pub fn write(&self) -> &RawRwLock {
        &self.layout().write
    }

    pub fn shard(&self, idx: usize) -> &RawRwLock {
        &self.layout().shards[idx % SHARD_COUNT]
    }

    pub fn shm(&self) -> &Shm {
        &self.shm
    }

    pub fn name(&self) -> &CStr {
        &self.name
    }

    /// Destructively reset every lock, regardless of who holds it.
    pub fn reinitialize(&self) {
        let layout = self.layout();
        layout.magic.store(0, Ordering::Relaxed);
        self.initialize();
    }

    fn initialize(&self) {
        let layout = self.layout();
        layout.global.reset();
        layout.write.reset();
        for shard in &layout.shards {
            shard.reset();
        }

        layout.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        layout.shard_count.store(SHARD_COUNT as u32, Ordering::Relaxed);
        layout.magic.store(MAGIC, Ordering::Release);
    }

    fn await_initialized(&self, deadline: Instant) -> Result<(), LockError> {
        let layout = self.layout();
        let mut backoff = Backoff::new();

        while layout.magic.load(Ordering::Acquire) != MAGIC {
            if Instant::now() >= deadline {
                tracing::warn!(
                    name = ?self.name,
                    "lock block creator did not finish, initializing",
                );
                self.initialize();
                return Ok(());
            }

            backoff.snooze();
        }

        let version = layout.version.load(Ordering::Relaxed);
        let shards = layout.shard_count.load(Ordering::Relaxed);
        if version != LAYOUT_VERSION || shards as usize != SHARD_COUNT {
            return Err(LockError::Layout {
                name: self.name.to_string_lossy().into_owned(),
                found: u64::from(version),
                expected: u64::from(LAYOUT_VERSION),
            });
        }

        Ok(())
    }

    fn heal_global(&self, deadline: Instant) {
        let pid = self.shm.pid();
        let global = self.global();

        if global.lock_exclusive_until(pid, Some(deadline)) {
            global.unlock_exclusive(pid);
            return;
        }

        let mut owner = global.owner();
        if owner.is_none() && global.is_exclusive() {
            // Taken, but the pid is not recorded yet.
            let grace = Instant::now() + OWNER_GRACE;
            let mut backoff = Backoff::new();
            while owner.is_none() && global.is_exclusive() && Instant::now() < grace {
                backoff.snooze();
                owner = global.owner();
            }

            if !global.is_exclusive() {
                tracing::debug!(
                    name = ?self.name,
                    "global lock was released before its owner was recorded",
                );
                return;
            }
        }

        match owner {
            Some(owner) if self.shm.is_alive(owner) => {
                tracing::debug!(name = ?self.name, owner, "global lock is held by a live process");
            }
            owner => {
                tracing::warn!(
                    name = ?self.name,
                    ?owner,
                    readers = global.readers(),
                    "global lock did not become available, reinitializing lock block",
                );
                self.reinitialize();
            }
        }
    }

    fn layout(&self) -> &Layout {
        // Safety: the mapping is `SIZE` bytes, page aligned, and lives as long as `self`. All
        // fields are atomics so shared references from several processes are fine, and every
        // bit pattern, in particular all zeroes, is a valid value.
        unsafe { &*(self.map.as_ptr() as *const Layout) }
    }
}

/// Unlink the lock block of the arena at `path`, resetting all lock state for it.
///
/// Processes that still have the old block mapped keep using it, new openers create a fresh one.
/// Removing a block that does not exist succeeds.
pub fn remove(shm: &Shm, path: &Path) -> Result<(), LockError> {
    let name = block_name(path);
    match shm.unlink(&name) {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(LockError::os("unlink", &name, err.into())),
    }
}

/// The shared memory object name for the arena at `path`.
///
/// Path separators are replaced. Paths too long for an object name are hashed instead.
pub fn block_name(path: &Path) -> CString {
    let bytes = path.as_os_str().as_bytes();
    let mut name = Vec::with_capacity(NAME_PREFIX.len() + bytes.len() + 1);
    name.extend_from_slice(NAME_PREFIX);
    name.extend(bytes.iter().map(|&b| match b {
        b'/' | b'\\' | 0 => b'_',
        b => b,
    }));

    if name.len() > NAME_MAX {
        let mut hasher = FxHasher::default();
        bytes.hash(&mut hasher);
        name.truncate(NAME_PREFIX.len());
        name.extend_from_slice(format!("{:016x}", hasher.finish()).as_bytes());
    }

    // Safety: all NUL bytes were replaced above.
    unsafe { CString::from_vec_unchecked(name) }
}

fn open_or_create(shm: &Shm, name: &CStr) -> Result<(OwnedFd, bool), LockError> {
    for _ in 0..OPEN_ATTEMPTS {
        match shm.open(name) {
            Ok(fd) => return Ok((fd, false)),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(LockError::os("open", name, err.into())),
        }

        match shm.create_new(name) {
            Ok(fd) => {
                shm.set_len(&fd, LockBlock::SIZE as u64)
                    .map_err(|err| LockError::os("size", name, err.into()))?;
                return Ok((fd, true));
            }
            // Somebody else won, open theirs.
            Err(err) if err.already_exists() => continue,
            Err(err) => return Err(LockError::os("create", name, err.into())),
        }
    }

    Err(LockError::os(
        "open",
        name,
        ShmError(libc::EAGAIN).into(),
    ))
}

/// Wait for the creator to size the object. Returns `false` if it never did.
fn await_size(shm: &Shm, fd: &OwnedFd, name: &CStr, deadline: Instant) -> Result<bool, LockError> {
    let mut backoff = Backoff::new();

    loop {
        let stat = shm
            .stat(fd)
            .map_err(|err| LockError::os("stat", name, err.into()))?;
        let size = u64::try_from(stat.st_size).unwrap_or(0);

        if size == LockBlock::SIZE as u64 {
            return Ok(true);
        }

        if size != 0 {
            return Err(LockError::Layout {
                name: name.to_string_lossy().into_owned(),
                found: size,
                expected: LockBlock::SIZE as u64,
            });
        }

        if Instant::now() >= deadline {
            shm.set_len(fd, LockBlock::SIZE as u64)
                .map_err(|err| LockError::os("size", name, err.into()))?;
            return Ok(false);
        }

        backoff.snooze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_has_no_separators() {
        let name = block_name(Path::new("/var/lib/data/store.map"));
        assert_eq!(name.to_bytes(), b"/shm-map._var_lib_data_store.map");
    }

    #[test]
    fn long_names_are_hashed() {
        let long = format!("/tmp/{}", "x".repeat(400));
        let name = block_name(Path::new(&long));
        assert!(name.to_bytes().len() <= NAME_MAX);
        assert!(name.to_bytes().starts_with(NAME_PREFIX));
        assert_eq!(name, block_name(Path::new(&long)));
    }

    #[test]
    fn layout_is_plain_words() {
        assert_eq!(LockBlock::SIZE, 16 + 8 * (2 + SHARD_COUNT));
    }
}
