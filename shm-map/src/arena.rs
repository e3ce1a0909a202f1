//! The arena: a single memory-mapped file that holds every persistent structure.
//!
//! All references inside the file are offsets from its start, so each process may map it at any
//! address and remap it after growth. The first [`HEADER_SIZE`] bytes are reserved:
//!
//! - a preamble with magic and format version;
//! - the counters: the live size, the allocator's bookkeeping and its lock;
//! - a small directory of named objects, the only roots from which the data is reachable.
//!
//! The live size in the header must always equal the length of the file. Both growth and
//! shrinking resize the file before they publish the new size, and publish nothing if resizing
//! failed, so a mismatch is left behind only by a process that died in between.
use core::mem::size_of;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::fs::{File, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use memmap2::{MmapOptions, MmapRaw};
use shm_lock::{PidLock, Shm};

use crate::alloc::Failure;
use crate::config::MINIMUM_SIZE;
use crate::error::{Error, Result};

/// Start of the first allocatable block.
pub(crate) const HEADER_SIZE: u64 = 512;
/// Growth never adds less than this.
pub(crate) const MINIMUM_GROWTH: u64 = 100;

const MAGIC: [u8; 8] = *b"shm-map\0";
const VERSION: u32 = 1;

const COUNTERS_OFFSET: u64 = 16;
const NAMES_OFFSET: u64 = 64;
const NAME_LEN: usize = 24;
const NAME_SLOTS: u64 = 8;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Preamble {
    magic: [u8; 8],
    version: u32,
    _reserved: u32,
}

/// Header words that change while the file is shared.
#[repr(C)]
pub(crate) struct Counters {
    pub size: AtomicU64,
    /// End of the bump region, everything beyond is unused.
    pub top: AtomicU64,
    pub free_head: AtomicU64,
    pub free_bytes: AtomicU64,
    pub alloc_lock: PidLock,
    _reserved: AtomicU32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct NamedSlot {
    name: [u8; NAME_LEN],
    offset: u64,
}

const _: () = {
    assert!(COUNTERS_OFFSET as usize >= size_of::<Preamble>());
    assert!(COUNTERS_OFFSET as usize + size_of::<Counters>() <= NAMES_OFFSET as usize);
    assert!(NAMES_OFFSET + NAME_SLOTS * size_of::<NamedSlot>() as u64 <= HEADER_SIZE);
    assert!(MINIMUM_SIZE > HEADER_SIZE);
};

pub(crate) struct Arena {
    path: PathBuf,
    file: File,
    map: MmapRaw,
    writable: bool,
    max_size: u64,
    shm: Shm,
}

impl Arena {
    /// Open the arena at `path` for writing, creating it with `initial_size` bytes if absent.
    ///
    /// A new arena is built in a temporary file next to `path`, prepared by `init`, and only
    /// then moved into place. If another process moves its own file there first, that one is
    /// opened instead.
    pub fn create_or_open(
        path: &Path,
        initial_size: u64,
        max_size: u64,
        shm: &Shm,
        init: impl FnOnce(&mut Arena) -> Result<(), Failure>,
    ) -> Result<Self> {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => return Self::from_file(path, file, true, max_size, shm),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::io(path, err)),
        }

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let pending = tempfile::Builder::new()
            .prefix(".shm-map")
            .tempfile_in(dir)
            .map_err(|err| Error::io(dir, err))?;

        let size = initial_size.max(MINIMUM_SIZE);
        let prepare = || -> io::Result<File> {
            let file = pending.as_file();
            file.set_permissions(Permissions::from_mode(0o644))?;
            file.set_len(size)?;
            file.try_clone()
        };
        let file = prepare().map_err(|err| Error::io(pending.path(), err))?;

        let mut arena = Arena {
            path: path.to_owned(),
            map: Self::map_file(&file, size, true).map_err(|err| Error::io(path, err))?,
            file,
            writable: true,
            max_size,
            shm: shm.clone(),
        };

        arena.initialize(size)?;
        init(&mut arena).map_err(|failure| match failure {
            Failure::Exhausted { requested } => Error::Capacity {
                requested,
                max: size,
            },
            Failure::Error(err) => err,
        })?;
        arena.flush()?;

        match pending.persist_noclobber(path) {
            Ok(_) => {
                tracing::debug!(path = %path.display(), size, "created arena");
                Ok(arena)
            }
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                tracing::debug!(path = %path.display(), "arena was created concurrently");
                drop(arena);
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(|err| Error::io(path, err))?;
                Self::from_file(path, file, true, max_size, shm)
            }
            Err(err) => Err(Error::io(path, err.error)),
        }
    }

    /// Map an existing arena without write access.
    pub fn open_read_only(path: &Path, shm: &Shm) -> Result<Self> {
        validate_file(path)?;
        let file = File::open(path).map_err(|err| Error::io(path, err))?;
        Self::from_file(path, file, false, 0, shm)
    }

    fn from_file(
        path: &Path,
        file: File,
        writable: bool,
        max_size: u64,
        shm: &Shm,
    ) -> Result<Self> {
        let len = file
            .metadata()
            .map_err(|err| Error::io(path, err))?
            .len();

        if len < HEADER_SIZE {
            return Err(corrupt(path, format!("{len} bytes are too short for a header")));
        }

        let arena = Arena {
            path: path.to_owned(),
            map: Self::map_file(&file, len, writable).map_err(|err| Error::io(path, err))?,
            file,
            writable,
            max_size,
            shm: shm.clone(),
        };

        let preamble: Preamble = arena.load(0)?;
        if preamble.magic != MAGIC {
            return Err(arena.corrupt("not an arena file"));
        }

        if preamble.version != VERSION {
            return Err(arena.corrupt(format!(
                "format version {} is not supported",
                preamble.version
            )));
        }

        let live = arena.size();
        if live != len {
            return Err(arena.corrupt(format!(
                "header records {live} bytes but the file has {len}"
            )));
        }

        Ok(arena)
    }

    fn initialize(&mut self, size: u64) -> Result<()> {
        self.store(
            0,
            Preamble {
                magic: MAGIC,
                version: VERSION,
                _reserved: 0,
            },
        )?;

        let counters = self.counters();
        counters.top.store(HEADER_SIZE, Ordering::Relaxed);
        counters.free_head.store(0, Ordering::Relaxed);
        counters.free_bytes.store(0, Ordering::Relaxed);
        counters.size.store(size, Ordering::Release);
        Ok(())
    }

    fn map_file(file: &File, len: u64, writable: bool) -> io::Result<MmapRaw> {
        let len = usize::try_from(len).map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
        let mut options = MmapOptions::new();
        options.len(len);

        if writable {
            options.map_raw(file)
        } else {
            options.map_raw_read_only(file)
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub(crate) fn shm(&self) -> &Shm {
        &self.shm
    }

    /// The live size of the file, as published in the header.
    pub fn size(&self) -> u64 {
        self.counters().size.load(Ordering::Acquire)
    }

    pub fn mapped_len(&self) -> u64 {
        self.map.len() as u64
    }

    pub(crate) fn counters(&self) -> &Counters {
        // Safety: every mapping covers at least the header, checked when it was created. The
        // counters are atomics, so sharing them between processes is fine, and every bit
        // pattern is valid.
        unsafe { &*(self.map.as_ptr().add(COUNTERS_OFFSET as usize) as *const Counters) }
    }

    pub fn corrupt(&self, reason: impl Into<String>) -> Error {
        corrupt(&self.path, reason)
    }

    pub fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }

    /// Follow a growth or shrink by another session.
    pub fn refresh(&mut self) -> Result<()> {
        let live = self.size();
        if live == self.mapped_len() {
            return Ok(());
        }

        let len = self
            .file
            .metadata()
            .map_err(|err| Error::io(&self.path, err))?
            .len();
        if len < live || live < HEADER_SIZE {
            return Err(self.corrupt(format!(
                "header records {live} bytes but the file has {len}"
            )));
        }

        tracing::trace!(
            path = %self.path.display(),
            from = self.mapped_len(),
            to = live,
            "remapping",
        );
        self.remap(live)
    }

    fn remap(&mut self, len: u64) -> Result<()> {
        self.map = Self::map_file(&self.file, len, self.writable)
            .map_err(|err| Error::io(&self.path, err))?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }

        self.map.flush().map_err(|err| Error::io(&self.path, err))
    }

    /// Add at least `extra` bytes to the end of the arena.
    ///
    /// The caller must hold the global lock exclusively.
    pub fn grow(&mut self, extra: u64) -> Result<u64> {
        self.ensure_writable()?;
        let current = self.size();
        let new_size = current.saturating_add(extra.max(MINIMUM_GROWTH));

        if new_size > self.max_size {
            return Err(Error::Capacity {
                requested: new_size,
                max: self.max_size,
            });
        }

        self.flush()?;
        // Mapping past the end of the file is fine as long as nothing touches it, and a failed
        // mapping leaves the file as it was.
        let map =
            Self::map_file(&self.file, new_size, true).map_err(|err| Error::io(&self.path, err))?;
        self.set_file_len(new_size)?;
        self.map = map;

        // Nobody else may be inside the allocator while the size changes.
        let counters = self.counters();
        counters.alloc_lock.lock(&self.shm);
        counters.size.store(new_size, Ordering::Release);
        counters.alloc_lock.unlock();

        tracing::debug!(path = %self.path.display(), from = current, to = new_size, "grew arena");
        Ok(new_size)
    }

    /// Cut off the unused end of the arena, but not below the minimum size.
    ///
    /// The caller must be the only session with the arena mapped.
    pub fn shrink_to_fit(&mut self) -> Result<()> {
        self.ensure_writable()?;
        self.refresh()?;

        let current = self.size();
        self.flush()?;

        let counters = self.counters();
        counters.alloc_lock.lock(&self.shm);
        let target = counters.top.load(Ordering::Relaxed).max(MINIMUM_SIZE);
        let truncated = if target < current {
            self.set_file_len(target).map(|()| {
                counters.size.store(target, Ordering::Release);
                true
            })
        } else {
            Ok(false)
        };
        counters.alloc_lock.unlock();

        if !truncated? {
            return Ok(());
        }

        self.remap(target)?;
        tracing::debug!(path = %self.path.display(), from = current, to = target, "shrank arena");
        Ok(())
    }

    fn set_file_len(&self, len: u64) -> Result<()> {
        #[cfg(test)]
        if FAIL_RESIZE.with(|fail| fail.get()) {
            let err = io::Error::new(io::ErrorKind::Other, "resizing is disabled");
            return Err(Error::io(&self.path, err));
        }

        self.file.set_len(len).map_err(|err| Error::io(&self.path, err))
    }

    fn check(&self, offset: u64, len: u64, align: u64) -> Result<*mut u8> {
        match offset.checked_add(len) {
            Some(end) if end <= self.mapped_len() && offset % align == 0 => {
                // Safety: in bounds of the mapping, checked above.
                Ok(unsafe { self.map.as_mut_ptr().add(offset as usize) })
            }
            _ => Err(self.corrupt(format!(
                "{len} bytes at offset {offset} are outside of the mapped {} bytes",
                self.mapped_len()
            ))),
        }
    }

    pub fn load<T: Pod>(&self, offset: u64) -> Result<T> {
        let ptr = self.check(offset, size_of::<T>() as u64, core::mem::align_of::<T>() as u64)?;
        // Safety: in bounds and aligned, and any bit pattern is a valid `T`.
        Ok(unsafe { core::ptr::read(ptr as *const T) })
    }

    pub fn store<T: Pod>(&mut self, offset: u64, value: T) -> Result<()> {
        self.ensure_writable()?;
        let ptr = self.check(offset, size_of::<T>() as u64, core::mem::align_of::<T>() as u64)?;
        // Safety: in bounds, aligned, and the mapping is writable.
        unsafe { core::ptr::write(ptr as *mut T, value) };
        Ok(())
    }

    pub fn bytes(&self, offset: u64, len: u64) -> Result<&[u8]> {
        if len == 0 {
            return Ok(&[]);
        }

        let ptr = self.check(offset, len, 1)?;
        // Safety: in bounds. The bytes are only changed under the locks that our caller holds.
        Ok(unsafe { core::slice::from_raw_parts(ptr, len as usize) })
    }

    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        self.ensure_writable()?;
        let ptr = self.check(offset, data.len() as u64, 1)?;
        // Safety: in bounds and writable. `data` can not alias the mapping, we hold it mutably.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
        Ok(())
    }

    pub fn fill_zero(&mut self, offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }

        self.ensure_writable()?;
        let ptr = self.check(offset, len, 1)?;
        // Safety: in bounds and writable.
        unsafe { core::ptr::write_bytes(ptr, 0, len as usize) };
        Ok(())
    }

    /// The offset of the object registered under `name`.
    pub fn find(&self, name: &str) -> Result<Option<u64>> {
        let wanted = slot_name(name)?;

        for idx in 0..NAME_SLOTS {
            let slot: NamedSlot = self.load(slot_offset(idx))?;
            if slot.offset != 0 && slot.name == wanted {
                return Ok(Some(slot.offset));
            }
        }

        Ok(None)
    }

    /// Find the object registered under `name`, or allocate `size` bytes for it, prepare them
    /// with `init` and register them.
    pub fn find_or_construct(
        &mut self,
        name: &str,
        size: u64,
        init: impl FnOnce(&mut Self, u64) -> Result<(), Failure>,
    ) -> Result<u64, Failure> {
        if let Some(offset) = self.find(name)? {
            return Ok(offset);
        }

        let wanted = slot_name(name)?;
        let mut free = None;
        for idx in 0..NAME_SLOTS {
            let slot: NamedSlot = self.load(slot_offset(idx))?;
            if slot.offset == 0 {
                free = Some(idx);
                break;
            }
        }

        let Some(idx) = free else {
            return Err(self.corrupt("the object directory is full").into());
        };

        let offset = self.allocate(size)?;
        if let Err(failure) = init(self, offset) {
            self.deallocate(offset)?;
            return Err(failure);
        }

        self.store(
            slot_offset(idx),
            NamedSlot {
                name: wanted,
                offset,
            },
        )?;

        Ok(offset)
    }
}

#[cfg(test)]
thread_local! {
    /// Makes every resize of an arena file on this thread fail.
    pub(crate) static FAIL_RESIZE: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
}

/// Check that `path` can hold an arena before mapping it.
pub(crate) fn validate_file(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|err| Error::io(path, err))?;

    if !meta.is_file() {
        return Err(Error::invalid_file(path, "is not a regular file"));
    }

    if meta.len() == 0 {
        return Err(Error::invalid_file(path, "is an empty file"));
    }

    Ok(())
}

fn corrupt(path: &Path, reason: impl Into<String>) -> Error {
    Error::Corrupt {
        path: path.to_owned(),
        reason: reason.into(),
    }
}

fn slot_offset(idx: u64) -> u64 {
    NAMES_OFFSET + idx * size_of::<NamedSlot>() as u64
}

fn slot_name(name: &str) -> Result<[u8; NAME_LEN]> {
    let mut slot = [0; NAME_LEN];
    if name.is_empty() || name.len() > NAME_LEN {
        return Err(Error::InvalidKey("object names are 1 to 24 bytes"));
    }

    slot[..name.len()].copy_from_slice(name.as_bytes());
    Ok(slot)
}
