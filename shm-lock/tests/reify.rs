#![cfg(target_family = "unix")]
use std::ffi::CStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use memmap2::MmapOptions;
use shm_lock::{LockBlock, LockError, Shm, ShmVTable};

const TIMEOUT: Duration = Duration::from_millis(100);

/// A lock block that is unlinked again when the test ends.
struct Scratch {
    _dir: tempfile::TempDir,
    path: PathBuf,
    shm: Shm,
}

impl Scratch {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("to create a scratch directory");
        let path = dir.path().join("arena.map");
        Scratch {
            _dir: dir,
            path,
            shm: Shm::new(),
        }
    }

    fn reify(&self) -> LockBlock {
        LockBlock::reify(&self.shm, &self.path, TIMEOUT).expect("to reify the lock block")
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = shm_lock::remove(&self.shm, &self.path);
    }
}

fn real_open(name: &CStr, create: bool) -> libc::c_int {
    (ShmVTable::new_libc().open)(name, create)
}

fn real_errno() -> libc::c_int {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

#[test]
fn second_opener_shares_state() {
    let scratch = Scratch::new();
    let first = scratch.reify();
    let second = scratch.reify();

    assert_eq!(first.name(), second.name());
    first.shard(3).lock_shared();
    assert_eq!(second.shard(3).readers(), 1);
    second.shard(3).unlock_shared();
    assert_eq!(first.shard(3).readers(), 0);
}

#[test]
fn live_exclusive_owner_is_not_clobbered() {
    let scratch = Scratch::new();
    let first = scratch.reify();
    let pid = scratch.shm.pid();
    first.global().lock_exclusive(pid);
    first.shard(1).lock_shared();

    let second = scratch.reify();
    assert!(second.global().is_exclusive());
    assert_eq!(second.global().owner(), Some(pid));
    assert_eq!(second.shard(1).readers(), 1);

    first.global().unlock_exclusive(pid);
    first.shard(1).unlock_shared();
}

#[test]
fn dead_exclusive_owner_is_reset() {
    let scratch = Scratch::new();
    let first = scratch.reify();
    assert!(first.global().try_lock_exclusive(dead_pid()));
    first.shard(9).lock_shared();

    let second = scratch.reify();
    assert!(!second.global().is_exclusive());
    assert_eq!(second.shard(9).readers(), 0);
}

#[test]
fn stuck_readers_are_reset() {
    let scratch = Scratch::new();
    let first = scratch.reify();
    // Anonymous shared holders that never come back.
    first.global().lock_shared();
    first.write().lock_shared();

    let second = scratch.reify();
    assert_eq!(second.global().readers(), 0);
    assert_eq!(second.write().readers(), 0);
}

#[test]
fn remove_is_idempotent() {
    let scratch = Scratch::new();
    let first = scratch.reify();
    first.write().lock_shared();

    shm_lock::remove(&scratch.shm, &scratch.path).unwrap();
    shm_lock::remove(&scratch.shm, &scratch.path).unwrap();

    let fresh = scratch.reify();
    assert_eq!(fresh.write().readers(), 0);
    // The old mapping is detached but still usable by whoever holds it.
    assert_eq!(first.write().readers(), 1);
}

#[test]
fn failing_open_surfaces() {
    let mut vtable = ShmVTable::new_libc();
    vtable.open = |_, _| -1;
    vtable.errno = || libc::EACCES;
    let shm = unsafe { Shm::new_unchecked(vtable) };

    match LockBlock::reify(&shm, Path::new("/nonexistent/arena.map"), TIMEOUT) {
        Err(LockError::Os { op, source, .. }) => {
            assert_eq!(op, "open");
            assert_eq!(source.raw_os_error(), Some(libc::EACCES));
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("reify must fail when shm_open does"),
    }
}

#[test]
fn losing_the_creation_race_opens_the_winner() {
    // The first lookup misses, as if it ran just before the winner created the object.
    static MISSED: AtomicBool = AtomicBool::new(false);
    static CREATES: AtomicU32 = AtomicU32::new(0);

    let scratch = Scratch::new();
    let winner = scratch.reify();
    winner.shard(5).lock_shared();

    let mut vtable = ShmVTable::new_libc();
    vtable.open = |name, create| {
        if create {
            CREATES.fetch_add(1, Ordering::Relaxed);
        } else if !MISSED.swap(true, Ordering::Relaxed) {
            return -1;
        }

        real_open(name, create)
    };
    vtable.errno = || match CREATES.load(Ordering::Relaxed) {
        0 => libc::ENOENT,
        _ => real_errno(),
    };
    let shm = unsafe { Shm::new_unchecked(vtable) };

    let loser = LockBlock::reify(&shm, &scratch.path, TIMEOUT).unwrap();
    assert_eq!(CREATES.load(Ordering::Relaxed), 1);
    // Opened, not created again over the winner's state.
    assert_eq!(loser.shard(5).readers(), 1);
    winner.shard(5).unlock_shared();
    assert_eq!(loser.shard(5).readers(), 0);
}

#[test]
fn unsized_objects_are_sized() {
    let scratch = Scratch::new();
    let name = shm_lock::block_name(&scratch.path);
    // A creator that died before sizing its object.
    let abandoned = scratch.shm.create_new(&name).unwrap();
    assert_eq!(scratch.shm.stat(&abandoned).unwrap().st_size, 0);

    let block = scratch.reify();
    let size = scratch.shm.stat(&abandoned).unwrap().st_size;
    assert_eq!(size, LockBlock::SIZE as i64);

    let pid = scratch.shm.pid();
    assert!(block.global().try_lock_exclusive(pid));
    assert_eq!(scratch.reify().global().owner(), Some(pid));
    block.global().unlock_exclusive(pid);
}

#[test]
fn uninitialized_objects_are_initialized() {
    let scratch = Scratch::new();
    let name = shm_lock::block_name(&scratch.path);
    // A creator that died after sizing, before it wrote the header.
    let abandoned = scratch.shm.create_new(&name).unwrap();
    scratch
        .shm
        .set_len(&abandoned, LockBlock::SIZE as u64)
        .unwrap();

    let map = MmapOptions::new()
        .len(LockBlock::SIZE)
        .map_raw(&abandoned)
        .unwrap();
    // Three readers on the first shard lock, which follows the header and two locks.
    unsafe { (map.as_mut_ptr().add(32) as *mut u32).write(3) };

    let block = scratch.reify();
    assert_eq!(block.shard(0).readers(), 0);
    assert!(block.global().try_lock_shared());
    block.global().unlock_shared();
}

#[test]
fn exclusive_holder_gets_time_to_record_its_pid() {
    let scratch = Scratch::new();
    let first = scratch.reify();
    first.shard(2).lock_shared();
    // Taken, but no pid recorded yet.
    assert!(first.global().try_lock_exclusive(0));

    let holder = std::thread::spawn(move || {
        std::thread::sleep(TIMEOUT + Duration::from_millis(50));
        first.global().unlock_exclusive(0);
        first
    });

    let second = scratch.reify();
    assert_eq!(second.shard(2).readers(), 1);

    let first = holder.join().unwrap();
    first.shard(2).unlock_shared();
}

#[test]
fn exclusive_holder_without_pid_is_reset_eventually() {
    let scratch = Scratch::new();
    let first = scratch.reify();
    first.shard(2).lock_shared();
    assert!(first.global().try_lock_exclusive(0));

    let second = scratch.reify();
    assert!(!second.global().is_exclusive());
    assert_eq!(second.shard(2).readers(), 0);
}
