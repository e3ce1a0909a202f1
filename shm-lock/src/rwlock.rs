//! Locks that are plain words in shared memory.
//!
//! Nothing here is tied to the address space of the process that initialized it: an all-zero
//! word is an unlocked lock, so a freshly truncated shared memory object is a valid block of
//! unlocked locks and reinitialization is a store of zero.
use core::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use crate::backoff::Backoff;
use crate::op::Shm;

const WRITER: u32 = 1 << 31;
/// Set by writers while they wait, holds back new readers.
const WRITER_WAITING: u32 = 1 << 30;
const READERS: u32 = WRITER_WAITING - 1;

/// A reader/writer lock that may be shared between processes.
///
/// Exclusive holders record their pid in `owner` so that a waiter can tell a crashed holder from
/// a slow one. Shared holders are anonymous.
#[repr(C)]
pub struct RawRwLock {
    state: AtomicU32,
    owner: AtomicU32,
}

impl RawRwLock {
    pub const fn new() -> Self {
        RawRwLock {
            state: AtomicU32::new(0),
            owner: AtomicU32::new(0),
        }
    }

    pub fn try_lock_shared(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);

        loop {
            if state & (WRITER | WRITER_WAITING) != 0 || state & READERS == READERS {
                return false;
            }

            match self.state.compare_exchange_weak(
                state,
                state + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => state = current,
            }
        }
    }

    pub fn try_lock_exclusive(&self, pid: u32) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);

        loop {
            if state & (WRITER | READERS) != 0 {
                return false;
            }

            // Replacing the whole word also drops the waiting bit, other waiters set it again.
            match self.state.compare_exchange_weak(
                state,
                WRITER,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // Until this store the lock looks ownerless, see `LockBlock::reify`.
                    self.owner.store(pid, Ordering::Relaxed);
                    return true;
                }
                Err(current) => state = current,
            }
        }
    }

    /// Block until the lock is held shared.
    pub fn lock_shared(&self) {
        while !self.lock_shared_until(None) {}
    }

    /// Block until the lock is held exclusively.
    pub fn lock_exclusive(&self, pid: u32) {
        while !self.lock_exclusive_until(pid, None) {}
    }

    /// Try to take the lock shared, giving up at the deadline.
    pub fn lock_shared_until(&self, deadline: Option<Instant>) -> bool {
        let mut backoff = Backoff::new();

        loop {
            if self.try_lock_shared() {
                return true;
            }

            if expired(deadline) {
                return false;
            }

            backoff.snooze();
        }
    }

    /// Try to take the lock exclusively, giving up at the deadline.
    pub fn lock_exclusive_until(&self, pid: u32, deadline: Option<Instant>) -> bool {
        let mut backoff = Backoff::new();

        loop {
            if self.try_lock_exclusive(pid) {
                return true;
            }

            if expired(deadline) {
                // Do not leave readers locked out behind a writer that gave up.
                self.state.fetch_and(!WRITER_WAITING, Ordering::Relaxed);
                return false;
            }

            self.state.fetch_or(WRITER_WAITING, Ordering::Relaxed);
            backoff.snooze();
        }
    }

    /// Release one shared hold.
    ///
    /// A no-op when no reader is registered, which is the case after the block was reset while we
    /// held the lock.
    pub fn unlock_shared(&self) {
        let mut state = self.state.load(Ordering::Relaxed);

        loop {
            if state & READERS == 0 {
                return;
            }

            match self.state.compare_exchange_weak(
                state,
                state - 1,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => state = current,
            }
        }
    }

    /// Release an exclusive hold taken by `pid`.
    ///
    /// A no-op if the lock is now owned by somebody else, e.g. after a reset.
    pub fn unlock_exclusive(&self, pid: u32) {
        if self
            .owner
            .compare_exchange(pid, 0, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let mut state = self.state.load(Ordering::Relaxed);

        loop {
            if state & WRITER == 0 {
                return;
            }

            match self.state.compare_exchange_weak(
                state,
                state & !WRITER,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => state = current,
            }
        }
    }

    /// The pid recorded by the current exclusive holder.
    pub fn owner(&self) -> Option<u32> {
        match self.owner.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn is_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }

    pub fn readers(&self) -> u32 {
        self.state.load(Ordering::Relaxed) & READERS
    }

    /// Forget every holder.
    pub fn reset(&self) {
        self.owner.store(0, Ordering::Relaxed);
        self.state.store(0, Ordering::Release);
    }

    pub fn shared(&self) -> SharedGuard<'_> {
        self.lock_shared();
        SharedGuard { lock: self }
    }

    pub fn exclusive(&self, pid: u32) -> ExclusiveGuard<'_> {
        self.lock_exclusive(pid);
        ExclusiveGuard { lock: self, pid }
    }
}

impl Default for RawRwLock {
    fn default() -> Self {
        RawRwLock::new()
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.map_or(false, |deadline| Instant::now() >= deadline)
}

/// A scoped shared hold.
#[must_use = "the lock is released when the guard is dropped"]
pub struct SharedGuard<'lt> {
    lock: &'lt RawRwLock,
}

/// A scoped exclusive hold.
#[must_use = "the lock is released when the guard is dropped"]
pub struct ExclusiveGuard<'lt> {
    lock: &'lt RawRwLock,
    pid: u32,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_exclusive(self.pid);
    }
}

/// A process-shared spin lock in one word: zero when free, otherwise the holder's pid.
///
/// A waiter that finds the holder's process gone takes the lock over. Whatever the dead holder
/// was protecting is then in the state it left it in.
#[repr(transparent)]
pub struct PidLock(AtomicU32);

impl PidLock {
    /// Attempts between two liveness checks of the holder.
    const LIVENESS_INTERVAL: u32 = 64;

    pub const fn new() -> Self {
        PidLock(AtomicU32::new(0))
    }

    pub fn lock(&self, shm: &Shm) {
        let pid = shm.pid();
        let mut backoff = Backoff::new();
        let mut attempts = 0u32;

        loop {
            let holder = match self
                .0
                .compare_exchange_weak(0, pid, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(holder) => holder,
            };

            attempts = attempts.wrapping_add(1);
            if holder != 0
                && holder != pid
                && attempts % Self::LIVENESS_INTERVAL == 0
                && !shm.is_alive(holder)
                && self
                    .0
                    .compare_exchange(holder, pid, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                tracing::warn!(
                    holder,
                    "took over a spin lock from a process that no longer exists",
                );
                return;
            }

            backoff.snooze();
        }
    }

    pub fn unlock(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn holder(&self) -> Option<u32> {
        match self.0.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }
}

impl Default for PidLock {
    fn default() -> Self {
        PidLock::new()
    }
}
