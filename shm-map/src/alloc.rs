//! Allocation of blocks inside the arena.
//!
//! Every block starts with a 16 byte header holding its size. Free blocks are kept in a single
//! list ordered by address, so that a freed block can be merged with both neighbours. Blocks are
//! taken first-fit, from the tail of a larger free block when it can be split, or else from the
//! bump region at the end of the arena. A free block that ends at the bump region is returned to
//! it.
//!
//! All of the bookkeeping lives in the arena header and is guarded by its spin lock, shared with
//! other processes.
use core::sync::atomic::Ordering;

use bytemuck::{Pod, Zeroable};
use shm_lock::PidLock;

use crate::arena::{Arena, HEADER_SIZE};
use crate::error::{Error, Result};

pub(crate) const BLOCK_HEADER: u64 = 16;
const ALIGN: u64 = 16;
const MIN_BLOCK: u64 = 32;
/// The link of a block that is handed out.
const ALLOCATED: u64 = 0xa110_c8ed_a110_c8ed;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct BlockHeader {
    size: u64,
    link: u64,
}

/// Why an operation that allocates did not complete.
#[derive(Debug)]
pub(crate) enum Failure {
    /// The arena has no room for a block of `requested` bytes, growing it would help.
    Exhausted { requested: u64 },
    Error(Error),
}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        Failure::Error(err)
    }
}

/// Holds the allocator lock.
///
/// Keeps a pointer rather than a reference so that the arena stays usable while the lock is
/// held. Nothing remaps the arena during that time: growth takes the same lock.
struct AllocGuard {
    lock: *const PidLock,
}

impl Drop for AllocGuard {
    fn drop(&mut self) {
        // Safety: the mapping the lock lives in is not replaced while we hold it.
        unsafe { (*self.lock).unlock() }
    }
}

fn block_size(len: u64) -> Option<u64> {
    let size = len.checked_add(BLOCK_HEADER + ALIGN - 1)? & !(ALIGN - 1);
    Some(size.max(MIN_BLOCK))
}

impl Arena {
    /// Allocate `len` bytes and return the offset of the first.
    pub fn allocate(&mut self, len: u64) -> Result<u64, Failure> {
        self.ensure_writable()?;
        let need = block_size(len).ok_or(Failure::Exhausted { requested: u64::MAX })?;
        let _guard = self.lock_allocator()?;
        self.allocate_locked(need)
    }

    /// Return a block handed out by [`Arena::allocate`].
    pub fn deallocate(&mut self, offset: u64) -> Result<()> {
        self.ensure_writable()?;
        let _guard = self.lock_allocator()?;
        self.deallocate_locked(offset)
    }

    /// Bytes that can still be allocated without growing, split blocks included.
    pub fn free_memory(&self) -> u64 {
        let counters = self.counters();
        let top = counters.top.load(Ordering::Relaxed);
        let free = counters.free_bytes.load(Ordering::Relaxed);
        self.size().saturating_sub(top) + free
    }

    /// The usable size of an allocated block.
    #[cfg(test)]
    pub fn allocated_len(&self, offset: u64) -> Result<u64> {
        let block: BlockHeader = self.load(self.block_of(offset)?)?;
        if block.link != ALLOCATED {
            return Err(self.corrupt(format!("block at {offset} is not allocated")));
        }

        Ok(block.size - BLOCK_HEADER)
    }

    fn lock_allocator(&mut self) -> Result<AllocGuard> {
        loop {
            self.refresh()?;
            let lock: *const PidLock = &self.counters().alloc_lock;
            // Safety: points into the current mapping.
            unsafe { (*lock).lock(self.shm()) };

            // Somebody may have grown the arena between our refresh and taking the lock.
            if self.size() == self.mapped_len() {
                return Ok(AllocGuard { lock });
            }

            unsafe { (*lock).unlock() };
        }
    }

    fn max_blocks(&self) -> u64 {
        self.mapped_len() / MIN_BLOCK
    }

    fn block_of(&self, offset: u64) -> Result<u64> {
        offset
            .checked_sub(BLOCK_HEADER)
            .filter(|&at| at >= HEADER_SIZE && at % ALIGN == 0)
            .ok_or_else(|| self.corrupt(format!("{offset} is not the offset of a block")))
    }

    fn allocate_locked(&mut self, need: u64) -> Result<u64, Failure> {
        let mut prev = 0;
        let mut cur = self.counters().free_head.load(Ordering::Relaxed);
        let mut steps = 0;

        while cur != 0 {
            let block: BlockHeader = self.load(cur)?;

            if block.size >= need {
                let (at, size) = if block.size - need >= MIN_BLOCK {
                    // Take the tail, the list stays as it is.
                    self.store(
                        cur,
                        BlockHeader {
                            size: block.size - need,
                            link: block.link,
                        },
                    )?;
                    (cur + block.size - need, need)
                } else {
                    self.set_link(prev, block.link)?;
                    (cur, block.size)
                };

                self.counters().free_bytes.fetch_sub(size, Ordering::Relaxed);
                self.store(
                    at,
                    BlockHeader {
                        size,
                        link: ALLOCATED,
                    },
                )?;
                return Ok(at + BLOCK_HEADER);
            }

            steps += 1;
            if steps > self.max_blocks() {
                return Err(self.corrupt("free list does not end").into());
            }

            prev = cur;
            cur = block.link;
        }

        let top = self.counters().top.load(Ordering::Relaxed);
        match top.checked_add(need) {
            Some(end) if end <= self.size() => {
                self.store(
                    top,
                    BlockHeader {
                        size: need,
                        link: ALLOCATED,
                    },
                )?;
                self.counters().top.store(end, Ordering::Relaxed);
                Ok(top + BLOCK_HEADER)
            }
            _ => Err(Failure::Exhausted { requested: need }),
        }
    }

    fn deallocate_locked(&mut self, offset: u64) -> Result<()> {
        let at = self.block_of(offset)?;
        let block: BlockHeader = self.load(at)?;
        let top = self.counters().top.load(Ordering::Relaxed);

        if block.link != ALLOCATED || block.size < MIN_BLOCK || at + block.size > top {
            return Err(self.corrupt(format!("block at {offset} is not allocated")));
        }

        // Find the free neighbours by address.
        let (mut before_prev, mut prev) = (0, 0);
        let mut next = self.counters().free_head.load(Ordering::Relaxed);
        let mut steps = 0;
        while next != 0 && next < at {
            before_prev = prev;
            prev = next;
            next = self.load::<BlockHeader>(next)?.link;

            steps += 1;
            if steps > self.max_blocks() {
                return Err(self.corrupt("free list does not end"));
            }
        }

        if next == at {
            return Err(self.corrupt(format!("block at {offset} is freed twice")));
        }

        let mut size = block.size;
        let mut link = next;
        if next != 0 && at + size == next {
            let following: BlockHeader = self.load(next)?;
            size += following.size;
            link = following.link;
        }

        let (start, before) = match prev {
            0 => (at, 0),
            prev => {
                let preceding: BlockHeader = self.load(prev)?;
                if prev + preceding.size == at {
                    size += preceding.size;
                    (prev, before_prev)
                } else {
                    (at, prev)
                }
            }
        };

        let counters = self.counters();
        counters.free_bytes.fetch_add(block.size, Ordering::Relaxed);

        if start + size == top {
            // Nothing follows, hand everything back to the bump region.
            counters.free_bytes.fetch_sub(size, Ordering::Relaxed);
            counters.top.store(start, Ordering::Relaxed);
            self.set_link(before, 0)
        } else {
            self.store(start, BlockHeader { size, link })?;
            self.set_link(before, start)
        }
    }

    fn set_link(&mut self, prev: u64, next: u64) -> Result<()> {
        if prev == 0 {
            self.counters().free_head.store(next, Ordering::Relaxed);
            return Ok(());
        }

        let mut block: BlockHeader = self.load(prev)?;
        block.link = next;
        self.store(prev, block)
    }
}

#[test]
fn block_sizes_are_aligned() {
    assert_eq!(block_size(0), Some(MIN_BLOCK));
    assert_eq!(block_size(16), Some(32));
    assert_eq!(block_size(17), Some(48));
    assert_eq!(block_size(u64::MAX), None);
}
