//! The shard table.
//!
//! The keyspace is split over [`SHARD_COUNT`] shards by the top bits of a key's hash. Each shard
//! is a separately chained hash map with its own bucket array and element count, so writers to
//! different shards touch disjoint memory and only ever need their own shard's lock. Bucket arrays
//! are allocated on the first insert and double when the load factor would be exceeded.
use core::hash::Hasher;
use core::mem::size_of;

use bytemuck::{Pod, Zeroable};
use rustc_hash::FxHasher;
use shm_lock::SHARD_COUNT;

use crate::alloc::Failure;
use crate::arena::Arena;
use crate::cell::{CellRef, RawCell, RawKey};
use crate::error::Result;

/// The name the table is registered under in the arena.
pub(crate) const TABLE_NAME: &str = "properties";
const SHARD_BITS: u32 = SHARD_COUNT.trailing_zeros();
pub(crate) const MAX_BUCKETS_PER_SHARD: u64 = 1 << 26;
pub(crate) const DEFAULT_MAX_LOAD_FACTOR: f64 = 1.0;

const _: () = assert!(SHARD_COUNT == 1 << SHARD_BITS);

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Root {
    shard_count: u64,
    max_load_factor: f64,
    _reserved: [u64; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ShardHeader {
    /// Offset of the bucket array, zero until the first insert.
    buckets: u64,
    bucket_count: u64,
    len: u64,
    _reserved: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Node {
    /// Must stay first, see `Found::slot`.
    next: u64,
    hash: u64,
    key: RawKey,
    cell: RawCell,
}

struct Found {
    /// Offset of the word that points to the node: a bucket or the previous node.
    slot: u64,
    offset: u64,
    node: Node,
}

pub(crate) fn key_hash(key: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(key.as_bytes());
    let hash = hasher.finish();
    hash ^ (hash >> 32)
}

/// The shard that holds `key`.
pub fn shard_of(key: &str) -> usize {
    shard_index(key_hash(key))
}

fn shard_index(hash: u64) -> usize {
    (hash >> (64 - SHARD_BITS)) as usize
}

fn bucket_slot(buckets: u64, hash: u64, bucket_count: u64) -> u64 {
    buckets + 8 * (hash % bucket_count)
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ShardTable {
    root: u64,
}

impl ShardTable {
    /// Register a new, empty table in `arena` with roughly `bucket_count` buckets.
    pub fn construct(arena: &mut Arena, bucket_count: u64) -> Result<Self, Failure> {
        let per_shard = bucket_count
            .div_ceil(SHARD_COUNT as u64)
            .clamp(1, MAX_BUCKETS_PER_SHARD);
        let size = (size_of::<Root>() + SHARD_COUNT * size_of::<ShardHeader>()) as u64;

        let root = arena.find_or_construct(TABLE_NAME, size, |arena, root| {
            arena.store(
                root,
                Root {
                    shard_count: SHARD_COUNT as u64,
                    max_load_factor: DEFAULT_MAX_LOAD_FACTOR,
                    _reserved: [0; 2],
                },
            )?;

            for idx in 0..SHARD_COUNT {
                arena.store(
                    shard_offset(root, idx),
                    ShardHeader {
                        buckets: 0,
                        bucket_count: per_shard,
                        len: 0,
                        _reserved: 0,
                    },
                )?;
            }

            Ok(())
        })?;

        Ok(ShardTable { root })
    }

    /// The table of an existing arena.
    pub fn find(arena: &Arena) -> Result<Self> {
        let root = arena
            .find(TABLE_NAME)?
            .ok_or_else(|| arena.corrupt("the table is missing"))?;

        let header: Root = arena.load(root)?;
        if header.shard_count != SHARD_COUNT as u64 {
            return Err(arena.corrupt(format!(
                "table has {} shards, expected {SHARD_COUNT}",
                header.shard_count
            )));
        }

        Ok(ShardTable { root })
    }

    fn shard(&self, arena: &Arena, idx: usize) -> Result<ShardHeader> {
        let shard: ShardHeader = arena.load(shard_offset(self.root, idx))?;
        if shard.bucket_count == 0 {
            return Err(arena.corrupt(format!("shard {idx} has no buckets")));
        }

        Ok(shard)
    }

    fn store_shard(&self, arena: &mut Arena, idx: usize, shard: ShardHeader) -> Result<()> {
        arena.store(shard_offset(self.root, idx), shard)
    }

    fn lookup(
        &self,
        arena: &Arena,
        shard: &ShardHeader,
        hash: u64,
        key: &str,
    ) -> Result<Option<Found>> {
        if shard.buckets == 0 {
            return Ok(None);
        }

        let mut slot = bucket_slot(shard.buckets, hash, shard.bucket_count);
        let mut offset: u64 = arena.load(slot)?;
        let mut steps = 0;

        while offset != 0 {
            let node: Node = arena.load(offset)?;
            if node.hash == hash && node.key.matches(arena, key)? {
                return Ok(Some(Found { slot, offset, node }));
            }

            steps += 1;
            if steps > shard.len {
                return Err(arena.corrupt("a bucket chain does not end"));
            }

            slot = offset;
            offset = node.next;
        }

        Ok(None)
    }

    /// Look up `key` and hand its value, borrowed from the arena, to `f`.
    pub fn get_with<R>(
        &self,
        arena: &Arena,
        key: &str,
        f: impl FnOnce(Option<CellRef<'_>>) -> R,
    ) -> Result<R> {
        let hash = key_hash(key);
        let shard = self.shard(arena, shard_index(hash))?;

        match self.lookup(arena, &shard, hash, key)? {
            Some(found) => Ok(f(Some(found.node.cell.read(arena)?))),
            None => Ok(f(None)),
        }
    }

    /// Insert `key`, or replace its value.
    ///
    /// A replaced value is destroyed and the new one constructed from scratch, even if both are
    /// of the same kind. The new one is constructed first, so that running out of space leaves
    /// the table as it was.
    pub fn set(&self, arena: &mut Arena, key: &str, value: CellRef<'_>) -> Result<(), Failure> {
        let hash = key_hash(key);
        let idx = shard_index(hash);
        let shard = self.shard(arena, idx)?;

        if let Some(found) = self.lookup(arena, &shard, hash, key)? {
            let cell = RawCell::construct(arena, value)?;
            found.node.cell.destroy(arena)?;
            arena.store(
                found.offset,
                Node {
                    cell,
                    ..found.node
                },
            )?;
            return Ok(());
        }

        let shard = self.reserve(arena, idx, shard)?;
        let key = RawKey::construct(arena, key)?;

        let cell = match RawCell::construct(arena, value) {
            Ok(cell) => cell,
            Err(failure) => {
                key.destroy(arena)?;
                return Err(failure);
            }
        };

        let offset = match arena.allocate(size_of::<Node>() as u64) {
            Ok(offset) => offset,
            Err(failure) => {
                cell.destroy(arena)?;
                key.destroy(arena)?;
                return Err(failure);
            }
        };

        let slot = bucket_slot(shard.buckets, hash, shard.bucket_count);
        let next: u64 = arena.load(slot)?;
        arena.store(
            offset,
            Node {
                next,
                hash,
                key,
                cell,
            },
        )?;
        arena.store(slot, offset)?;
        self.store_shard(
            arena,
            idx,
            ShardHeader {
                len: shard.len + 1,
                ..shard
            },
        )?;

        Ok(())
    }

    /// Make room for one more element in a shard.
    fn reserve(
        &self,
        arena: &mut Arena,
        idx: usize,
        shard: ShardHeader,
    ) -> Result<ShardHeader, Failure> {
        let bucket_count = if shard.buckets == 0 {
            shard.bucket_count
        } else {
            let max_load_factor = self.max_load_factor(arena)?;
            let load = (shard.len + 1) as f64 / shard.bucket_count as f64;
            if load <= max_load_factor || shard.bucket_count >= MAX_BUCKETS_PER_SHARD {
                return Ok(shard);
            }

            (shard.bucket_count * 2).min(MAX_BUCKETS_PER_SHARD)
        };

        let bytes = bucket_count * 8;
        let buckets = arena.allocate(bytes)?;
        arena.fill_zero(buckets, bytes)?;

        if shard.buckets != 0 {
            let mut moved = 0;
            for bucket in 0..shard.bucket_count {
                let mut offset: u64 = arena.load(shard.buckets + 8 * bucket)?;

                while offset != 0 {
                    let mut node: Node = arena.load(offset)?;
                    let next = node.next;
                    let slot = bucket_slot(buckets, node.hash, bucket_count);
                    node.next = arena.load(slot)?;
                    arena.store(offset, node)?;
                    arena.store(slot, offset)?;

                    moved += 1;
                    if moved > shard.len {
                        return Err(arena.corrupt("a bucket chain does not end").into());
                    }

                    offset = next;
                }
            }

            arena.deallocate(shard.buckets)?;
            tracing::trace!(shard = idx, buckets = bucket_count, "rehashed shard");
        }

        let shard = ShardHeader {
            buckets,
            bucket_count,
            ..shard
        };
        self.store_shard(arena, idx, shard)?;
        Ok(shard)
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, arena: &mut Arena, key: &str) -> Result<bool> {
        let hash = key_hash(key);
        let idx = shard_index(hash);
        let shard = self.shard(arena, idx)?;

        let Some(found) = self.lookup(arena, &shard, hash, key)? else {
            return Ok(false);
        };

        arena.store(found.slot, found.node.next)?;
        self.store_shard(
            arena,
            idx,
            ShardHeader {
                len: shard.len.saturating_sub(1),
                ..shard
            },
        )?;

        found.node.key.destroy(arena)?;
        found.node.cell.destroy(arena)?;
        arena.deallocate(found.offset)?;
        Ok(true)
    }

    /// Visit every entry, shard by shard.
    pub fn for_each(&self, arena: &Arena, mut f: impl FnMut(&str, CellRef<'_>)) -> Result<()> {
        for idx in 0..SHARD_COUNT {
            let shard = self.shard(arena, idx)?;
            if shard.buckets == 0 {
                continue;
            }

            let mut seen = 0;
            for bucket in 0..shard.bucket_count {
                let mut offset: u64 = arena.load(shard.buckets + 8 * bucket)?;

                while offset != 0 {
                    let node: Node = arena.load(offset)?;
                    f(node.key.read(arena)?, node.cell.read(arena)?);

                    seen += 1;
                    if seen > shard.len {
                        return Err(arena.corrupt("a bucket chain does not end"));
                    }

                    offset = node.next;
                }
            }
        }

        Ok(())
    }

    pub fn keys(&self, arena: &Arena) -> Result<Vec<String>> {
        let mut keys = Vec::with_capacity(usize::try_from(self.len(arena)?).unwrap_or(0));
        self.for_each(arena, |key, _| keys.push(key.to_owned()))?;
        Ok(keys)
    }

    pub fn len(&self, arena: &Arena) -> Result<u64> {
        (0..SHARD_COUNT).try_fold(0, |sum: u64, idx| -> Result<u64> {
            Ok(sum + self.shard(arena, idx)?.len)
        })
    }

    pub fn bucket_count(&self, arena: &Arena) -> Result<u64> {
        (0..SHARD_COUNT).try_fold(0, |sum: u64, idx| -> Result<u64> {
            Ok(sum + self.shard(arena, idx)?.bucket_count)
        })
    }

    pub fn max_bucket_count() -> u64 {
        SHARD_COUNT as u64 * MAX_BUCKETS_PER_SHARD
    }

    pub fn load_factor(&self, arena: &Arena) -> Result<f64> {
        let len = self.len(arena)?;
        let buckets = self.bucket_count(arena)?;
        Ok(len as f64 / buckets as f64)
    }

    pub fn max_load_factor(&self, arena: &Arena) -> Result<f64> {
        Ok(arena.load::<Root>(self.root)?.max_load_factor)
    }

    /// Entries per shard, for diagnostics.
    pub fn shard_lens(&self, arena: &Arena) -> Result<Vec<u64>> {
        (0..SHARD_COUNT)
            .map(|idx| -> Result<u64> { Ok(self.shard(arena, idx)?.len) })
            .collect()
    }
}

fn shard_offset(root: u64, idx: usize) -> u64 {
    root + (size_of::<Root>() + idx * size_of::<ShardHeader>()) as u64
}
