use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use proptest::prelude::*;
use shm_lock::Shm;

use crate::alloc::Failure;
use crate::arena::{Arena, FAIL_RESIZE, HEADER_SIZE};
use crate::cell::{CellRef, Value};
use crate::config::MINIMUM_SIZE;
use crate::error::Error;
use crate::grow;
use crate::table::ShardTable;

fn with_arena<R>(size: u64, f: impl FnOnce(&mut Arena) -> R) -> R {
    let dir = tempfile::tempdir().expect("to create a scratch directory");
    let path = dir.path().join("arena.map");
    let mut arena = Arena::create_or_open(&path, size, size * 64, &Shm::new(), |_| Ok(()))
        .expect("to create an arena");
    f(&mut arena)
}

/// Like `with_arena`, for tests that need to look at the file itself.
fn with_arena_file<R>(size: u64, max_size: u64, f: impl FnOnce(&Path, &mut Arena) -> R) -> R {
    let dir = tempfile::tempdir().expect("to create a scratch directory");
    let path = dir.path().join("arena.map");
    let mut arena = Arena::create_or_open(&path, size, max_size, &Shm::new(), |_| Ok(()))
        .expect("to create an arena");
    f(&path, &mut arena)
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).expect("to stat the arena").len()
}

/// The file opens again, so its header and length agree.
fn reopen(path: &Path) -> Arena {
    Arena::create_or_open(path, MINIMUM_SIZE, MINIMUM_SIZE * 64, &Shm::new(), |_| Ok(()))
        .expect("to reopen the arena")
}

fn with_table<R>(buckets: u64, f: impl FnOnce(&mut Arena, ShardTable) -> R) -> R {
    with_arena(MINIMUM_SIZE, |arena| {
        let table = ShardTable::construct(arena, buckets).expect("to construct a table");
        f(arena, table)
    })
}

/// What a session does: grow until the value fits.
fn set(arena: &mut Arena, table: ShardTable, key: &str, value: CellRef<'_>) {
    loop {
        match table.set(arena, key, value) {
            Ok(()) => return,
            Err(Failure::Exhausted { requested }) => {
                grow::grow_for(arena, requested).expect("to grow");
            }
            Err(Failure::Error(err)) => panic!("{err}"),
        }
    }
}

fn get(arena: &Arena, table: ShardTable, key: &str) -> Option<Value> {
    table
        .get_with(arena, key, |cell| cell.map(CellRef::to_value))
        .expect("to look up")
}

#[test]
fn freed_blocks_are_reused() {
    with_arena(MINIMUM_SIZE, |arena| {
        let a = arena.allocate(40).unwrap();
        let b = arena.allocate(40).unwrap();
        let c = arena.allocate(40).unwrap();
        assert!(a < b && b < c);
        assert_eq!(arena.allocated_len(b).unwrap(), 48);

        arena.deallocate(b).unwrap();
        assert_eq!(arena.allocate(33).unwrap(), b);
    });
}

#[test]
fn everything_coalesces_back() {
    with_arena(MINIMUM_SIZE, |arena| {
        let empty = arena.free_memory();
        assert_eq!(empty, MINIMUM_SIZE - HEADER_SIZE);

        let blocks: Vec<_> = (0..20).map(|len| arena.allocate(len * 7).unwrap()).collect();
        assert!(arena.free_memory() < empty);

        // Every other block first, so that merging on both sides is needed.
        for &block in blocks.iter().step_by(2) {
            arena.deallocate(block).unwrap();
        }
        for &block in blocks.iter().skip(1).step_by(2) {
            arena.deallocate(block).unwrap();
        }

        assert_eq!(arena.free_memory(), empty);
        assert_eq!(arena.allocate(8).unwrap(), HEADER_SIZE + 16);
    });
}

#[test]
fn exhaustion_reports_the_request() {
    with_arena(MINIMUM_SIZE, |arena| {
        match arena.allocate(MINIMUM_SIZE) {
            Err(Failure::Exhausted { requested }) => assert!(requested > MINIMUM_SIZE),
            other => panic!("expected exhaustion, got {other:?}"),
        }

        grow::grow_for(arena, MINIMUM_SIZE + 16).unwrap();
        assert!(arena.size() >= 3 * MINIMUM_SIZE);
        arena.allocate(MINIMUM_SIZE).unwrap();
    });
}

#[test]
fn growth_stops_at_the_maximum() {
    with_arena(MINIMUM_SIZE, |arena| {
        let max = arena.max_size();
        match grow::grow_for(arena, max) {
            Err(Error::Capacity { max: reported, .. }) => assert_eq!(reported, max),
            other => panic!("expected a capacity error, got {other:?}"),
        }

        assert_eq!(arena.size(), MINIMUM_SIZE);
        // Close to the limit only the rest is taken.
        grow::grow_for(arena, max / 2).unwrap();
        assert_eq!(arena.size(), max);
    });
}

#[test]
fn failed_growth_changes_nothing() {
    with_arena_file(MINIMUM_SIZE, MINIMUM_SIZE * 64, |path, arena| {
        let block = arena.allocate(100).unwrap();
        arena.write_bytes(block, b"kept").unwrap();

        FAIL_RESIZE.with(|fail| fail.set(true));
        let err = arena.grow(MINIMUM_SIZE).unwrap_err();
        FAIL_RESIZE.with(|fail| fail.set(false));
        assert!(matches!(err, Error::Io { .. }), "{err}");

        assert_eq!(arena.size(), MINIMUM_SIZE);
        assert_eq!(arena.mapped_len(), MINIMUM_SIZE);
        assert_eq!(file_len(path), MINIMUM_SIZE);
        assert_eq!(arena.bytes(block, 4).unwrap(), b"kept");
        assert_eq!(reopen(path).size(), MINIMUM_SIZE);

        // And growing works once the file can be resized again.
        let size = arena.grow(MINIMUM_SIZE).unwrap();
        assert_eq!(file_len(path), size);
        assert_eq!(reopen(path).size(), size);
    });
}

#[test]
fn unmappable_growth_changes_nothing() {
    with_arena_file(MINIMUM_SIZE, u64::MAX, |path, arena| {
        // More than any address space.
        let err = arena.grow(1 << 62).unwrap_err();
        assert!(matches!(err, Error::Io { .. }), "{err}");

        assert_eq!(arena.size(), MINIMUM_SIZE);
        assert_eq!(file_len(path), MINIMUM_SIZE);
        assert_eq!(reopen(path).size(), MINIMUM_SIZE);
    });
}

#[test]
fn failed_shrinking_changes_nothing() {
    let size = 4 * MINIMUM_SIZE;
    with_arena_file(size, size, |path, arena| {
        arena.allocate(100).unwrap();

        FAIL_RESIZE.with(|fail| fail.set(true));
        let err = arena.shrink_to_fit().unwrap_err();
        FAIL_RESIZE.with(|fail| fail.set(false));
        assert!(matches!(err, Error::Io { .. }), "{err}");

        assert_eq!(arena.size(), size);
        assert_eq!(file_len(path), size);
        assert_eq!(reopen(path).size(), size);

        arena.shrink_to_fit().unwrap();
        assert_eq!(arena.size(), MINIMUM_SIZE);
        assert_eq!(arena.mapped_len(), MINIMUM_SIZE);
        assert_eq!(file_len(path), MINIMUM_SIZE);
    });
}

#[test]
fn double_free_is_corruption() {
    with_arena(MINIMUM_SIZE, |arena| {
        let a = arena.allocate(16).unwrap();
        let _b = arena.allocate(16).unwrap();
        arena.deallocate(a).unwrap();
        assert!(matches!(arena.deallocate(a), Err(Error::Corrupt { .. })));
        assert!(matches!(arena.deallocate(3), Err(Error::Corrupt { .. })));
    });
}

#[test]
fn offsets_outside_the_mapping_are_corruption() {
    with_arena(MINIMUM_SIZE, |arena| {
        assert!(matches!(arena.load::<u64>(MINIMUM_SIZE), Err(Error::Corrupt { .. })));
        assert!(matches!(arena.load::<u64>(HEADER_SIZE + 1), Err(Error::Corrupt { .. })));
        assert!(matches!(arena.bytes(u64::MAX, 2), Err(Error::Corrupt { .. })));
    });
}

#[test]
fn named_objects_are_found_again() {
    with_arena(MINIMUM_SIZE, |arena| {
        assert_eq!(arena.find("properties").unwrap(), None);
        let table = ShardTable::construct(arena, 16).unwrap();
        let again = ShardTable::construct(arena, 16).unwrap();
        assert_eq!(format!("{table:?}"), format!("{again:?}"));
        assert!(arena.find("properties").unwrap().is_some());
        ShardTable::find(arena).unwrap();
    });
}

#[test]
fn missing_table_is_corruption() {
    with_arena(MINIMUM_SIZE, |arena| {
        assert!(matches!(ShardTable::find(arena), Err(Error::Corrupt { .. })));
    });
}

#[test]
fn values_change_kind() {
    with_table(64, |arena, table| {
        set(arena, table, "k", CellRef::String("x"));
        assert_eq!(get(arena, table, "k"), Some(Value::from("x")));

        set(arena, table, "k", CellRef::Number(3.5));
        assert_eq!(get(arena, table, "k"), Some(Value::from(3.5)));

        set(arena, table, "", CellRef::String(""));
        assert_eq!(get(arena, table, ""), Some(Value::from("")));
        assert_eq!(table.len(arena).unwrap(), 2);
    });
}

#[test]
fn replacing_frees_the_old_value() {
    with_table(64, |arena, table| {
        set(arena, table, "k", CellRef::String(&"x".repeat(500)));
        let before = arena.free_memory();

        set(arena, table, "k", CellRef::String(&"y".repeat(500)));
        assert_eq!(arena.free_memory(), before);

        set(arena, table, "k", CellRef::Number(1.0));
        assert!(arena.free_memory() > before);
    });
}

#[test]
fn shards_rehash_as_they_fill() {
    with_table(64, |arena, table| {
        let initial = table.bucket_count(arena).unwrap();
        assert_eq!(initial, 64);

        for idx in 0..2000u32 {
            set(arena, table, &format!("key-{idx}"), CellRef::Number(idx.into()));
        }

        assert_eq!(table.len(arena).unwrap(), 2000);
        assert!(table.bucket_count(arena).unwrap() > initial);
        assert!(table.load_factor(arena).unwrap() <= table.max_load_factor(arena).unwrap());
        assert!(arena.size() > MINIMUM_SIZE);

        for idx in 0..2000u32 {
            let value = get(arena, table, &format!("key-{idx}"));
            assert_eq!(value, Some(Value::Number(idx.into())));
        }

        let lens = table.shard_lens(arena).unwrap();
        assert_eq!(lens.iter().sum::<u64>(), 2000);
        assert!(lens.iter().all(|&len| len > 0));
    });
}

#[test]
fn deleting_absent_keys_is_fine() {
    with_table(64, |arena, table| {
        assert!(!table.delete(arena, "nothing").unwrap());
        set(arena, table, "k", CellRef::Number(1.0));
        assert!(table.delete(arena, "k").unwrap());
        assert!(!table.delete(arena, "k").unwrap());
        assert_eq!(get(arena, table, "k"), None);
    });
}

#[derive(Clone, Debug)]
enum AllocOp {
    Allocate(u64),
    Free(prop::sample::Index),
}

#[derive(Clone, Debug)]
enum TableOp {
    Set(u8, Value),
    Delete(u8),
}

fn alloc_ops() -> impl Strategy<Value = Vec<AllocOp>> {
    let op = prop_oneof![
        (0..200u64).prop_map(AllocOp::Allocate),
        any::<prop::sample::Index>().prop_map(AllocOp::Free),
    ];
    prop::collection::vec(op, 1..200)
}

fn table_ops() -> impl Strategy<Value = Vec<TableOp>> {
    let value = prop_oneof![
        any::<f64>().prop_map(Value::Number),
        "[a-z]{0,300}".prop_map(Value::String),
    ];
    let op = prop_oneof![
        3 => (0..24u8, value).prop_map(|(key, value)| TableOp::Set(key, value)),
        1 => (0..24u8).prop_map(TableOp::Delete),
    ];
    prop::collection::vec(op, 1..300)
}

proptest! {
    #[test]
    fn allocations_never_overlap(ops in alloc_ops()) {
        with_arena(MINIMUM_SIZE, |arena| {
            let empty = arena.free_memory();
            let mut live: Vec<(u64, u64, u8)> = vec![];

            for (tag, op) in ops.into_iter().enumerate() {
                let tag = tag as u8;
                match op {
                    AllocOp::Allocate(len) => match arena.allocate(len) {
                        Ok(offset) => {
                            arena.write_bytes(offset, &vec![tag; len as usize]).unwrap();
                            live.push((offset, len, tag));
                        }
                        Err(Failure::Exhausted { .. }) => {}
                        Err(Failure::Error(err)) => panic!("{err}"),
                    },
                    AllocOp::Free(idx) if !live.is_empty() => {
                        let (offset, len, tag) = live.swap_remove(idx.index(live.len()));
                        let bytes = arena.bytes(offset, len).unwrap();
                        assert!(bytes.iter().all(|&b| b == tag));
                        arena.deallocate(offset).unwrap();
                    }
                    AllocOp::Free(_) => {}
                }
            }

            for &(offset, len, tag) in &live {
                let bytes = arena.bytes(offset, len).unwrap();
                assert!(bytes.iter().all(|&b| b == tag));
            }

            for (offset, _, _) in live {
                arena.deallocate(offset).unwrap();
            }

            assert_eq!(arena.free_memory(), empty);
        });
    }

    #[test]
    fn table_matches_a_hash_map(ops in table_ops()) {
        with_table(64, |arena, table| {
            let mut model = HashMap::new();

            for op in ops {
                match op {
                    TableOp::Set(key, value) => {
                        let key = format!("key-{key}");
                        set(arena, table, &key, value.as_cell());
                        model.insert(key, value);
                    }
                    TableOp::Delete(key) => {
                        let key = format!("key-{key}");
                        let present = table.delete(arena, &key).unwrap();
                        assert_eq!(present, model.remove(&key).is_some());
                    }
                }
            }

            for (key, value) in &model {
                match (get(arena, table, key), value) {
                    // NaN is not equal to itself.
                    (Some(Value::Number(found)), Value::Number(expected)) => {
                        assert_eq!(found.to_bits(), expected.to_bits())
                    }
                    (found, expected) => assert_eq!(found.as_ref(), Some(expected)),
                }
            }

            let keys: BTreeSet<_> = table.keys(arena).unwrap().into_iter().collect();
            let expected: BTreeSet<_> = model.keys().cloned().collect();
            assert_eq!(keys, expected);
            assert_eq!(table.len(arena).unwrap(), model.len() as u64);
        });
    }
}
