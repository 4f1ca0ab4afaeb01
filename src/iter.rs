//! Iteration over every live record (spec §6, supplemented by the original
//! `cdb_iterate_new`/`cdb_iterate` pair): a cursor pins the data segments
//! present at creation time so compaction can't unlink one from under an
//! in-progress walk, then a single driving call streams records in oid
//! order, skipping anything expired or superseded since the cursor's
//! `start_oid`.

use std::sync::Arc;

use crate::error::Result;
use crate::hash::key_hash64;
use crate::kv::Engine;
use crate::record::Record;
use crate::segment::FileMeta;
use crate::types::{bucket_of, VirtualOffset};

/// A live iteration handle. Holding one bumps every pinned data segment's
/// `ref_count`, deferring its unlink until the cursor (and every clone of
/// it, since recovery/compaction only ever check `ref_count == 0`) is
/// dropped.
pub struct Cursor {
    segments: Vec<Arc<FileMeta>>,
    start_oid: u64,
}

impl Cursor {
    pub fn start_oid(&self) -> u64 {
        self.start_oid
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        for seg in &self.segments {
            seg.release_ref();
        }
    }
}

/// Opens a new iteration cursor starting at `start_oid` (`0` to see every
/// live record). In-memory databases have no segments to pin; the cursor
/// is simply empty and `iterate` falls back to a record-cache snapshot.
pub fn iterate_new(engine: &Engine, start_oid: u64) -> Cursor {
    let segments = engine.store().map(|s| s.data_segments_in_oid_order()).unwrap_or_default();
    for seg in &segments {
        seg.acquire_ref();
    }
    Cursor { segments, start_oid }
}

/// Walks every record visible to `cursor`, invoking `callback(key, value,
/// expire, oid)` for each live one: still reachable through the current
/// index (not superseded or deleted since the scan observed it on disk)
/// and not expired as of `now`. Returns the number of records the callback
/// saw. Stops early, without error, the first time `callback` returns
/// `false`.
pub fn iterate(
    engine: &Engine,
    cursor: &Cursor,
    now: u32,
    mut callback: impl FnMut(&[u8], &[u8], u32, u64) -> bool,
) -> Result<u64> {
    if engine.is_memory() {
        return iterate_memory(engine, now, callback);
    }
    let store = engine.store().expect("checked above");
    let mut seen = 0u64;
    for seg in &cursor.segments {
        let records = scan_segment_records(store, seg.fid)?;
        for (offset, record) in records {
            if record.oid < cursor.start_oid {
                continue;
            }
            if record.is_expired(now) {
                continue;
            }
            if !is_still_live(engine, offset, &record)? {
                continue;
            }
            seen += 1;
            if !callback(&record.key, &record.value, record.expire, record.oid) {
                return Ok(seen);
            }
        }
    }
    Ok(seen)
}

fn iterate_memory(
    engine: &Engine,
    now: u32,
    mut callback: impl FnMut(&[u8], &[u8], u32, u64) -> bool,
) -> Result<u64> {
    let mut seen = 0u64;
    for (key, entry) in engine.cache().record_snapshot() {
        if entry.expire != 0 && entry.expire <= now {
            continue;
        }
        seen += 1;
        if !callback(&key, &entry.value, entry.expire, 0) {
            break;
        }
    }
    Ok(seen)
}

/// A record is live iff the index still points at this exact offset for
/// its key's bucket: if it had been overwritten or deleted, the current
/// lookup would return a different offset (or none).
fn is_still_live(engine: &Engine, offset: VirtualOffset, record: &Record) -> Result<bool> {
    let hash = key_hash64(&record.key);
    let bid = bucket_of(hash, engine.main_table().hsize());
    let store = engine.store().expect("disk mode");
    let _guard = engine.locks().lock(bid);
    let offs = engine.index().cdb_getoff(engine.main_table(), engine.cache(), store, bid, hash)?;
    Ok(offs.iter().any(|o| o == offset))
}

fn scan_segment_records(store: &crate::segment::SegmentStore, fid: u32) -> Result<Vec<(VirtualOffset, Record)>> {
    crate::recovery::scan_data_segment(store.dir(), fid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Options, SetFlags};
    use crate::index::{IndexCore, MainTable};
    use crate::segment::SegmentStore;

    fn disk_engine() -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::create(dir.path()).unwrap();
        let options = Options::default().with_hsize(4096);
        let main_table = MainTable::new(options.hsize);
        let index = IndexCore::new(0);
        (Engine::new_with_store(options, main_table, index, store), dir)
    }

    #[test]
    fn iterate_sees_every_live_record() {
        let (engine, _dir) = disk_engine();
        for i in 0..10u32 {
            let key = format!("k{i}");
            engine.set(key.as_bytes(), b"v", SetFlags::OVERWRITE, 0, 0).unwrap();
        }
        engine.del(b"k3", 0).unwrap();
        let cursor = iterate_new(&engine, 0);
        let mut seen = Vec::new();
        let count = iterate(&engine, &cursor, 0, |key, _value, _expire, _oid| {
            seen.push(key.to_vec());
            true
        })
        .unwrap();
        assert_eq!(count, 9);
        assert!(!seen.contains(&b"k3".to_vec()));
    }

    #[test]
    fn iterate_skips_superseded_offsets() {
        let (engine, _dir) = disk_engine();
        engine.set(b"k", b"v1", SetFlags::OVERWRITE, 0, 0).unwrap();
        engine.set(b"k", b"v2", SetFlags::OVERWRITE, 0, 0).unwrap();
        let cursor = iterate_new(&engine, 0);
        let mut values = Vec::new();
        iterate(&engine, &cursor, 0, |_key, value, _expire, _oid| {
            values.push(value.to_vec());
            true
        })
        .unwrap();
        assert_eq!(values, vec![b"v2".to_vec()]);
    }

    #[test]
    fn iterate_stops_early_on_false() {
        let (engine, _dir) = disk_engine();
        for i in 0..5u32 {
            let key = format!("k{i}");
            engine.set(key.as_bytes(), b"v", SetFlags::OVERWRITE, 0, 0).unwrap();
        }
        let cursor = iterate_new(&engine, 0);
        let mut n = 0;
        iterate(&engine, &cursor, 0, |_, _, _, _| {
            n += 1;
            n < 2
        })
        .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn memory_mode_iterates_the_record_cache() {
        let engine = Engine::new_memory(Options::default().with_hsize(4096));
        engine.set(b"a", b"1", SetFlags::OVERWRITE, 0, 0).unwrap();
        engine.set(b"b", b"2", SetFlags::OVERWRITE, 0, 0).unwrap();
        let cursor = iterate_new(&engine, 0);
        let count = iterate(&engine, &cursor, 0, |_, _, _, _| true).unwrap();
        assert_eq!(count, 2);
    }
}
