//! The KV pipeline (spec §4.E): `set`/`get`/`del` orchestration over the
//! hash index core and the segment log, plus the in-memory (`:memory:`)
//! mode where the record cache is the sole store. Grounded in
//! `cdb_core.c`'s `cdb_set`/`cdb_get`/`cdb_del` entry points, which this
//! module's `Engine` methods mirror one-for-one.

use std::path::Path;
use std::sync::Arc;

use crate::buckets::BucketLocks;
use crate::cache::{CacheCoordinator, RecordEntry};
use crate::config::{Options, SetFlags};
use crate::error::{Error, Result};
use crate::hash::key_hash64;
use crate::index::{IndexCore, MainTable, PageOp};
use crate::mainfile::{MainIndexFile, MainMetaFile, PersistedSegMeta};
use crate::record::Record;
use crate::segment::{FileMeta, SegKind, SegmentStore};
use crate::types::{bucket_of, VirtualOffset};

/// Sentinel path that selects the in-memory backend instead of a durable
/// directory, the same special-path idiom SQLite's `:memory:` uses.
pub const MEMORY_PATH: &str = ":memory:";

pub fn is_memory_path(path: &Path) -> bool {
    path == Path::new(MEMORY_PATH)
}

/// The assembled engine a session runs against: the hash index, the three
/// cache tiers, and (outside of in-memory mode) the segment log backing
/// them. One `Engine` per open database.
pub struct Engine {
    pub(crate) options: Options,
    pub(crate) main_table: MainTable,
    pub(crate) index: IndexCore,
    pub(crate) cache: CacheCoordinator,
    pub(crate) store: Option<SegmentStore>,
    pub(crate) locks: BucketLocks,
}

impl Engine {
    pub fn new_memory(options: Options) -> Self {
        let main_table = MainTable::new(options.hsize);
        let cache = CacheCoordinator::new(&options);
        let index = IndexCore::new(0);
        Self {
            options,
            main_table,
            index,
            cache,
            store: None,
            locks: BucketLocks::new(),
        }
    }

    pub fn new_with_store(
        options: Options,
        main_table: MainTable,
        index: IndexCore,
        store: SegmentStore,
    ) -> Self {
        let cache = CacheCoordinator::new(&options);
        Self {
            options,
            main_table,
            index,
            cache,
            store: Some(store),
            locks: BucketLocks::new(),
        }
    }

    pub fn is_memory(&self) -> bool {
        self.store.is_none()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn main_table(&self) -> &MainTable {
        &self.main_table
    }

    pub fn index(&self) -> &IndexCore {
        &self.index
    }

    pub fn cache(&self) -> &CacheCoordinator {
        &self.cache
    }

    pub fn store(&self) -> Option<&SegmentStore> {
        self.store.as_ref()
    }

    pub fn locks(&self) -> &BucketLocks {
        &self.locks
    }

    /// Inserts, overwrites, or conditionally writes `key`/`value` (spec
    /// §4.E `set`). `expire` is an absolute unix timestamp, `0` meaning no
    /// expiration. `now` is the caller's notion of the current time, passed
    /// in rather than read here so recovery and tests can hold it fixed.
    pub fn set(&self, key: &[u8], value: &[u8], flags: SetFlags, expire: u32, now: u32) -> Result<()> {
        if self.is_memory() {
            return self.set_memory(key, value, flags, expire, now);
        }
        let store = self.store.as_ref().expect("checked above");
        let hash = key_hash64(key);
        let bid = bucket_of(hash, self.main_table.hsize());
        let _guard = self.locks.lock(bid);

        let cached_before = self.cache.record_get(key).is_some();
        let prior = self.find_prior(store, key, hash, bid, now)?;
        if flags.contains(SetFlags::INSERT_IF_EXIST) && prior.is_none() {
            return Err(Error::NotFound);
        }
        if flags.contains(SetFlags::INSERT_IF_NOT_EXIST) && prior.is_some() {
            return Err(Error::Exist);
        }

        let oid = store.next_oid();
        let record = Record::new(key.to_vec(), value.to_vec(), expire, oid);
        let new_off = store.append_record(&record)?;

        if let Some(old_off) = prior {
            let old_len = self.record_len_at(store, old_off)?;
            store.mark_junk(SegKind::Data, old_off.fid(), old_len);
            self.index
                .cdb_replaceoff(&self.main_table, &self.cache, store, bid, hash, old_off, new_off)?;
        } else {
            self.index
                .cdb_updatepage(&self.main_table, &self.cache, store, bid, hash, new_off, PageOp::Insert)?;
        }
        self.cache.evict_overflow(&self.locks, store, &self.main_table)?;

        // A stale record-cache entry pointing at the superseded offset must
        // never survive a write, regardless of INSERT_CACHE: get() trusts
        // the record cache ahead of the index, so leaving it untouched
        // would serve the old value forever.
        if flags.contains(SetFlags::INSERT_CACHE) || cached_before {
            self.cache.record_insert(
                key.to_vec(),
                RecordEntry { value: value.to_vec(), expire, offset: new_off },
            );
        } else {
            self.cache.record_remove(key);
        }
        Ok(())
    }

    /// Reads the current value for `key` (spec §4.E `get`): record cache
    /// first, then mlock + `cdb_getoff` + per-candidate key comparison.
    pub fn get(&self, key: &[u8], now: u32) -> Result<Vec<u8>> {
        if self.is_memory() {
            return self.get_memory(key, now);
        }
        if let Some(entry) = self.cache.record_get(key) {
            if entry.expire != 0 && entry.expire <= now {
                return Err(Error::NotFound);
            }
            return Ok(entry.value);
        }
        let store = self.store.as_ref().expect("checked above");
        let hash = key_hash64(key);
        let bid = bucket_of(hash, self.main_table.hsize());
        let _guard = self.locks.lock(bid);

        let offs = self.index.cdb_getoff(&self.main_table, &self.cache, store, bid, hash)?;
        for off in offs.iter() {
            let rec = store.read_record(off, self.options.aread as usize, false)?;
            if rec.key != key {
                continue;
            }
            if rec.is_expired(now) {
                return Err(Error::NotFound);
            }
            self.cache.record_insert(
                key.to_vec(),
                RecordEntry { value: rec.value.clone(), expire: rec.expire, offset: off },
            );
            return Ok(rec.value);
        }
        Err(Error::NotFound)
    }

    /// Removes `key` (spec §4.E `del`): like `set`, but appends a
    /// deletion-log entry instead of a new record and removes the page
    /// item outright.
    pub fn del(&self, key: &[u8], now: u32) -> Result<()> {
        if self.is_memory() {
            return self.del_memory(key, now);
        }
        let store = self.store.as_ref().expect("checked above");
        let hash = key_hash64(key);
        let bid = bucket_of(hash, self.main_table.hsize());
        let _guard = self.locks.lock(bid);

        let Some(old_off) = self.find_prior(store, key, hash, bid, now)? else {
            return Err(Error::NotFound);
        };
        let old_len = self.record_len_at(store, old_off)?;
        store.append_dellog(old_off)?;
        store.mark_junk(SegKind::Data, old_off.fid(), old_len);
        self.index
            .cdb_updatepage(&self.main_table, &self.cache, store, bid, hash, old_off, PageOp::Delete)?;
        self.cache.record_remove(key);
        self.cache.evict_overflow(&self.locks, store, &self.main_table)?;
        Ok(())
    }

    /// Finds the current durable offset for `key`, if any: the record
    /// cache first, else a page-item scan with per-candidate key
    /// comparison, the same disambiguation `get` performs. Does not
    /// populate the record cache itself; callers that want to serve a
    /// value do that at their own call site.
    fn find_prior(
        &self,
        store: &SegmentStore,
        key: &[u8],
        hash: u64,
        bid: u32,
        now: u32,
    ) -> Result<Option<VirtualOffset>> {
        if let Some(entry) = self.cache.record_get(key) {
            if entry.expire != 0 && entry.expire <= now {
                return Ok(None);
            }
            return Ok(Some(entry.offset));
        }
        let offs = self.index.cdb_getoff(&self.main_table, &self.cache, store, bid, hash)?;
        for off in offs.iter() {
            let rec = store.read_record(off, self.options.aread as usize, true)?;
            if rec.key == key {
                if rec.is_expired(now) {
                    return Ok(None);
                }
                return Ok(Some(off));
            }
        }
        Ok(None)
    }

    fn record_len_at(&self, store: &SegmentStore, off: VirtualOffset) -> Result<u64> {
        let rec = store.read_record(off, self.options.aread as usize, false)?;
        Ok(rec.on_disk_len())
    }

    /// Rewrites `mainindex.cdb` and `mainmeta.cdb` with the engine's
    /// current state, under the given close signature (spec §6 "Open
    /// signature values"). Called at `close` and after a crash recovery
    /// rebuild, never on the hot path. A no-op in-memory mode, since there
    /// is nothing durable to checkpoint.
    ///
    /// Force-drains the dirty page cache tier first: entries there haven't
    /// reached the segment log or the main table yet, so snapshotting the
    /// table before the drain would silently lose every bucket whose last
    /// mutation only ever touched the dirty tier.
    pub fn persist_header(&self, dir: &Path, signature: u32) -> Result<()> {
        let Some(store) = &self.store else { return Ok(()) };
        self.cache.drain_dirty_blocking(&self.locks, store, &self.main_table)?;
        store.flush_all()?;
        let table = self.main_table.snapshot();
        MainIndexFile::write_all(
            dir,
            self.main_table.hsize(),
            store.peek_oid(),
            store.roid(),
            self.index.record_count(),
            signature,
            &table,
        )?;
        let index_segs: Vec<PersistedSegMeta> =
            store.index_segments_in_oid_order().iter().map(|m| persisted_from_meta(m)).collect();
        let data_segs: Vec<PersistedSegMeta> =
            store.data_segments_in_oid_order().iter().map(|m| persisted_from_meta(m)).collect();
        MainMetaFile::write(
            dir,
            0,
            0,
            0,
            0,
            store.index_writer_fid(),
            store.data_writer_fid(),
            &index_segs,
            &data_segs,
        )?;
        Ok(())
    }

    // ---- in-memory mode (spec §4.E, "special path" with no segments) ----

    fn set_memory(&self, key: &[u8], value: &[u8], flags: SetFlags, expire: u32, now: u32) -> Result<()> {
        let prior_live = self
            .cache
            .record_get(key)
            .map(|e| e.expire == 0 || e.expire > now)
            .unwrap_or(false);
        if flags.contains(SetFlags::INSERT_IF_EXIST) && !prior_live {
            return Err(Error::NotFound);
        }
        if flags.contains(SetFlags::INSERT_IF_NOT_EXIST) && prior_live {
            return Err(Error::Exist);
        }
        self.cache.record_insert(
            key.to_vec(),
            RecordEntry { value: value.to_vec(), expire, offset: VirtualOffset::NULL },
        );
        Ok(())
    }

    fn get_memory(&self, key: &[u8], now: u32) -> Result<Vec<u8>> {
        match self.cache.record_get(key) {
            Some(e) if e.expire == 0 || e.expire > now => Ok(e.value),
            _ => Err(Error::NotFound),
        }
    }

    fn del_memory(&self, key: &[u8], now: u32) -> Result<()> {
        match self.cache.record_get(key) {
            Some(e) if e.expire == 0 || e.expire > now => {
                self.cache.record_remove(key);
                Ok(())
            }
            _ => Err(Error::NotFound),
        }
    }
}

pub(crate) fn persisted_from_meta(m: &Arc<FileMeta>) -> PersistedSegMeta {
    PersistedSegMeta {
        fid: m.fid,
        file_size: m.file_size() as u32,
        junk_bytes: m.junk_bytes() as u32,
        first_oid: m.first_oid,
        last_oid: m.last_oid(),
        status: m.status(),
        kind: m.kind,
        nearest_expire: m.nearest_expire(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk_engine() -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::create(dir.path()).unwrap();
        let options = Options::default().with_hsize(4096);
        let main_table = MainTable::new(options.hsize);
        let index = IndexCore::new(0);
        (Engine::new_with_store(options, main_table, index, store), dir)
    }

    #[test]
    fn set_then_get_roundtrips() {
        let (engine, _dir) = disk_engine();
        engine.set(b"k1", b"v1", SetFlags::OVERWRITE, 0, 1000).unwrap();
        assert_eq!(engine.get(b"k1", 1000).unwrap(), b"v1");
    }

    #[test]
    fn get_missing_key_is_not_found() {
        let (engine, _dir) = disk_engine();
        assert!(matches!(engine.get(b"absent", 0).unwrap_err(), Error::NotFound));
    }

    #[test]
    fn overwrite_replaces_value_and_invalidates_stale_cache() {
        let (engine, _dir) = disk_engine();
        engine.set(b"k", b"v1", SetFlags::INSERT_CACHE, 0, 0).unwrap();
        engine.set(b"k", b"v2", SetFlags::OVERWRITE, 0, 0).unwrap();
        assert_eq!(engine.get(b"k", 0).unwrap(), b"v2");
    }

    #[test]
    fn insert_if_not_exist_rejects_existing_key() {
        let (engine, _dir) = disk_engine();
        engine.set(b"k", b"v1", SetFlags::OVERWRITE, 0, 0).unwrap();
        let err = engine.set(b"k", b"v2", SetFlags::INSERT_IF_NOT_EXIST, 0, 0).unwrap_err();
        assert!(matches!(err, Error::Exist));
    }

    #[test]
    fn insert_if_exist_rejects_missing_key() {
        let (engine, _dir) = disk_engine();
        let err = engine.set(b"k", b"v", SetFlags::INSERT_IF_EXIST, 0, 0).unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn del_then_get_is_not_found() {
        let (engine, _dir) = disk_engine();
        engine.set(b"k", b"v", SetFlags::OVERWRITE, 0, 0).unwrap();
        engine.del(b"k", 0).unwrap();
        assert!(matches!(engine.get(b"k", 0).unwrap_err(), Error::NotFound));
    }

    #[test]
    fn del_missing_key_is_not_found() {
        let (engine, _dir) = disk_engine();
        assert!(matches!(engine.del(b"absent", 0).unwrap_err(), Error::NotFound));
    }

    #[test]
    fn expired_record_reads_as_not_found() {
        let (engine, _dir) = disk_engine();
        engine.set(b"k", b"v", SetFlags::OVERWRITE, 100, 0).unwrap();
        assert_eq!(engine.get(b"k", 50).unwrap(), b"v");
        assert!(matches!(engine.get(b"k", 150).unwrap_err(), Error::NotFound));
    }

    #[test]
    fn memory_mode_roundtrips_without_a_store() {
        let engine = Engine::new_memory(Options::default().with_hsize(4096));
        assert!(engine.is_memory());
        engine.set(b"k", b"v", SetFlags::OVERWRITE, 0, 0).unwrap();
        assert_eq!(engine.get(b"k", 0).unwrap(), b"v");
        engine.del(b"k", 0).unwrap();
        assert!(matches!(engine.get(b"k", 0).unwrap_err(), Error::NotFound));
    }
}
