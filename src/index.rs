//! The hash index core (spec §4.B): the fixed main bucket table and the
//! `cdb_getoff`/`cdb_updatepage`/`cdb_replaceoff` operations that read and
//! mutate the on-disk index pages those buckets point at. Grounded in
//! `cdb_core.c`'s bucket-table walk and `cdb_hashtable.c`'s page
//! copy-on-grow.
//!
//! Every mutation here is called with the caller already holding the
//! bucket's `mlock` group (spec §5); `IndexCore` itself does no locking
//! beyond what `CacheCoordinator`'s internal mutexes provide.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::CacheCoordinator;
use crate::error::Result;
use crate::page::{Page, PageItem};
use crate::segment::{SegKind, SegmentStore};
use crate::types::{bucket_of, PackedHash, VirtualOffset};

/// The fixed-size array of bucket -> index-page virtual offsets (spec §3
/// "Main bucket table"). One slot per bucket, `hsize` long, persisted
/// wholesale in `mainindex.cdb`.
pub struct MainTable {
    slots: Vec<AtomicU64>,
}

impl MainTable {
    pub fn new(hsize: u32) -> Self {
        Self {
            slots: (0..hsize).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn from_raw(raw: Vec<u64>) -> Self {
        Self {
            slots: raw.into_iter().map(AtomicU64::new).collect(),
        }
    }

    pub fn hsize(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn get(&self, bid: u32) -> VirtualOffset {
        VirtualOffset::from_raw(self.slots[bid as usize].load(Ordering::Acquire))
    }

    pub fn set(&self, bid: u32, off: VirtualOffset) {
        self.slots[bid as usize].store(off.raw(), Ordering::Release);
    }

    /// A point-in-time copy for persistence (close/periodic flush).
    pub fn snapshot(&self) -> Vec<VirtualOffset> {
        self.slots
            .iter()
            .map(|s| VirtualOffset::from_raw(s.load(Ordering::Acquire)))
            .collect()
    }
}

/// A small inline buffer of candidate offsets for one `cdb_getoff` call,
/// spilling to the heap only past [`INLINE_CAP`] 24-bit-hash collisions in
/// the same bucket (spec §4.B: "a small inline array of up to 8 offsets;
/// overflow allocates a larger array").
const INLINE_CAP: usize = 8;

#[derive(Debug, Default)]
pub struct OffsetList {
    inline: [VirtualOffset; INLINE_CAP],
    inline_len: usize,
    overflow: Vec<VirtualOffset>,
}

impl OffsetList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, off: VirtualOffset) {
        if self.inline_len < INLINE_CAP {
            self.inline[self.inline_len] = off;
            self.inline_len += 1;
        } else {
            self.overflow.push(off);
        }
    }

    pub fn len(&self) -> usize {
        self.inline_len + self.overflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = VirtualOffset> + '_ {
        self.inline[..self.inline_len].iter().copied().chain(self.overflow.iter().copied())
    }
}

impl FromIterator<VirtualOffset> for OffsetList {
    fn from_iter<I: IntoIterator<Item = VirtualOffset>>(iter: I) -> Self {
        let mut list = Self::new();
        for off in iter {
            list.push(off);
        }
        list
    }
}

/// What a page mutation is doing, determining the copy-on-grow and
/// record-count bookkeeping around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOp {
    Insert,
    Delete,
}

pub struct IndexCore {
    record_count: AtomicU64,
}

impl IndexCore {
    pub fn new(initial_count: u64) -> Self {
        Self {
            record_count: AtomicU64::new(initial_count),
        }
    }

    pub fn record_count(&self) -> u64 {
        self.record_count.load(Ordering::Acquire)
    }

    /// Directly adjusts the record count, bypassing the normal
    /// insert/delete bookkeeping. Used only by recovery's index-page scan
    /// (spec §4.G step 5), which reconstructs the count by walking pages
    /// rather than replaying individual mutations.
    pub fn adjust_record_count(&self, delta: i64) {
        if delta >= 0 {
            self.record_count.fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            self.record_count.fetch_sub((-delta) as u64, Ordering::AcqRel);
        }
    }

    pub fn bucket_of(&self, hash: u64, hsize: u32) -> u32 {
        bucket_of(hash, hsize)
    }

    /// Looks up every offset recorded for `hash`'s packed value in its
    /// bucket, following the lookup order from spec §4.D: bloom filter,
    /// then clean/dirty cache, then the main table and a disk read on a
    /// double miss (populating the clean tier).
    pub fn cdb_getoff(
        &self,
        main_table: &MainTable,
        cache: &CacheCoordinator,
        store: &SegmentStore,
        bid: u32,
        hash: u64,
    ) -> Result<OffsetList> {
        if !cache.bloom_might_contain(bid, hash) {
            return Ok(OffsetList::new());
        }
        let page = match cache.lookup_page(bid) {
            Some(p) => Some(p),
            None => {
                let off = main_table.get(bid);
                if off.is_null() {
                    None
                } else {
                    cache.note_page_disk_read();
                    let p = store.read_page(off)?;
                    cache.clean_insert(p.clone());
                    Some(p)
                }
            }
        };
        match page {
            Some(p) => Ok(p.offsets_for(PackedHash::from_hash64(hash)).into_iter().collect()),
            None => Ok(OffsetList::new()),
        }
    }

    /// Inserts or removes one `(hash, offset)` item from `bid`'s page,
    /// growing the page (copy-on-grow, +4 capacity) on a full insert, and
    /// placing the mutated page per `cache.place_mutated_page` (spec §4.D).
    /// Adjusts the global record count on a real change.
    pub fn cdb_updatepage(
        &self,
        main_table: &MainTable,
        cache: &CacheCoordinator,
        store: &SegmentStore,
        bid: u32,
        hash: u64,
        offset: VirtualOffset,
        op: PageOp,
    ) -> Result<bool> {
        let packed = PackedHash::from_hash64(hash);
        let mut page = self.load_page_for_mutation(main_table, cache, store, bid)?;
        let changed = match op {
            PageOp::Insert => {
                if page.is_full() {
                    page = page.grown(store.next_oid());
                }
                let changed = page.insert(PageItem { hash: packed, offset });
                if changed {
                    cache.bloom_set(bid, hash);
                }
                changed
            }
            PageOp::Delete => page.remove(packed, offset),
        };
        if !changed {
            return Ok(false);
        }
        self.finish_mutation(main_table, cache, store, page)?;
        match op {
            PageOp::Insert => {
                self.record_count.fetch_add(1, Ordering::AcqRel);
            }
            PageOp::Delete => {
                self.record_count.fetch_sub(1, Ordering::AcqRel);
            }
        }
        Ok(true)
    }

    /// Rewrites an existing item's offset in place, used when a record is
    /// overwritten at a fresh log position but its page slot already
    /// exists (spec §4.B "in-place offset replace" path, avoiding an
    /// insert+delete pair).
    pub fn cdb_replaceoff(
        &self,
        main_table: &MainTable,
        cache: &CacheCoordinator,
        store: &SegmentStore,
        bid: u32,
        hash: u64,
        old_offset: VirtualOffset,
        new_offset: VirtualOffset,
    ) -> Result<bool> {
        let packed = PackedHash::from_hash64(hash);
        let mut page = self.load_page_for_mutation(main_table, cache, store, bid)?;
        let changed = page.replace_offset(packed, old_offset, new_offset);
        if !changed {
            return Ok(false);
        }
        self.finish_mutation(main_table, cache, store, page)?;
        Ok(true)
    }

    fn load_page_for_mutation(
        &self,
        main_table: &MainTable,
        cache: &CacheCoordinator,
        store: &SegmentStore,
        bid: u32,
    ) -> Result<Page> {
        if let Some(page) = cache.remove_page(bid) {
            return Ok(page);
        }
        let off = main_table.get(bid);
        if off.is_null() {
            Ok(Page::new_empty(bid, store.next_oid()))
        } else {
            cache.note_page_disk_read();
            store.read_page(off)
        }
    }

    fn finish_mutation(
        &self,
        main_table: &MainTable,
        cache: &CacheCoordinator,
        store: &SegmentStore,
        mut page: Page,
    ) -> Result<()> {
        let old_ooff = page.ooff;
        let old_osize = page.osize as u64;
        page.oid = store.next_oid();
        if !old_ooff.is_null() {
            store.mark_junk(SegKind::Index, old_ooff.fid(), old_osize);
        }
        cache.place_mutated_page(store, main_table, page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (MainTable, CacheCoordinator, SegmentStore, IndexCore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::create(dir.path()).unwrap();
        let main_table = MainTable::new(4096);
        let opts = crate::config::Options::default();
        let cache = CacheCoordinator::new(&opts);
        let core = IndexCore::new(0);
        (main_table, cache, store, core, dir)
    }

    #[test]
    fn insert_then_getoff_finds_it_direct_write_path() {
        let (mt, cache, store, core, _dir) = setup();
        let hash = 0xABCDEFu64;
        let bid = core.bucket_of(hash, mt.hsize());
        let off = VirtualOffset::new(1, 16);
        let changed = core
            .cdb_updatepage(&mt, &cache, &store, bid, hash, off, PageOp::Insert)
            .unwrap();
        assert!(changed);
        assert_eq!(core.record_count(), 1);

        let offs = core.cdb_getoff(&mt, &cache, &store, bid, hash).unwrap();
        assert_eq!(offs.len(), 1);
        assert_eq!(offs.iter().next().unwrap(), off);
    }

    #[test]
    fn delete_removes_and_decrements_count() {
        let (mt, cache, store, core, _dir) = setup();
        let hash = 42u64;
        let bid = core.bucket_of(hash, mt.hsize());
        let off = VirtualOffset::new(1, 16);
        core.cdb_updatepage(&mt, &cache, &store, bid, hash, off, PageOp::Insert)
            .unwrap();
        let deleted = core
            .cdb_updatepage(&mt, &cache, &store, bid, hash, off, PageOp::Delete)
            .unwrap();
        assert!(deleted);
        assert_eq!(core.record_count(), 0);
        let offs = core.cdb_getoff(&mt, &cache, &store, bid, hash).unwrap();
        assert!(offs.is_empty());
    }

    #[test]
    fn replace_offset_keeps_count_unchanged() {
        let (mt, cache, store, core, _dir) = setup();
        let hash = 7u64;
        let bid = core.bucket_of(hash, mt.hsize());
        let old_off = VirtualOffset::new(1, 16);
        let new_off = VirtualOffset::new(1, 32);
        core.cdb_updatepage(&mt, &cache, &store, bid, hash, old_off, PageOp::Insert)
            .unwrap();
        let replaced = core
            .cdb_replaceoff(&mt, &cache, &store, bid, hash, old_off, new_off)
            .unwrap();
        assert!(replaced);
        assert_eq!(core.record_count(), 1);
        let offs = core.cdb_getoff(&mt, &cache, &store, bid, hash).unwrap();
        assert_eq!(offs.iter().next().unwrap(), new_off);
    }

    #[test]
    fn page_grows_past_initial_capacity() {
        let (mt, cache, store, core, _dir) = setup();
        // force all of these into the same bucket by using hash values
        // that only differ above the bucket-selecting bits.
        let bid = 0u32;
        for i in 0..10u64 {
            let hash = i << 24;
            let off = VirtualOffset::new(1, 16 * (i + 1));
            core.cdb_updatepage(&mt, &cache, &store, bid, hash, off, PageOp::Insert)
                .unwrap();
        }
        assert_eq!(core.record_count(), 10);
    }

    #[test]
    fn offset_list_spills_past_inline_capacity() {
        let mut list = OffsetList::new();
        for i in 0..20u64 {
            list.push(VirtualOffset::new(1, 16 * (i + 1)));
        }
        assert_eq!(list.len(), 20);
        assert_eq!(list.iter().count(), 20);
    }
}
