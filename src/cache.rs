//! The three-tier cache hierarchy (spec §4.C/§4.D): a record cache, a clean
//! page cache, and an optional dirty page cache, each backed by
//! [`crate::lru::LruTable`], plus the bloom filter that gates page lookups.
//! Grounded in `cdb_core.c`'s `rcache`/`pcache`/`dpcache` trio and
//! `cdb_bloomfilter.c`'s placement ahead of the page read.
//!
//! A bucket id is resident in at most one of the clean/dirty tiers at a
//! time: [`CacheCoordinator::remove_page`] always checks both, and every
//! mutation either re-inserts into dirty or writes through and re-inserts
//! into clean, never both.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bloom::BloomFilter;
use crate::buckets::BucketLocks;
use crate::config::Options;
use crate::error::Result;
use crate::hash::{IdentityBuildHasher, Murmur1BuildHasher};
use crate::index::MainTable;
use crate::lru::LruTable;
use crate::page::Page;
use crate::segment::SegmentStore;
use crate::types::VirtualOffset;

/// A cached record value plus the durable offset it was read from, so a
/// later `del`/overwrite can find the old record to junk-account without a
/// second disk read.
#[derive(Debug, Clone)]
pub struct RecordEntry {
    pub value: Vec<u8>,
    pub expire: u32,
    pub offset: VirtualOffset,
}

fn bloom_key(bid: u32, hash: u64) -> [u8; 8] {
    (((bid as u64) << 24) | (hash & 0xFF_FFFF)).to_le_bytes()
}

/// Rough per-entry sizing the LRU tables charge against their configured
/// byte budgets; matches the `ht->size` bookkeeping style in
/// `cdb_hashtable.c` rather than a precise allocator accounting.
fn page_weight(page: &Page) -> usize {
    page.on_disk_len() as usize
}

fn record_weight(key_len: usize, entry: &RecordEntry) -> usize {
    key_len + entry.value.len()
}

pub struct CacheCoordinator {
    record: Mutex<LruTable<Vec<u8>, RecordEntry, Murmur1BuildHasher>>,
    clean: Mutex<LruTable<u32, Page, IdentityBuildHasher>>,
    dirty: Option<Mutex<LruTable<u32, Page, IdentityBuildHasher>>>,
    /// When each currently-dirty bucket id entered the dirty tier, so the
    /// periodic dirty-page-flush worker can tell how long its LRU tail has
    /// been sitting unflushed (spec §4.F "dirty for > 40 s").
    dirty_since: Mutex<HashMap<u32, Instant>>,
    bloom: Option<BloomFilter>,
    rcache_limit: usize,
    pcache_limit: usize,
    bloom_negatives: AtomicU64,
    page_disk_reads: AtomicU64,
}

impl CacheCoordinator {
    pub fn new(opts: &Options) -> Self {
        let bloom = opts.bloom_estimated_records.map(|n| {
            // 10 bits/record is the ratio `cdb_bloomfilter.c` was tuned
            // against for a ~1% false-positive rate at the default 16-seed
            // hash count.
            let size_bytes = (n.max(1) * 10 / 8).max(1024);
            BloomFilter::new(n, size_bytes)
        });
        Self {
            record: Mutex::new(LruTable::new(true)),
            clean: Mutex::new(LruTable::new(true)),
            dirty: opts.dirty_page_cache.then(|| Mutex::new(LruTable::new(true))),
            dirty_since: Mutex::new(HashMap::new()),
            bloom,
            rcache_limit: (opts.rcache_mb as usize) * 1024 * 1024,
            pcache_limit: (opts.pcache_mb as usize) * 1024 * 1024,
            bloom_negatives: AtomicU64::new(0),
            page_disk_reads: AtomicU64::new(0),
        }
    }

    pub fn has_dirty_tier(&self) -> bool {
        self.dirty.is_some()
    }

    // ---- bloom filter (spec §4.D page lookup order, step 1) ----

    pub fn bloom_might_contain(&self, bid: u32, hash: u64) -> bool {
        match &self.bloom {
            Some(bf) => {
                let present = bf.might_contain(&bloom_key(bid, hash));
                if !present {
                    self.bloom_negatives.fetch_add(1, Ordering::Relaxed);
                }
                present
            }
            None => true,
        }
    }

    pub fn bloom_set(&self, bid: u32, hash: u64) {
        if let Some(bf) = &self.bloom {
            bf.set(&bloom_key(bid, hash));
        }
    }

    pub fn bloom_negatives(&self) -> u64 {
        self.bloom_negatives.load(Ordering::Relaxed)
    }

    pub fn page_disk_reads(&self) -> u64 {
        self.page_disk_reads.load(Ordering::Relaxed)
    }

    // ---- page tiers ----

    /// Non-destructive lookup across clean then dirty, promoting whichever
    /// tier holds it. Does not consult disk; the caller falls back to the
    /// main table on a double miss.
    pub fn lookup_page(&self, bid: u32) -> Option<Page> {
        if let Some(p) = self.clean.lock().get(&bid, true) {
            return Some(p.clone());
        }
        if let Some(d) = &self.dirty {
            if let Some(p) = d.lock().get(&bid, true) {
                return Some(p.clone());
            }
        }
        None
    }

    pub fn note_page_disk_read(&self) {
        self.page_disk_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clean_insert(&self, page: Page) {
        let w = page_weight(&page);
        self.clean.lock().insert(page.bid, page, w);
    }

    fn dirty_insert(&self, page: Page) {
        if let Some(d) = &self.dirty {
            let w = page_weight(&page);
            let bid = page.bid;
            d.lock().insert(bid, page, w);
            self.dirty_since.lock().insert(bid, Instant::now());
        }
    }

    /// Destructive lookup used by a page mutation about to replace the
    /// entry: removes from whichever tier holds it, since the invariant is
    /// "resident in at most one tier".
    pub fn remove_page(&self, bid: u32) -> Option<Page> {
        if let Some(p) = self.clean.lock().remove(&bid) {
            return Some(p);
        }
        let got = self.dirty.as_ref().and_then(|d| d.lock().remove(&bid));
        if got.is_some() {
            self.dirty_since.lock().remove(&bid);
        }
        got
    }

    /// Places a mutated page per spec §4.D: into the dirty tier if
    /// configured, otherwise written straight through and placed in clean
    /// with the main table updated to the new durable location.
    pub fn place_mutated_page(
        &self,
        store: &SegmentStore,
        main_table: &MainTable,
        mut page: Page,
    ) -> Result<()> {
        if self.has_dirty_tier() {
            self.dirty_insert(page);
        } else {
            let on_disk = page.on_disk_len();
            let new_off = store.append_page(&page)?;
            main_table.set(page.bid, new_off);
            page.ooff = new_off;
            page.osize = on_disk as u32;
            self.clean_insert(page);
        }
        Ok(())
    }

    /// Evicts pages until both tiers fit their configured byte budget.
    /// Called inline after every `set`/`del` mutation (spec §4.D), so a
    /// busy database never grows either tier past `pcache_mb`. Clean
    /// entries are dropped outright (their durable copy already exists);
    /// dirty entries must be flushed to disk first, and the flush follows
    /// the try-lock-then-bail protocol from spec §4.D: the caller may
    /// already hold the mutating bucket's `mlock`, so the victim bucket's
    /// `mlock` is acquired non-blockingly to avoid inverting the documented
    /// `mlock -> dpclock` lock order (and to avoid self-deadlock when the
    /// victim happens to share the caller's lock group). Failing to
    /// acquire it just stops the eviction pass early; the next mutation's
    /// call retries.
    pub fn evict_overflow(&self, locks: &BucketLocks, store: &SegmentStore, main_table: &MainTable) -> Result<()> {
        loop {
            let total = self.clean.lock().mem_bytes() + self.dirty_mem_bytes();
            if total <= self.pcache_limit {
                break;
            }
            if self.clean.lock().pop_tail().is_some() {
                continue;
            }
            match self.try_flush_dirty_tail(locks, store, main_table)? {
                Some(_) => continue,
                None => break,
            }
        }
        Ok(())
    }

    /// How long the dirty tier's current LRU tail has sat unflushed, used
    /// by the periodic dirty-page-flush worker's "dirty for > 40 s" test.
    /// `None` if the dirty tier is empty or disabled.
    pub fn dirty_tail_age(&self) -> Option<Duration> {
        let dirty = self.dirty.as_ref()?;
        let bid = *dirty.lock().peek_tail()?;
        let since = *self.dirty_since.lock().get(&bid)?;
        Some(since.elapsed())
    }

    /// Flushes exactly the dirty tier's current LRU tail to disk, following
    /// the try-lock-then-bail protocol (the caller already holds the dirty
    /// tier's mutex transitively via this call, so the per-bucket `mlock`
    /// is acquired non-blockingly). Returns the bucket id flushed, or
    /// `None` if the dirty tier was empty or the bucket's lock was busy.
    pub fn try_flush_dirty_tail(
        &self,
        locks: &BucketLocks,
        store: &SegmentStore,
        main_table: &MainTable,
    ) -> Result<Option<u32>> {
        let Some(dirty) = &self.dirty else { return Ok(None) };
        let bid = {
            let g = dirty.lock();
            match g.peek_tail() {
                Some(&bid) => bid,
                None => return Ok(None),
            }
        };
        let Some(_guard) = locks.try_lock(bid) else { return Ok(None) };
        if self.flush_dirty_entry(dirty, bid, store, main_table)? {
            Ok(Some(bid))
        } else {
            Ok(None)
        }
    }

    /// Force-drains every entry in the dirty tier to disk, blocking on each
    /// bucket's `mlock` rather than bailing on contention. Used only at
    /// `persist_header` time (close, or a rebuild's post-recovery
    /// checkpoint): there is no concurrent writer left to invert lock order
    /// against, so the try-lock protocol `try_flush_dirty_tail` needs for
    /// the live eviction path isn't necessary here, and a full drain is
    /// required so the persisted main table reflects every write that only
    /// ever reached the dirty tier (spec §4.G "close flushes all dirty
    /// pages").
    pub fn drain_dirty_blocking(&self, locks: &BucketLocks, store: &SegmentStore, main_table: &MainTable) -> Result<()> {
        let Some(dirty) = &self.dirty else { return Ok(()) };
        loop {
            let bid = {
                let g = dirty.lock();
                match g.peek_tail() {
                    Some(&bid) => bid,
                    None => break,
                }
            };
            let _guard = locks.lock(bid);
            self.flush_dirty_entry(dirty, bid, store, main_table)?;
        }
        Ok(())
    }

    /// Removes `bid` from the dirty tier (if still present) and appends it
    /// to the segment log, updating the main table. Returns whether there
    /// was anything to flush. The caller is responsible for holding `bid`'s
    /// `mlock` before calling this.
    fn flush_dirty_entry(
        &self,
        dirty: &Mutex<LruTable<u32, Page, IdentityBuildHasher>>,
        bid: u32,
        store: &SegmentStore,
        main_table: &MainTable,
    ) -> Result<bool> {
        let entry = dirty.lock().remove(&bid);
        self.dirty_since.lock().remove(&bid);
        match entry {
            Some(page) => {
                let new_off = store.append_page(&page)?;
                main_table.set(bid, new_off);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn dirty_mem_bytes(&self) -> usize {
        self.dirty.as_ref().map(|d| d.lock().mem_bytes()).unwrap_or(0)
    }

    // ---- record cache (spec §4.C) ----

    pub fn record_get(&self, key: &[u8]) -> Option<RecordEntry> {
        self.record.lock().get(&key.to_vec(), true).cloned()
    }

    pub fn record_insert(&self, key: Vec<u8>, entry: RecordEntry) {
        let w = record_weight(key.len(), &entry);
        {
            let mut g = self.record.lock();
            g.insert(key, entry, w);
            while g.mem_bytes() > self.rcache_limit {
                if g.pop_tail().is_none() {
                    break;
                }
            }
        }
    }

    pub fn record_remove(&self, key: &[u8]) {
        self.record.lock().remove(&key.to_vec());
    }

    /// A point-in-time copy of every resident record entry, used by
    /// in-memory-mode iteration (there's no segment log to scan) and by
    /// `stat`'s cached-record count.
    pub fn record_snapshot(&self) -> Vec<(Vec<u8>, RecordEntry)> {
        self.record.lock().snapshot_entries()
    }

    pub fn record_len(&self) -> usize {
        self.record.lock().len()
    }

    pub fn clean_len(&self) -> usize {
        self.clean.lock().len()
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.as_ref().map(|d| d.lock().len()).unwrap_or(0)
    }

    pub fn record_hits(&self) -> u64 {
        self.record.lock().hits
    }

    pub fn record_misses(&self) -> u64 {
        self.record.lock().misses
    }

    pub fn clean_hits(&self) -> u64 {
        self.clean.lock().hits
    }

    pub fn clean_misses(&self) -> u64 {
        self.clean.lock().misses
    }

    pub fn clear(&self) {
        self.record.lock().clear();
        self.clean.lock().clear();
        if let Some(d) = &self.dirty {
            d.lock().clear();
        }
        self.dirty_since.lock().clear();
        if let Some(bf) = &self.bloom {
            bf.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageItem;
    use crate::types::PackedHash;

    fn opts() -> Options {
        Options::default().with_cache_mb(1, 1)
    }

    #[test]
    fn clean_insert_then_lookup_promotes() {
        let c = CacheCoordinator::new(&opts());
        let page = Page::new_empty(3, 1);
        c.clean_insert(page);
        assert!(c.lookup_page(3).is_some());
        assert_eq!(c.clean_hits(), 1);
    }

    #[test]
    fn remove_page_checks_both_tiers() {
        let mut o = opts();
        o.dirty_page_cache = true;
        let c = CacheCoordinator::new(&o);
        let page = Page::new_empty(5, 1);
        c.dirty_insert(page);
        assert!(c.remove_page(5).is_some());
        assert!(c.remove_page(5).is_none());
    }

    #[test]
    fn bloom_negative_short_circuits() {
        let o = opts().with_bloom(1000);
        let c = CacheCoordinator::new(&o);
        assert!(!c.bloom_might_contain(1, 999));
        assert_eq!(c.bloom_negatives(), 1);
        c.bloom_set(1, 999);
        assert!(c.bloom_might_contain(1, 999));
    }

    #[test]
    fn record_cache_roundtrip() {
        let c = CacheCoordinator::new(&opts());
        c.record_insert(
            b"k".to_vec(),
            RecordEntry { value: b"v".to_vec(), expire: 0, offset: VirtualOffset::new(1, 16) },
        );
        let got = c.record_get(b"k").unwrap();
        assert_eq!(got.value, b"v");
    }

    #[test]
    fn eviction_flushes_dirty_tail_with_try_lock_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::create(dir.path()).unwrap();
        let main_table = MainTable::new(4096);
        let mut o = opts();
        o.pcache_mb = 0;
        let c = CacheCoordinator::new(&o);
        let mut page = Page::new_empty(9, store.next_oid());
        page.insert(PageItem { hash: PackedHash::from_hash64(1), offset: VirtualOffset::new(1, 16) });
        c.place_mutated_page(&store, &main_table, page).unwrap();

        let locks = BucketLocks::new();
        c.evict_overflow(&locks, &store, &main_table).unwrap();
        assert!(!main_table.get(9).is_null());
    }

    #[test]
    fn drain_dirty_blocking_empties_the_tier_and_updates_the_main_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::create(dir.path()).unwrap();
        let main_table = MainTable::new(4096);
        let mut o = opts();
        o.dirty_page_cache = true;
        let c = CacheCoordinator::new(&o);

        for bid in [3u32, 9u32] {
            let mut page = Page::new_empty(bid, store.next_oid());
            page.insert(PageItem { hash: PackedHash::from_hash64(bid as u64), offset: VirtualOffset::new(1, 16) });
            c.place_mutated_page(&store, &main_table, page).unwrap();
        }
        assert_eq!(c.dirty_len(), 2);
        assert!(main_table.get(3).is_null());

        let locks = BucketLocks::new();
        c.drain_dirty_blocking(&locks, &store, &main_table).unwrap();

        assert_eq!(c.dirty_len(), 0);
        assert!(!main_table.get(3).is_null());
        assert!(!main_table.get(9).is_null());
    }
}
