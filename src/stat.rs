//! Runtime statistics (spec §6, supplemented per `CDBSTAT` in `cuttdb.h`):
//! record count, cache occupancy and hit/miss counters, bloom filter
//! shortcuts, and a running average of read/write latency. `errno`/`errmsg`
//! are dropped in favor of `Result`; see `Error::legacy_code` for the
//! historical numeric code space.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::kv::Engine;

/// A point-in-time snapshot of engine counters, mirroring `CDBSTAT`'s
/// fields one-for-one where a counterpart exists.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub record_count: u64,
    pub cached_records: u64,
    pub cached_clean_pages: u64,
    pub cached_dirty_pages: u64,
    pub record_cache_hits: u64,
    pub record_cache_misses: u64,
    pub page_cache_hits: u64,
    pub page_cache_misses: u64,
    pub bloom_negatives: u64,
    pub page_disk_reads: u64,
    pub avg_read_latency: Duration,
    pub avg_write_latency: Duration,
}

pub fn stat(engine: &Engine, latency: &LatencyTracker) -> Stats {
    Stats {
        record_count: engine.index().record_count(),
        cached_records: engine.cache().record_len() as u64,
        cached_clean_pages: engine.cache().clean_len() as u64,
        cached_dirty_pages: engine.cache().dirty_len() as u64,
        record_cache_hits: engine.cache().record_hits(),
        record_cache_misses: engine.cache().record_misses(),
        page_cache_hits: engine.cache().clean_hits(),
        page_cache_misses: engine.cache().clean_misses(),
        bloom_negatives: engine.cache().bloom_negatives(),
        page_disk_reads: engine.cache().page_disk_reads(),
        avg_read_latency: latency.read_avg(),
        avg_write_latency: latency.write_avg(),
    }
}

/// Exponential moving average of `set`/`get` latency in nanoseconds,
/// substituting for the original's last-N-sample ring buffer (no sample
/// count is pinned by the spec, so a fixed-weight EMA is the simplest
/// implementation that still smooths out single-call spikes). Weight
/// `1/8` mirrors the classic TCP RTT estimator's smoothing factor, a
/// reasonable default absent a specified one.
pub struct LatencyTracker {
    read_avg_nanos: AtomicU64,
    write_avg_nanos: AtomicU64,
}

const EMA_WEIGHT_SHIFT: u32 = 3; // 1/8

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            read_avg_nanos: AtomicU64::new(0),
            write_avg_nanos: AtomicU64::new(0),
        }
    }

    pub fn observe_read(&self, elapsed: Duration) {
        Self::fold(&self.read_avg_nanos, elapsed);
    }

    pub fn observe_write(&self, elapsed: Duration) {
        Self::fold(&self.write_avg_nanos, elapsed);
    }

    pub fn read_avg(&self) -> Duration {
        Duration::from_nanos(self.read_avg_nanos.load(Ordering::Relaxed))
    }

    pub fn write_avg(&self) -> Duration {
        Duration::from_nanos(self.write_avg_nanos.load(Ordering::Relaxed))
    }

    fn fold(slot: &AtomicU64, elapsed: Duration) {
        let sample = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        let _ = slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            if cur == 0 {
                Some(sample)
            } else {
                Some(cur - (cur >> EMA_WEIGHT_SHIFT) + (sample >> EMA_WEIGHT_SHIFT))
            }
        });
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
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
    fn stat_reflects_record_count_and_cache_occupancy() {
        let (engine, _dir) = disk_engine();
        engine.set(b"a", b"1", SetFlags::OVERWRITE, 0, 0).unwrap();
        engine.set(b"b", b"2", SetFlags::INSERT_CACHE, 0, 0).unwrap();
        let latency = LatencyTracker::new();
        let s = stat(&engine, &latency);
        assert_eq!(s.record_count, 2);
        assert!(s.cached_records >= 1);
    }

    #[test]
    fn latency_tracker_converges_toward_constant_samples() {
        let t = LatencyTracker::new();
        for _ in 0..50 {
            t.observe_read(Duration::from_micros(100));
        }
        let avg = t.read_avg();
        assert!(avg.as_micros() >= 90 && avg.as_micros() <= 110, "avg={avg:?}");
    }

    #[test]
    fn fresh_tracker_reports_zero() {
        let t = LatencyTracker::new();
        assert_eq!(t.read_avg(), Duration::ZERO);
        assert_eq!(t.write_avg(), Duration::ZERO);
    }
}
