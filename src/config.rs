//! Knobs mirroring `cdb_option`/`cdb_option_bloom`/`cdb_option_aread` and the
//! open-mode flags from spec §6.

bitflags::bitflags! {
    /// Mode flags passed to `open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Create the database directory if it doesn't exist.
        const CREAT = 0x1;
        /// Wipe an existing database before opening.
        const TRUNC = 0x2;
        /// Warm the clean page cache from disk right after recovery.
        const PAGEWARMUP = 0x4;
    }
}

bitflags::bitflags! {
    /// Per-call flags for `set`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SetFlags: u32 {
        /// Always replace, whether or not a prior record exists (default).
        const OVERWRITE = 0x0;
        /// Fail unless a prior (non-expired) record exists.
        const INSERT_IF_EXIST = 0x1;
        /// Fail if a prior (non-expired) record exists.
        const INSERT_IF_NOT_EXIST = 0x2;
        /// Place/refresh the record cache entry on success.
        const INSERT_CACHE = 0x8;
    }
}

const MIN_HSIZE: u32 = 4096;
const MIN_AREAD: u32 = 1024;
const MAX_AREAD: u32 = 64 * 1024 - 64;

pub const DEFAULT_HSIZE: u32 = 1_000_000;
pub const DEFAULT_RCACHE_MB: u32 = 128;
pub const DEFAULT_PCACHE_MB: u32 = 1024;
pub const DEFAULT_AREAD: u32 = 4 * 1024;

pub const INDEX_SEGMENT_CAP: u64 = 16 * 1024 * 1024;
pub const DATA_SEGMENT_CAP: u64 = 128 * 1024 * 1024;
pub const SEGMENT_LOW_WATER: u64 = 16 * 1024;
pub const DATA_BUF_CAP: usize = 2 * 1024 * 1024;
pub const INDEX_BUF_CAP: usize = 2 * 1024 * 1024;
pub const DELLOG_BUF_ENTRIES: usize = 10_000;
pub const FD_CACHE_CAP: usize = 16_384;
pub const PAGE_AREAD: usize = 3 * 1024;
pub const STACK_BUF_SIZE: usize = 64 * 1024;
pub const DPAGE_TIMEOUT_SECS: u64 = 40;
pub const MLOCK_NUM: usize = 256;

/// Options gathering everything `cdb_option*` configures. `hsize` is
/// immutable once the database is created (spec §3, Main bucket table).
#[derive(Debug, Clone)]
pub struct Options {
    pub hsize: u32,
    pub rcache_mb: u32,
    pub pcache_mb: u32,
    pub bloom_estimated_records: Option<u64>,
    pub aread: u32,
    /// `dpcache` is absent when this is `false`; page mutations then write
    /// straight through the segment log (spec §4.D mutation order).
    pub dirty_page_cache: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            hsize: DEFAULT_HSIZE,
            rcache_mb: DEFAULT_RCACHE_MB,
            pcache_mb: DEFAULT_PCACHE_MB,
            bloom_estimated_records: None,
            aread: DEFAULT_AREAD,
            dirty_page_cache: true,
        }
    }
}

impl Options {
    /// Clamps `hsize` to the documented minimum (spec §8 Boundary behaviors).
    pub fn with_hsize(mut self, hsize: u32) -> Self {
        self.hsize = hsize.max(MIN_HSIZE);
        self
    }

    pub fn with_cache_mb(mut self, rcache_mb: u32, pcache_mb: u32) -> Self {
        self.rcache_mb = rcache_mb;
        self.pcache_mb = pcache_mb;
        self
    }

    pub fn with_bloom(mut self, estimated_records: u64) -> Self {
        self.bloom_estimated_records = Some(estimated_records);
        self
    }

    /// Clamps `aread` into `[1 KiB, 64 KiB - delta]` (spec §8).
    pub fn with_aread(mut self, bytes: u32) -> Self {
        self.aread = bytes.clamp(MIN_AREAD, MAX_AREAD);
        self
    }
}
