//! Per-segment metadata bookkeeping: sizes, junk accounting, and the
//! reference counting that keeps a segment alive under an active iterator.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use super::header::{SegKind, SegStatus};

#[derive(Debug)]
pub struct FileMeta {
    pub fid: u32,
    pub kind: SegKind,
    pub first_oid: u64,
    pub last_oid: AtomicU64,
    pub file_size: AtomicU64,
    pub junk_bytes: AtomicU64,
    pub status: AtomicU32,
    /// 0 = none. Data segments only; index segments keep this at 0.
    pub nearest_expire: AtomicU32,
    /// Bumped for the lifetime of any iterator walking this segment, so it
    /// isn't unlinked out from under a reader.
    pub ref_count: AtomicU64,
    pub unlink_pending: AtomicBool,
    /// Last time (monotonic seconds) this segment was scanned by data
    /// compaction, used by `DATARCYLECHECKFACTOR`-style backoff.
    pub last_compaction_check: AtomicU64,
}

impl FileMeta {
    pub fn new(fid: u32, kind: SegKind, first_oid: u64, header_size: u64) -> Self {
        Self {
            fid,
            kind,
            first_oid,
            last_oid: AtomicU64::new(0),
            file_size: AtomicU64::new(header_size),
            junk_bytes: AtomicU64::new(0),
            status: AtomicU32::new(SegStatus::Writing as u32),
            nearest_expire: AtomicU32::new(0),
            ref_count: AtomicU64::new(0),
            unlink_pending: AtomicBool::new(false),
            last_compaction_check: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> SegStatus {
        SegStatus::from_u32(self.status.load(Ordering::Acquire)).unwrap_or(SegStatus::Writing)
    }

    pub fn set_status(&self, status: SegStatus) {
        self.status.store(status as u32, Ordering::Release);
    }

    pub fn is_full(&self) -> bool {
        matches!(self.status(), SegStatus::Full)
    }

    pub fn last_oid(&self) -> u64 {
        self.last_oid.load(Ordering::Acquire)
    }

    pub fn bump_last_oid(&self, oid: u64) {
        self.last_oid.fetch_max(oid, Ordering::AcqRel);
    }

    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    pub fn add_file_size(&self, n: u64) {
        self.file_size.fetch_add(n, Ordering::AcqRel);
    }

    pub fn junk_bytes(&self) -> u64 {
        self.junk_bytes.load(Ordering::Acquire)
    }

    pub fn add_junk(&self, n: u64) {
        self.junk_bytes.fetch_add(n, Ordering::AcqRel);
    }

    pub fn nearest_expire(&self) -> u32 {
        self.nearest_expire.load(Ordering::Acquire)
    }

    /// Folds in a candidate expiration: keeps the earliest non-zero value.
    pub fn observe_expire(&self, expire: u32) {
        if expire == 0 {
            return;
        }
        let _ = self
            .nearest_expire
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(if cur == 0 { expire } else { cur.min(expire) })
            });
    }

    pub fn acquire_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release_ref(&self) {
        self.ref_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn mark_unlink_pending(&self) {
        self.unlink_pending.store(true, Ordering::Release);
    }

    pub fn unlink_pending(&self) -> bool {
        self.unlink_pending.load(Ordering::Acquire)
    }

    /// A segment is reclaimable once over half its bytes are junk.
    pub fn is_junk_heavy(&self) -> bool {
        self.junk_bytes() * 2 > self.file_size().max(1)
    }
}
