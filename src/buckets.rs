//! The 256-way bucket-group lock partition (spec §5). An operation on
//! bucket `b` takes `locks[b % 256]` and holds it across page lookup, page
//! mutation, and the record read that disambiguates hash collisions — the
//! granularity the spec calls out as deliberate: buckets sharing a group
//! serialize with each other even though they're otherwise unrelated keys.

use parking_lot::{Mutex, MutexGuard};

use crate::config::MLOCK_NUM;

pub struct BucketLocks {
    locks: Vec<Mutex<()>>,
}

impl BucketLocks {
    pub fn new() -> Self {
        Self {
            locks: (0..MLOCK_NUM).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn group_of(bid: u32) -> usize {
        bid as usize % MLOCK_NUM
    }

    /// Acquires the lock guarding `bid`'s group. Held across page lookup,
    /// mutation, and record read for that bucket (spec §5 lock ordering:
    /// this must be acquired before `pclock`/`dpclock`/`rclock`).
    pub fn lock(&self, bid: u32) -> MutexGuard<'_, ()> {
        self.locks[Self::group_of(bid)].lock()
    }

    /// Non-blocking variant used by dirty-page eviction (spec §4.D): the
    /// caller already holds `dpclock` and must not block on `mlock`, since
    /// that would invert the documented `mlock -> dpclock` order.
    pub fn try_lock(&self, bid: u32) -> Option<MutexGuard<'_, ()>> {
        self.locks[Self::group_of(bid)].try_lock()
    }
}

impl Default for BucketLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_group_for_congruent_buckets() {
        assert_eq!(BucketLocks::group_of(5), BucketLocks::group_of(5 + 256));
    }

    #[test]
    fn lock_is_reentrant_safe_across_distinct_buckets() {
        let locks = BucketLocks::new();
        let _g1 = locks.lock(1);
        let _g2 = locks.lock(2);
    }
}
