//! Optional bloom filter used by `cdb_getoff`'s lookup order (spec §4.B,
//! §4.D). Ported from `cdb_bloomfilter.c`: 16 fixed multiplicative seeds,
//! the bit array split across 64 shards so growing it doesn't need one huge
//! contiguous allocation, and the hash count derived from the size/record
//! ratio (clamped to `[1, 16]`).

use parking_lot::Mutex;

const HASH_NUM: usize = 16;
const SPLIT_POW: u32 = 6;
const SPLITS: usize = 1 << SPLIT_POW;

const SEEDS: [u64; HASH_NUM] = [
    217_636_919,
    290_182_597,
    386_910_137,
    515_880_193,
    687_840_301,
    917_120_411,
    1_222_827_239,
    1_610_612_741,
    3_300_450_239,
    3_300_450_259,
    3_300_450_281,
    3_300_450_289,
    3_221_225_473,
    4_294_967_291,
    163_227_661,
    122_420_729,
];

pub struct BloomFilter {
    shards: Vec<Mutex<Vec<u8>>>,
    shard_bits: u64,
    hnum: usize,
}

impl BloomFilter {
    /// `size_bytes` is the total bitmap size; `estimated_records` is the
    /// expected population used to pick the hash count.
    pub fn new(estimated_records: u64, size_bytes: u64) -> Self {
        let estimated_records = estimated_records.max(1);
        let mut hnum = (size_bytes * 8 * 7 / (estimated_records * 10)) as usize;
        hnum = hnum.clamp(1, HASH_NUM);

        let per_shard = (size_bytes >> SPLIT_POW).max(1) as usize;
        let shards = (0..SPLITS)
            .map(|_| Mutex::new(vec![0u8; per_shard]))
            .collect();

        Self {
            shards,
            shard_bits: (per_shard as u64) << 3,
            hnum,
        }
    }

    fn hashes(&self, key: &[u8]) -> [u64; HASH_NUM] {
        let mut hval = [0u64; HASH_NUM];
        for &byte in key {
            for i in 0..self.hnum {
                hval[i] = hval[i].wrapping_mul(SEEDS[i]).wrapping_add(byte as u64);
            }
        }
        hval
    }

    pub fn set(&self, key: &[u8]) {
        let hval = self.hashes(key);
        for i in 0..self.hnum {
            let p = (hval[i] >> SPLIT_POW) % self.shard_bits;
            let shard = &self.shards[(hval[i] & (SPLITS as u64 - 1)) as usize];
            let mut bitmap = shard.lock();
            bitmap[(p >> 3) as usize] |= 1 << (p & 0x07);
        }
    }

    /// Returns `true` if the key *might* be present; `false` means it is
    /// definitely absent and the caller should skip the page read entirely.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        let hval = self.hashes(key);
        for i in 0..self.hnum {
            let p = (hval[i] >> SPLIT_POW) % self.shard_bits;
            let shard = &self.shards[(hval[i] & (SPLITS as u64 - 1)) as usize];
            let bitmap = shard.lock();
            if bitmap[(p >> 3) as usize] & (1 << (p & 0x07)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().iter_mut().for_each(|b| *b = 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_probe_is_always_positive() {
        let bf = BloomFilter::new(1024, 1 << 20);
        for i in 0..1000u32 {
            bf.set(&i.to_le_bytes());
        }
        for i in 0..1000u32 {
            assert!(bf.might_contain(&i.to_le_bytes()));
        }
    }

    #[test]
    fn unset_key_is_usually_negative() {
        let bf = BloomFilter::new(1024, 1 << 20);
        for i in 0..1000u32 {
            bf.set(&i.to_le_bytes());
        }
        let mut false_positives = 0;
        for i in 1_000_000..1_001_000u32 {
            if bf.might_contain(&i.to_le_bytes()) {
                false_positives += 1;
            }
        }
        assert!(false_positives < 50, "false positive rate too high: {false_positives}/1000");
    }

    #[test]
    fn clear_resets_all_bits() {
        let bf = BloomFilter::new(16, 1024);
        bf.set(b"hello");
        bf.clear();
        assert!(!bf.might_contain(b"hello"));
    }
}
