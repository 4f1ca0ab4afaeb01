//! Record encoding (spec §3 "Record", §6 magic values).
//!
//! On-disk layout, 24-byte fixed header followed by key bytes then value
//! bytes, the whole thing padded up to the next 16-byte boundary:
//!
//! ```text
//! magic: u32 | ksize: u32 | vsize: u32 | expire: u32 | oid: u64 | key | value
//! ```

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, Result};
use crate::types::align_up;

/// Live record magic (`cuttdb.h` calls this `0x19871022`).
pub const RECORD_MAGIC: u32 = 0x1987_1022;
/// Magic CuttDB used for tombstones written in place, pre-deletion-log.
/// The write path never emits this (spec §9 Open Questions); scans still
/// treat any legacy occurrence as a live record.
pub const RECORD_MAGIC_LEGACY_DELETED: u32 = 0x1987_1023;

pub const RECORD_HEADER_SIZE: usize = 24;

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct RecordHeader {
    pub magic: U32,
    pub ksize: U32,
    pub vsize: U32,
    pub expire: U32,
    pub oid: U64,
}

impl RecordHeader {
    pub fn is_live_magic(&self) -> bool {
        let m = self.magic.get();
        m == RECORD_MAGIC || m == RECORD_MAGIC_LEGACY_DELETED
    }

    pub fn ksize(&self) -> u32 {
        self.ksize.get()
    }

    pub fn vsize(&self) -> u32 {
        self.vsize.get()
    }

    pub fn expire(&self) -> u32 {
        self.expire.get()
    }

    pub fn oid(&self) -> u64 {
        self.oid.get()
    }

    pub fn body_len(&self) -> usize {
        self.ksize() as usize + self.vsize() as usize
    }

    pub fn on_disk_len(&self) -> u64 {
        align_up((RECORD_HEADER_SIZE + self.body_len()) as u64)
    }
}

/// A fully materialized record: the header plus owned key/value bytes.
#[derive(Debug, Clone)]
pub struct Record {
    pub expire: u32,
    pub oid: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    pub fn new(key: Vec<u8>, value: Vec<u8>, expire: u32, oid: u64) -> Self {
        Self {
            expire,
            oid,
            key,
            value,
        }
    }

    /// `true` if `expire != 0` and the deadline has passed relative to `now`.
    pub fn is_expired(&self, now: u32) -> bool {
        self.expire != 0 && self.expire <= now
    }

    /// Bytes this record occupies on disk once encoded, 16-byte aligned.
    /// Used by junk accounting, which needs a superseded record's footprint
    /// without re-decoding it.
    pub fn on_disk_len(&self) -> u64 {
        align_up((RECORD_HEADER_SIZE + self.key.len() + self.value.len()) as u64)
    }

    pub fn header(&self) -> RecordHeader {
        RecordHeader {
            magic: RECORD_MAGIC.into(),
            ksize: (self.key.len() as u32).into(),
            vsize: (self.value.len() as u32).into(),
            expire: self.expire.into(),
            oid: self.oid.into(),
        }
    }

    /// Serializes the record, 16-byte-aligned, ready to append to a buffer.
    pub fn encode(&self) -> Vec<u8> {
        let header = self.header();
        let raw_len = RECORD_HEADER_SIZE + self.key.len() + self.value.len();
        let mut buf = Vec::with_capacity(align_up(raw_len as u64) as usize);
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
        buf.resize(align_up(raw_len as u64) as usize, 0);
        buf
    }

    /// Decodes a record from a buffer that starts exactly at the record's
    /// header. `key_only` mirrors the original `VIOREADREC`'s "just read key
    /// for comparison" mode by skipping the value copy.
    pub fn decode(buf: &[u8], fid: u32, offset: u64, key_only: bool) -> Result<Self> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(Error::DataFileContentError {
                fid,
                offset,
                reason: "buffer shorter than record header",
            });
        }
        let header = RecordHeader::read_from_prefix(buf).ok_or(Error::DataFileContentError {
            fid,
            offset,
            reason: "failed to parse record header",
        })?;
        if !header.is_live_magic() {
            return Err(Error::DataFileContentError {
                fid,
                offset,
                reason: "bad record magic",
            });
        }
        let ksize = header.ksize() as usize;
        let vsize = header.vsize() as usize;
        let needed = RECORD_HEADER_SIZE + ksize + if key_only { 0 } else { vsize };
        if buf.len() < needed {
            return Err(Error::DataFileContentError {
                fid,
                offset,
                reason: "buffer shorter than record body",
            });
        }
        let key = buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + ksize].to_vec();
        let value = if key_only {
            Vec::new()
        } else {
            buf[RECORD_HEADER_SIZE + ksize..RECORD_HEADER_SIZE + ksize + vsize].to_vec()
        };
        Ok(Record {
            expire: header.expire(),
            oid: header.oid(),
            key,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let rec = Record::new(b"key".to_vec(), b"value-bytes".to_vec(), 0, 42);
        let encoded = rec.encode();
        assert_eq!(encoded.len() % 16, 0);
        let decoded = Record::decode(&encoded, 1, 0, false).unwrap();
        assert_eq!(decoded.key, rec.key);
        assert_eq!(decoded.value, rec.value);
        assert_eq!(decoded.oid, 42);
    }

    #[test]
    fn key_only_decode_skips_value() {
        let rec = Record::new(b"k".to_vec(), b"some long value".to_vec(), 0, 1);
        let encoded = rec.encode();
        let decoded = Record::decode(&encoded[..RECORD_HEADER_SIZE + 1], 1, 0, true).unwrap();
        assert_eq!(decoded.key, b"k");
        assert!(decoded.value.is_empty());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = vec![0u8; RECORD_HEADER_SIZE];
        buf[0..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        let err = Record::decode(&buf, 3, 0, false).unwrap_err();
        assert!(matches!(err, Error::DataFileContentError { fid: 3, .. }));
    }

    #[test]
    fn expiration() {
        let mut rec = Record::new(b"k".to_vec(), b"v".to_vec(), 100, 1);
        assert!(rec.is_expired(101));
        assert!(!rec.is_expired(100 - 1));
        rec.expire = 0;
        assert!(!rec.is_expired(u32::MAX));
    }
}
