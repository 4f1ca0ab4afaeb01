//! The 64-byte header every segment file begins with, so a stray segment
//! file can be classified without external metadata.

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, Result};

pub const SEGMENT_HEADER_SIZE: usize = 64;
pub const SEGMENT_MAGIC: &[u8; 8] = b"CTKVSEG\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SegKind {
    Data = 0,
    Index = 1,
}

impl SegKind {
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(SegKind::Data),
            1 => Ok(SegKind::Index),
            _ => Err(Error::HeaderError),
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            SegKind::Data => "dat",
            SegKind::Index => "idx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SegStatus {
    Writing = 0,
    Full = 1,
}

impl SegStatus {
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(SegStatus::Writing),
            1 => Ok(SegStatus::Full),
            _ => Err(Error::HeaderError),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct RawHeader {
    magic: [u8; 8],
    first_oid: U64,
    last_oid: U64,
    size: U64,
    fid: U32,
    status: U32,
    kind: U32,
    _reserved: U32,
    _pad: [u8; 16],
}

#[derive(Debug, Clone, Copy)]
pub struct SegmentHeader {
    pub fid: u32,
    pub kind: SegKind,
    pub status: SegStatus,
    pub first_oid: u64,
    pub last_oid: u64,
    pub size: u64,
}

impl SegmentHeader {
    pub fn new(fid: u32, kind: SegKind, first_oid: u64) -> Self {
        Self {
            fid,
            kind,
            status: SegStatus::Writing,
            first_oid,
            last_oid: 0,
            size: SEGMENT_HEADER_SIZE as u64,
        }
    }

    pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let raw = RawHeader {
            magic: *SEGMENT_MAGIC,
            first_oid: self.first_oid.into(),
            last_oid: self.last_oid.into(),
            size: self.size.into(),
            fid: self.fid.into(),
            status: (self.status as u32).into(),
            kind: (self.kind as u32).into(),
            _reserved: 0u32.into(),
            _pad: [0u8; 16],
        };
        let mut out = [0u8; SEGMENT_HEADER_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SEGMENT_HEADER_SIZE {
            return Err(Error::HeaderError);
        }
        let raw = RawHeader::read_from_prefix(buf).ok_or(Error::HeaderError)?;
        if raw.magic != *SEGMENT_MAGIC {
            return Err(Error::HeaderError);
        }
        Ok(Self {
            fid: raw.fid.get(),
            kind: SegKind::from_u32(raw.kind.get())?,
            status: SegStatus::from_u32(raw.status.get())?,
            first_oid: raw.first_oid.get(),
            last_oid: raw.last_oid.get(),
            size: raw.size.get(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let h = SegmentHeader::new(42, SegKind::Data, 7);
        let encoded = h.encode();
        assert_eq!(encoded.len(), SEGMENT_HEADER_SIZE);
        let decoded = SegmentHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.fid, 42);
        assert_eq!(decoded.kind, SegKind::Data);
        assert_eq!(decoded.first_oid, 7);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = [0u8; SEGMENT_HEADER_SIZE];
        assert!(SegmentHeader::decode(&buf).is_err());
    }
}
