//! Persistence for the two small header files that round out the on-disk
//! layout in spec §6: `mainindex.cdb` (the main bucket table) and
//! `mainmeta.cdb` (per-segment metadata not re-derivable from a segment's
//! own 64-byte header — junk bytes and nearest-expire).
//!
//! Both files share the "64-byte fixed header, then a flat array" shape
//! `segment/header.rs` already uses for segment files, so the encoding here
//! follows the same `zerocopy` pattern.

use std::fs::{File, OpenOptions};
use std::path::Path;

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, Result};
use crate::fs_ext::FileExt;
use crate::segment::{SegKind, SegStatus};
use crate::types::VirtualOffset;

const MAININDEX_MAGIC: &[u8; 24] = b"CuTtDbFiLePaRtIaL\0\0\0\0\0\0\0";
const MAINMETA_MAGIC: &[u8; 24] = b"CuttDbMaInMeTaPaRtIaL\0\0\0";

pub const OPEN_SIGNATURE: u32 = 2;
pub const CLOSED_SIGNATURE: u32 = 3;

const HEADER_SIZE: usize = 64;
const TABLE_ENTRY_SIZE: usize = 6;

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct MainIndexHeader {
    magic: [u8; 24],
    hsize: U32,
    oid: U64,
    roid: U64,
    rnum: U64,
    signature: U32,
    _pad: [u8; 8],
}

/// `mainindex.cdb`: the persisted main bucket table plus the header fields
/// recovery needs before it can even open a segment (`hsize`, `oid`,
/// `roid`, `rnum`, and whether the prior session closed cleanly).
pub struct MainIndexFile;

pub struct MainIndexHeaderValues {
    pub hsize: u32,
    pub oid: u64,
    pub roid: u64,
    pub rnum: u64,
    pub signature: u32,
}

impl MainIndexFile {
    pub fn path(dir: &Path) -> std::path::PathBuf {
        dir.join("mainindex.cdb")
    }

    /// Creates a brand new file with `hsize` empty bucket entries.
    pub fn create(dir: &Path, hsize: u32) -> Result<()> {
        let path = Self::path(dir);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::FileOpenFailed { path: path.clone(), source: e })?;
        let header = MainIndexHeader {
            magic: *MAININDEX_MAGIC,
            hsize: hsize.into(),
            oid: 1u64.into(),
            roid: 0u64.into(),
            rnum: 0u64.into(),
            signature: OPEN_SIGNATURE.into(),
            _pad: [0u8; 8],
        };
        file.write_all_at(header.as_bytes(), 0)
            .map_err(|e| Error::WriteError { fid: 0, source: e })?;
        let table = vec![0u8; hsize as usize * TABLE_ENTRY_SIZE];
        file.write_all_at(&table, HEADER_SIZE as u64)
            .map_err(|e| Error::WriteError { fid: 0, source: e })?;
        Ok(())
    }

    /// Reads the header fields only, without loading the whole table —
    /// used by recovery to decide whether a rebuild is required before it
    /// commits to reading `hsize` (possibly very large) table entries.
    pub fn read_header(dir: &Path) -> Result<MainIndexHeaderValues> {
        let path = Self::path(dir);
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| Error::FileOpenFailed { path, source: e })?;
        let mut buf = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut buf, 0)
            .map_err(|e| Error::ReadError { fid: 0, source: e })?;
        let header = MainIndexHeader::read_from_prefix(&buf).ok_or(Error::HeaderError)?;
        if header.magic != *MAININDEX_MAGIC {
            return Err(Error::HeaderError);
        }
        Ok(MainIndexHeaderValues {
            hsize: header.hsize.get(),
            oid: header.oid.get(),
            roid: header.roid.get(),
            rnum: header.rnum.get(),
            signature: header.signature.get(),
        })
    }

    /// Loads the full bucket table as raw 48-bit offsets.
    pub fn read_table(dir: &Path, hsize: u32) -> Result<Vec<u64>> {
        let path = Self::path(dir);
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| Error::FileOpenFailed { path, source: e })?;
        let mut buf = vec![0u8; hsize as usize * TABLE_ENTRY_SIZE];
        file.read_exact_at(&mut buf, HEADER_SIZE as u64)
            .map_err(|e| Error::ReadError { fid: 0, source: e })?;
        let mut out = Vec::with_capacity(hsize as usize);
        for chunk in buf.chunks_exact(TABLE_ENTRY_SIZE) {
            let mut raw = [0u8; 8];
            raw[0..6].copy_from_slice(chunk);
            out.push(u64::from_le_bytes(raw) & 0xFFFF_FFFF_FFFF);
        }
        Ok(out)
    }

    /// Rewrites the header and the full table. Called on `close` and by the
    /// periodic flush worker, never on the hot path.
    pub fn write_all(
        dir: &Path,
        hsize: u32,
        oid: u64,
        roid: u64,
        rnum: u64,
        signature: u32,
        table: &[VirtualOffset],
    ) -> Result<()> {
        let path = Self::path(dir);
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| Error::FileOpenFailed { path, source: e })?;
        let header = MainIndexHeader {
            magic: *MAININDEX_MAGIC,
            hsize: hsize.into(),
            oid: oid.into(),
            roid: roid.into(),
            rnum: rnum.into(),
            signature: signature.into(),
            _pad: [0u8; 8],
        };
        file.write_all_at(header.as_bytes(), 0)
            .map_err(|e| Error::WriteError { fid: 0, source: e })?;
        let mut bytes = Vec::with_capacity(table.len() * TABLE_ENTRY_SIZE);
        for off in table {
            bytes.extend_from_slice(&off.raw().to_le_bytes()[0..6]);
        }
        file.write_all_at(&bytes, HEADER_SIZE as u64)
            .map_err(|e| Error::WriteError { fid: 0, source: e })?;
        Ok(())
    }

    pub fn set_signature(dir: &Path, signature: u32) -> Result<()> {
        let path = Self::path(dir);
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| Error::FileOpenFailed { path, source: e })?;
        write_u32_field(&file, 24 + 4 + 8 + 8 + 8, signature)
    }
}

fn write_u32_field(file: &File, offset: u64, value: u32) -> Result<()> {
    file.write_all_at(&value.to_le_bytes(), offset)
        .map_err(|e| Error::WriteError { fid: 0, source: e })
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct MainMetaHeader {
    magic: [u8; 24],
    ibuf_off: U32,
    ibuf_limit: U32,
    dbuf_off: U32,
    dbuf_limit: U32,
    ifnum: U32,
    dfnum: U32,
    ibuf_fid: U32,
    dbuf_fid: U32,
    _pad: [u8; 8],
}

/// Per-index-segment record: `fid(4) | fsize(4) | rcyled(4) | oidf(8) |
/// oidl(8) | fstatus(1) | ftype(1)`, exactly the 30 bytes spec §6 names.
/// Packed by hand rather than via a `#[repr(C)]` struct since the field
/// widths don't land on a multiple-of-8 boundary, the same reasoning
/// `page.rs`'s `PageItem` uses for its 9-byte items.
const INDEX_SEG_RECORD_SIZE: usize = 30;

/// Per-data-segment record: the index-segment record plus `nexpire(4)`, 34
/// bytes.
const DATA_SEG_RECORD_SIZE: usize = 34;

fn encode_seg_record(out: &mut Vec<u8>, s: &PersistedSegMeta, nexpire: Option<u32>) {
    out.extend_from_slice(&s.fid.to_le_bytes());
    out.extend_from_slice(&s.file_size.to_le_bytes());
    out.extend_from_slice(&s.junk_bytes.to_le_bytes());
    out.extend_from_slice(&s.first_oid.to_le_bytes());
    out.extend_from_slice(&s.last_oid.to_le_bytes());
    out.push(s.status as u8);
    out.push(s.kind as u8);
    if let Some(n) = nexpire {
        out.extend_from_slice(&n.to_le_bytes());
    }
}

fn decode_seg_record(buf: &[u8], kind: SegKind) -> Result<PersistedSegMeta> {
    let fid = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let file_size = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let junk_bytes = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    let first_oid = u64::from_le_bytes(buf[12..20].try_into().unwrap());
    let last_oid = u64::from_le_bytes(buf[20..28].try_into().unwrap());
    let status = SegStatus::from_u32(buf[28] as u32)?;
    let nearest_expire = if kind == SegKind::Data {
        u32::from_le_bytes(buf[30..34].try_into().unwrap())
    } else {
        0
    };
    Ok(PersistedSegMeta {
        fid,
        file_size,
        junk_bytes,
        first_oid,
        last_oid,
        status,
        kind,
        nearest_expire,
    })
}

/// A recovered-or-about-to-be-persisted per-segment summary. This mirrors
/// spec §3's `File meta` fields that aren't re-derivable purely from a
/// segment's own header: `junk_bytes` and `nearest_expire` (data only).
#[derive(Debug, Clone)]
pub struct PersistedSegMeta {
    pub fid: u32,
    pub file_size: u32,
    pub junk_bytes: u32,
    pub first_oid: u64,
    pub last_oid: u64,
    pub status: SegStatus,
    pub kind: SegKind,
    pub nearest_expire: u32,
}

pub struct MainMetaFile;

impl MainMetaFile {
    pub fn path(dir: &Path) -> std::path::PathBuf {
        dir.join("mainmeta.cdb")
    }

    pub fn write(
        dir: &Path,
        ibuf_off: u32,
        ibuf_limit: u32,
        dbuf_off: u32,
        dbuf_limit: u32,
        ibuf_fid: u32,
        dbuf_fid: u32,
        index_segs: &[PersistedSegMeta],
        data_segs: &[PersistedSegMeta],
    ) -> Result<()> {
        let path = Self::path(dir);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::FileOpenFailed { path: path.clone(), source: e })?;

        let header = MainMetaHeader {
            magic: *MAINMETA_MAGIC,
            ibuf_off: ibuf_off.into(),
            ibuf_limit: ibuf_limit.into(),
            dbuf_off: dbuf_off.into(),
            dbuf_limit: dbuf_limit.into(),
            ifnum: (index_segs.len() as u32).into(),
            dfnum: (data_segs.len() as u32).into(),
            ibuf_fid: ibuf_fid.into(),
            dbuf_fid: dbuf_fid.into(),
            _pad: [0u8; 8],
        };
        let mut bytes = Vec::with_capacity(
            HEADER_SIZE
                + index_segs.len() * INDEX_SEG_RECORD_SIZE
                + data_segs.len() * DATA_SEG_RECORD_SIZE,
        );
        bytes.extend_from_slice(header.as_bytes());
        bytes.resize(HEADER_SIZE, 0);
        for s in index_segs {
            encode_seg_record(&mut bytes, s, None);
        }
        for s in data_segs {
            encode_seg_record(&mut bytes, s, Some(s.nearest_expire));
        }
        file.write_all_at(&bytes, 0)
            .map_err(|e| Error::WriteError { fid: 0, source: e })?;
        Ok(())
    }

    /// Reads back the per-segment junk/expire hints. Returns `None` if the
    /// file is absent (a fresh database, or one predating this write).
    pub fn read(dir: &Path) -> Result<Option<(Vec<PersistedSegMeta>, Vec<PersistedSegMeta>)>> {
        let path = Self::path(dir);
        let file = match OpenOptions::new().read(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::FileOpenFailed { path, source: e }),
        };
        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut header_buf, 0)
            .map_err(|e| Error::ReadError { fid: 0, source: e })?;
        let header = MainMetaHeader::read_from_prefix(&header_buf).ok_or(Error::HeaderError)?;
        if header.magic != *MAINMETA_MAGIC {
            return Err(Error::HeaderError);
        }
        let ifnum = header.ifnum.get() as usize;
        let dfnum = header.dfnum.get() as usize;

        let mut index_buf = vec![0u8; ifnum * INDEX_SEG_RECORD_SIZE];
        file.read_exact_at(&mut index_buf, HEADER_SIZE as u64)
            .map_err(|e| Error::ReadError { fid: 0, source: e })?;
        let mut index_segs = Vec::with_capacity(ifnum);
        for chunk in index_buf.chunks_exact(INDEX_SEG_RECORD_SIZE) {
            index_segs.push(decode_seg_record(chunk, SegKind::Index)?);
        }

        let data_off = HEADER_SIZE as u64 + index_buf.len() as u64;
        let mut data_buf = vec![0u8; dfnum * DATA_SEG_RECORD_SIZE];
        file.read_exact_at(&mut data_buf, data_off)
            .map_err(|e| Error::ReadError { fid: 0, source: e })?;
        let mut data_segs = Vec::with_capacity(dfnum);
        for chunk in data_buf.chunks_exact(DATA_SEG_RECORD_SIZE) {
            data_segs.push(decode_seg_record(chunk, SegKind::Data)?);
        }

        Ok(Some((index_segs, data_segs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainindex_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        MainIndexFile::create(dir.path(), 4096).unwrap();
        let header = MainIndexFile::read_header(dir.path()).unwrap();
        assert_eq!(header.hsize, 4096);
        assert_eq!(header.signature, OPEN_SIGNATURE);

        let table = vec![VirtualOffset::NULL; 4096];
        MainIndexFile::write_all(dir.path(), 4096, 5, 3, 0, CLOSED_SIGNATURE, &table).unwrap();
        let header = MainIndexFile::read_header(dir.path()).unwrap();
        assert_eq!(header.oid, 5);
        assert_eq!(header.roid, 3);
        assert_eq!(header.signature, CLOSED_SIGNATURE);
    }

    #[test]
    fn mainindex_table_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        MainIndexFile::create(dir.path(), 8).unwrap();
        let mut table = vec![VirtualOffset::NULL; 8];
        table[3] = VirtualOffset::new(1, 32);
        MainIndexFile::write_all(dir.path(), 8, 1, 0, 0, OPEN_SIGNATURE, &table).unwrap();
        let read_back = MainIndexFile::read_table(dir.path(), 8).unwrap();
        assert_eq!(read_back[3], VirtualOffset::new(1, 32).raw());
        assert_eq!(read_back[0], 0);
    }

    #[test]
    fn mainmeta_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let index_segs = vec![PersistedSegMeta {
            fid: 2,
            file_size: 1024,
            junk_bytes: 0,
            first_oid: 1,
            last_oid: 4,
            status: SegStatus::Writing,
            kind: SegKind::Index,
            nearest_expire: 0,
        }];
        let data_segs = vec![PersistedSegMeta {
            fid: 1,
            file_size: 2048,
            junk_bytes: 64,
            first_oid: 1,
            last_oid: 5,
            status: SegStatus::Full,
            kind: SegKind::Data,
            nearest_expire: 123,
        }];
        MainMetaFile::write(dir.path(), 0, 0, 0, 0, 2, 1, &index_segs, &data_segs).unwrap();
        let (idx, data) = MainMetaFile::read(dir.path()).unwrap().unwrap();
        assert_eq!(idx.len(), 1);
        assert_eq!(idx[0].fid, 2);
        assert_eq!(data[0].junk_bytes, 64);
        assert_eq!(data[0].nearest_expire, 123);
        assert_eq!(data[0].status, SegStatus::Full);
    }

    #[test]
    fn missing_mainmeta_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MainMetaFile::read(dir.path()).unwrap().is_none());
    }
}
