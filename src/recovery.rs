//! Startup and crash recovery (spec §4.G). Three paths, chosen from the
//! state of `mainindex.cdb` and the segment directory:
//!
//! - fresh create: no `mainindex.cdb` yet, `CREAT` requested.
//! - clean reopen: the prior session wrote `CLOSED_SIGNATURE` and no
//!   `force_recovery` sentinel is present — the persisted main table and
//!   segment metadata are trusted as-is.
//! - crash recovery: the prior session left `OPEN_SIGNATURE` (it never
//!   reached `close`) or a `force_recovery` file is present — the main
//!   table is rebuilt from an index-page scan, then reconciled against
//!   data records and the deletion log written since the last clean
//!   point.
//!
//! Grounded in `cdb_core.c`'s `cdb_open`/`cdb_recovery` sequence.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};
use std::sync::Arc;

use crate::cache::CacheCoordinator;
use crate::config::{OpenFlags, Options};
use crate::error::{Error, Result};
use crate::hash::key_hash64;
use crate::index::{IndexCore, MainTable, PageOp};
use crate::kv::Engine;
use crate::mainfile::{MainIndexFile, MainMetaFile, CLOSED_SIGNATURE, OPEN_SIGNATURE};
use crate::page::Page;
use crate::pidfile::PidFile;
use crate::record::Record;
use crate::segment::{FileMeta, SegKind, SegStatus, SegmentHeader, SegmentStore, SEGMENT_HEADER_SIZE};
use crate::types::{align_up, bucket_of, VirtualOffset, ALIGNMENT};

const FORCE_RECOVERY_FILE: &str = "force_recovery";

pub struct OpenResult {
    pub engine: Engine,
    pub pidfile: PidFile,
}

/// Opens (creating or recovering as needed) the database at `dir`.
pub fn open(dir: &Path, options: Options, flags: OpenFlags) -> Result<OpenResult> {
    if flags.contains(OpenFlags::TRUNC) && dir.exists() {
        std::fs::remove_dir_all(dir).map_err(|e| Error::FileOpenFailed { path: dir.to_path_buf(), source: e })?;
    }

    if !MainIndexFile::path(dir).exists() {
        return create_fresh(dir, options, flags);
    }

    let pidfile = PidFile::acquire(dir)?;
    let header = MainIndexFile::read_header(dir)?;
    let options = options.with_hsize(header.hsize);

    let force_recovery_path = dir.join(FORCE_RECOVERY_FILE);
    let force_recovery = force_recovery_path.exists();
    let needs_recovery = header.signature != CLOSED_SIGNATURE || force_recovery;

    let mut scanned = scan_segments(dir)?;
    if force_recovery {
        for fid in scanned.index_order.drain(..) {
            let _ = std::fs::remove_file(segment_file_path(dir, SegKind::Index, fid));
        }
        scanned.index_meta.clear();
        scanned.index_writer_fid = None;
    }

    let mut next_fid = scanned
        .data_meta
        .keys()
        .chain(scanned.index_meta.keys())
        .copied()
        .max()
        .unwrap_or(0)
        + 1;
    let data_writer_fid = match scanned.data_writer_fid {
        Some(fid) => fid,
        None => {
            let fid = next_fid;
            next_fid += 1;
            scanned
                .data_meta
                .insert(fid, Arc::new(FileMeta::new(fid, SegKind::Data, header.oid, SEGMENT_HEADER_SIZE as u64)));
            scanned.data_order.push(fid);
            fid
        }
    };
    let index_writer_fid = match scanned.index_writer_fid {
        Some(fid) => fid,
        None => {
            let fid = next_fid;
            scanned
                .index_meta
                .insert(fid, Arc::new(FileMeta::new(fid, SegKind::Index, header.oid, SEGMENT_HEADER_SIZE as u64)));
            scanned.index_order.push(fid);
            fid
        }
    };

    let store = SegmentStore::from_scan(
        dir,
        data_writer_fid,
        index_writer_fid,
        scanned.data_meta,
        scanned.data_order,
        scanned.index_meta,
        scanned.index_order,
        header.oid,
        header.roid,
    )?;
    store.bump_oid(scanned.max_oid);

    if let Some((index_segs, data_segs)) = MainMetaFile::read(dir)? {
        for p in index_segs {
            if let Some(m) = store.meta(SegKind::Index, p.fid) {
                m.add_junk(p.junk_bytes as u64);
            }
        }
        for p in data_segs {
            if let Some(m) = store.meta(SegKind::Data, p.fid) {
                m.add_junk(p.junk_bytes as u64);
                m.observe_expire(p.nearest_expire);
            }
        }
    }

    let (main_table, index) = if needs_recovery {
        rebuild_from_scratch(dir, &store, header.hsize, header.roid)?
    } else {
        let raw = MainIndexFile::read_table(dir, header.hsize)?;
        (MainTable::from_raw(raw), IndexCore::new(header.rnum))
    };

    let engine = Engine::new_with_store(options, main_table, index, store);

    if needs_recovery {
        engine.persist_header(dir, OPEN_SIGNATURE)?;
        let _ = std::fs::remove_file(&force_recovery_path);
    } else {
        MainIndexFile::set_signature(dir, OPEN_SIGNATURE)?;
    }

    Ok(OpenResult { engine, pidfile })
}

fn create_fresh(dir: &Path, options: Options, flags: OpenFlags) -> Result<OpenResult> {
    if !flags.contains(OpenFlags::CREAT) {
        return Err(Error::PathOpenFailed(dir.to_path_buf()));
    }
    std::fs::create_dir_all(dir).map_err(|e| Error::FileOpenFailed { path: dir.to_path_buf(), source: e })?;
    let pidfile = PidFile::acquire(dir)?;
    let store = SegmentStore::create(dir)?;
    MainIndexFile::create(dir, options.hsize)?;
    let main_table = MainTable::new(options.hsize);
    let index = IndexCore::new(0);
    let engine = Engine::new_with_store(options, main_table, index, store);
    Ok(OpenResult { engine, pidfile })
}

// ---- directory scan ----

struct ScanSegments {
    data_meta: HashMap<u32, Arc<FileMeta>>,
    data_order: Vec<u32>,
    index_meta: HashMap<u32, Arc<FileMeta>>,
    index_order: Vec<u32>,
    data_writer_fid: Option<u32>,
    index_writer_fid: Option<u32>,
    max_oid: u64,
}

pub(crate) fn segment_file_path(dir: &Path, kind: SegKind, fid: u32) -> PathBuf {
    dir.join(format!("{}{:08}.cdb", kind.prefix(), fid))
}

/// Classifies every `dat*.cdb`/`idx*.cdb` file in `dir` by reading its
/// 64-byte header; anything unreadable or with a bad magic is skipped with
/// a warning rather than failing the whole open (spec §4.G step 1).
fn scan_segments(dir: &Path) -> Result<ScanSegments> {
    let mut data_meta = HashMap::new();
    let mut index_meta = HashMap::new();
    let mut data_writer_fid = None;
    let mut index_writer_fid = None;
    let mut max_oid = 0u64;

    let entries = std::fs::read_dir(dir).map_err(|e| Error::FileOpenFailed { path: dir.to_path_buf(), source: e })?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::FileOpenFailed { path: dir.to_path_buf(), source: e })?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        let is_segment = (name.starts_with("dat") || name.starts_with("idx")) && name.ends_with(".cdb");
        if !is_segment {
            continue;
        }
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(_) => continue,
        };
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        if file.read_exact(&mut buf).is_err() {
            tracing::warn!(?path, "segment file too short for a header, skipping");
            continue;
        }
        let header = match SegmentHeader::decode(&buf) {
            Ok(h) => h,
            Err(_) => {
                tracing::warn!(?path, "bad segment header magic, skipping");
                continue;
            }
        };
        let file_size = path.metadata().map(|m| m.len()).unwrap_or(SEGMENT_HEADER_SIZE as u64);
        let meta = Arc::new(FileMeta {
            fid: header.fid,
            kind: header.kind,
            first_oid: header.first_oid,
            last_oid: AtomicU64::new(header.last_oid),
            file_size: AtomicU64::new(file_size.max(SEGMENT_HEADER_SIZE as u64)),
            junk_bytes: AtomicU64::new(0),
            status: AtomicU32::new(header.status as u32),
            nearest_expire: AtomicU32::new(0),
            ref_count: AtomicU64::new(0),
            unlink_pending: AtomicBool::new(false),
            last_compaction_check: AtomicU64::new(0),
        });
        max_oid = max_oid.max(header.last_oid);
        match header.kind {
            SegKind::Data => {
                if header.status == SegStatus::Writing {
                    data_writer_fid = Some(header.fid);
                }
                data_meta.insert(header.fid, meta);
            }
            SegKind::Index => {
                if header.status == SegStatus::Writing {
                    index_writer_fid = Some(header.fid);
                }
                index_meta.insert(header.fid, meta);
            }
        }
    }

    let data_order = ordered_fids(&data_meta);
    let index_order = ordered_fids(&index_meta);
    Ok(ScanSegments {
        data_meta,
        data_order,
        index_meta,
        index_order,
        data_writer_fid,
        index_writer_fid,
        max_oid,
    })
}

fn ordered_fids(meta: &HashMap<u32, Arc<FileMeta>>) -> Vec<u32> {
    let mut fids: Vec<u32> = meta.keys().copied().collect();
    fids.sort_by_key(|f| meta[f].first_oid);
    fids
}

// ---- crash-recovery rebuild (spec §4.G steps 5-7) ----

/// Rebuilds the main table and record count from an index-page scan, then
/// reconciles against data records and the deletion log written since the
/// last durable checkpoint (`roid`).
fn rebuild_from_scratch(dir: &Path, store: &SegmentStore, hsize: u32, roid: u64) -> Result<(MainTable, IndexCore)> {
    let main_table = MainTable::new(hsize);
    let index = IndexCore::new(0);
    let cache = CacheCoordinator::new(&Options::default().with_hsize(hsize));
    let locks = crate::buckets::BucketLocks::new();

    // step 5: walk every index page in oid order; each bucket's last page
    // wins, and whichever page it supersedes is charged to junk.
    let mut installed: HashMap<u32, (VirtualOffset, u32, u64)> = HashMap::new();
    for seg in store.index_segments_in_oid_order() {
        for (offset, page) in scan_index_segment(dir, seg.fid)? {
            if let Some((old_off, old_num, old_len)) = installed.get(&page.bid).copied() {
                store.mark_junk(SegKind::Index, old_off.fid(), old_len);
                index.adjust_record_count(-(old_num as i64));
            }
            let num = page.num();
            let len = page.on_disk_len();
            main_table.set(page.bid, offset);
            index.adjust_record_count(num as i64);
            installed.insert(page.bid, (offset, num, len));
        }
    }

    // step 6: replay data records written after the last clean point,
    // since their page-level index entries may not have made it to disk.
    for seg in store.data_segments_in_oid_order() {
        for (offset, record) in scan_data_segment(dir, seg.fid)? {
            store.bump_oid(record.oid);
            if record.oid <= roid {
                continue;
            }
            let hash = key_hash64(&record.key);
            let bid = bucket_of(hash, hsize);
            let _guard = locks.lock(bid);
            let existing = index.cdb_getoff(&main_table, &cache, store, bid, hash)?;
            let mut matched = None;
            for off in existing.iter() {
                if off == offset {
                    continue;
                }
                if let Ok(candidate) = store.read_record(off, 4096, true) {
                    if candidate.key == record.key {
                        matched = Some(off);
                        break;
                    }
                }
            }
            match matched {
                Some(old_off) => {
                    index.cdb_replaceoff(&main_table, &cache, store, bid, hash, old_off, offset)?;
                }
                None => {
                    index.cdb_updatepage(&main_table, &cache, store, bid, hash, offset, PageOp::Insert)?;
                }
            }
        }
    }

    // step 7: drain the deletion log, removing each tombstoned offset from
    // the just-rebuilt index and accounting its bytes as junk.
    for off in read_dellog_raw(dir)? {
        let Ok(rec) = store.read_record(off, 4096, false) else { continue };
        let hash = key_hash64(&rec.key);
        let bid = bucket_of(hash, hsize);
        let _guard = locks.lock(bid);
        if index
            .cdb_updatepage(&main_table, &cache, store, bid, hash, off, PageOp::Delete)?
        {
            store.mark_junk(SegKind::Data, off.fid(), rec.on_disk_len());
        }
    }

    Ok((main_table, index))
}

pub(crate) fn scan_index_segment(dir: &Path, fid: u32) -> Result<Vec<(VirtualOffset, Page)>> {
    let path = segment_file_path(dir, SegKind::Index, fid);
    let content = std::fs::read(&path).map_err(|e| Error::FileOpenFailed { path, source: e })?;
    let mut pos = SEGMENT_HEADER_SIZE as u64;
    let mut out = Vec::new();
    while (pos as usize) < content.len() {
        match Page::decode(&content[pos as usize..], fid, pos) {
            Ok(page) => {
                let len = align_up(page.on_disk_len());
                out.push((VirtualOffset::new(fid, pos), page));
                pos += len;
            }
            Err(_) => {
                tracing::warn!(fid, pos, "corrupt index page during recovery scan, skipping ahead");
                pos += ALIGNMENT;
            }
        }
    }
    Ok(out)
}

pub(crate) fn scan_data_segment(dir: &Path, fid: u32) -> Result<Vec<(VirtualOffset, Record)>> {
    let path = segment_file_path(dir, SegKind::Data, fid);
    let content = std::fs::read(&path).map_err(|e| Error::FileOpenFailed { path, source: e })?;
    let mut pos = SEGMENT_HEADER_SIZE as u64;
    let mut out = Vec::new();
    while (pos as usize) < content.len() {
        match Record::decode(&content[pos as usize..], fid, pos, false) {
            Ok(rec) => {
                let len = rec.on_disk_len();
                out.push((VirtualOffset::new(fid, pos), rec));
                pos += len;
            }
            Err(_) => {
                tracing::warn!(fid, pos, "corrupt record during recovery scan, skipping ahead");
                pos += ALIGNMENT;
            }
        }
    }
    Ok(out)
}

/// Reads `dellog.cdb` directly, bypassing `SegmentStore`: its in-memory
/// `DelLog` only tracks entries pushed after open, so replaying what a
/// prior session already wrote needs the file's existing bytes.
fn read_dellog_raw(dir: &Path) -> Result<Vec<VirtualOffset>> {
    let path = dir.join("dellog.cdb");
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::FileOpenFailed { path, source: e }),
    };
    let mut out = Vec::with_capacity(bytes.len() / 6);
    for chunk in bytes.chunks_exact(6) {
        let mut raw = [0u8; 8];
        raw[0..6].copy_from_slice(chunk);
        out.push(VirtualOffset::from_raw(u64::from_le_bytes(raw)));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SetFlags;

    #[test]
    fn fresh_create_then_reopen_clean() {
        let dir = tempfile::tempdir().unwrap();
        {
            let opened = open(dir.path(), Options::default().with_hsize(4096), OpenFlags::CREAT).unwrap();
            opened.engine.set(b"k", b"v", SetFlags::OVERWRITE, 0, 0).unwrap();
            opened.engine.persist_header(dir.path(), CLOSED_SIGNATURE).unwrap();
            opened.pidfile.release();
        }
        let reopened = open(dir.path(), Options::default(), OpenFlags::empty()).unwrap();
        assert_eq!(reopened.engine.get(b"k", 0).unwrap(), b"v");
        reopened.pidfile.release();
    }

    #[test]
    fn crash_without_close_recovers_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let opened = open(dir.path(), Options::default().with_hsize(4096), OpenFlags::CREAT).unwrap();
            for i in 0..50u32 {
                let key = format!("k{i}");
                opened.engine.set(key.as_bytes(), b"v", SetFlags::OVERWRITE, 0, 0).unwrap();
            }
            opened.engine.store().unwrap().flush_all().unwrap();
            // signature stays OPEN_SIGNATURE: simulates a crash before close.
            std::mem::forget(opened.pidfile);
        }
        std::fs::remove_file(dir.path().join("pid.cdb")).ok();
        let reopened = open(dir.path(), Options::default(), OpenFlags::empty()).unwrap();
        assert_eq!(reopened.engine.index().record_count(), 50);
        for i in 0..50u32 {
            let key = format!("k{i}");
            assert_eq!(reopened.engine.get(key.as_bytes(), 0).unwrap(), b"v");
        }
        reopened.pidfile.release();
    }

    #[test]
    fn force_recovery_file_triggers_rebuild_even_when_closed_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        {
            let opened = open(dir.path(), Options::default().with_hsize(4096), OpenFlags::CREAT).unwrap();
            opened.engine.set(b"k", b"v", SetFlags::OVERWRITE, 0, 0).unwrap();
            opened.engine.persist_header(dir.path(), CLOSED_SIGNATURE).unwrap();
            opened.pidfile.release();
        }
        std::fs::write(dir.path().join(FORCE_RECOVERY_FILE), b"").unwrap();
        let reopened = open(dir.path(), Options::default(), OpenFlags::empty()).unwrap();
        assert!(!dir.path().join(FORCE_RECOVERY_FILE).exists());
        assert_eq!(reopened.engine.get(b"k", 0).unwrap(), b"v");
        reopened.pidfile.release();
    }
}
