//! `cuttkv`: an embeddable, crash-consistent, append-only segmented
//! hash-index key-value store. One database is one directory (or, via the
//! `:memory:` sentinel, an in-process cache with no durable backing); a
//! [`Builder`] configures a handle the way `cdb_new`/`cdb_option*` do before
//! [`Builder::open`] hands back a live [`Database`].

pub mod types;
pub mod error;
pub mod config;
pub mod hash;
pub mod lru;
pub mod bloom;
pub mod record;
pub mod page;
pub mod fs_ext;
pub mod segment;
pub mod mainfile;
pub mod pidfile;
pub mod buckets;
pub mod cache;
pub mod index;
pub mod kv;
pub mod recovery;
pub mod iter;
pub mod stat;
pub mod workers;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub use config::{OpenFlags, Options, SetFlags};
pub use error::{Error, Result};
pub use iter::Cursor;
pub use stat::Stats;

use config::DEFAULT_HSIZE;
use kv::Engine;
use mainfile::CLOSED_SIGNATURE;
use stat::LatencyTracker;
use workers::Workers;

/// Builds the configuration a database is opened with, mirroring
/// `cdb_new` + `cdb_option`/`cdb_option_bloom`/`cdb_option_aread`: every
/// knob is set before [`open`](Builder::open), never after.
#[derive(Debug, Clone, Default)]
pub struct Builder {
    options: Options,
}

impl Builder {
    pub fn new() -> Self {
        Self { options: Options::default() }
    }

    /// Sets the main bucket table size and the two cache budgets, in MiB.
    pub fn option(mut self, hsize: u32, rcache_mb: u32, pcache_mb: u32) -> Self {
        self.options = self.options.with_hsize(hsize).with_cache_mb(rcache_mb, pcache_mb);
        self
    }

    /// Enables the bloom-filter pre-filter, sized for `estimated_records`.
    pub fn option_bloom(mut self, estimated_records: u64) -> Self {
        self.options = self.options.with_bloom(estimated_records);
        self
    }

    /// Sets the anticipatory-read size used for record reads.
    pub fn option_aread(mut self, bytes: u32) -> Self {
        self.options = self.options.with_aread(bytes);
        self
    }

    /// Opens (creating or recovering as needed) the database at `dir`. The
    /// sentinel path [`kv::MEMORY_PATH`] selects the in-memory backend
    /// instead, skipping recovery, the pid file, and the background worker
    /// entirely — there is nothing durable for any of them to protect.
    pub fn open(self, dir: impl AsRef<Path>, flags: OpenFlags) -> Result<Database> {
        Database::open_with(dir.as_ref(), self.options, flags)
    }
}

/// A live, open database handle.
pub struct Database {
    engine: Arc<Engine>,
    pidfile: Option<pidfile::PidFile>,
    workers: Option<Workers>,
    latency: LatencyTracker,
    dir: PathBuf,
}

impl Database {
    fn open_with(dir: &Path, options: Options, flags: OpenFlags) -> Result<Self> {
        if kv::is_memory_path(dir) {
            let engine = Arc::new(Engine::new_memory(options));
            return Ok(Self {
                engine,
                pidfile: None,
                workers: None,
                latency: LatencyTracker::new(),
                dir: dir.to_path_buf(),
            });
        }
        let opened = recovery::open(dir, options, flags)?;
        let engine = Arc::new(opened.engine);
        let workers = Workers::spawn(engine.clone(), dir.to_path_buf());
        Ok(Self {
            engine,
            pidfile: Some(opened.pidfile),
            workers: Some(workers),
            latency: LatencyTracker::new(),
            dir: dir.to_path_buf(),
        })
    }

    /// Opens a database at `dir` with default options (equivalent to
    /// `Builder::new().open(dir, flags)`).
    pub fn open(dir: impl AsRef<Path>, flags: OpenFlags) -> Result<Self> {
        Builder::new().open(dir, flags)
    }

    /// Inserts, overwrites, or conditionally writes `key`/`value`.
    /// `expire_seconds` is a delta from now (`0` meaning never), matching
    /// the embedding API's `expire-seconds` input rather than the absolute
    /// timestamp the record itself is stamped with on disk.
    pub fn set(&self, key: &[u8], value: &[u8], flags: SetFlags, expire_seconds: u32) -> Result<()> {
        let now = now_unix();
        let expire = if expire_seconds == 0 { 0 } else { now.saturating_add(expire_seconds) };
        let started = std::time::Instant::now();
        let result = self.engine.set(key, value, flags, expire, now);
        self.latency.observe_write(started.elapsed());
        result
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let started = std::time::Instant::now();
        let result = self.engine.get(key, now_unix());
        self.latency.observe_read(started.elapsed());
        result
    }

    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.engine.del(key, now_unix())
    }

    /// Opens a cursor over every record currently reachable starting at
    /// `start_oid` (`0` for everything), pinning the data segments that
    /// existed at this instant against compaction.
    pub fn iterate_new(&self, start_oid: u64) -> Cursor {
        iter::iterate_new(&self.engine, start_oid)
    }

    /// Drives `cursor`, invoking `callback(key, value, expire, oid)` for
    /// each live record and stopping early the first time it returns
    /// `false`. Returns the number of records the callback saw.
    pub fn iterate(&self, cursor: &Cursor, callback: impl FnMut(&[u8], &[u8], u32, u64) -> bool) -> Result<u64> {
        iter::iterate(&self.engine, cursor, now_unix(), callback)
    }

    pub fn stat(&self) -> Stats {
        stat::stat(&self.engine, &self.latency)
    }

    /// Flushes buffers, stops the background worker, and marks the
    /// database closed so the next open trusts the persisted state instead
    /// of running full crash recovery. A no-op beyond dropping state for an
    /// in-memory database.
    pub fn close(mut self) -> Result<()> {
        if let Some(mut workers) = self.workers.take() {
            workers.shutdown();
        }
        if !self.engine.is_memory() {
            self.engine.persist_header(&self.dir, CLOSED_SIGNATURE)?;
        }
        if let Some(pidfile) = self.pidfile.take() {
            pidfile.release();
        }
        Ok(())
    }

    /// Removes every file belonging to a closed database at `dir`. Refuses
    /// nothing about an open one; callers are responsible for closing
    /// first, the same contract `cdb_destroy` documents.
    pub fn destroy(dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        if kv::is_memory_path(dir) {
            return Ok(());
        }
        match std::fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::FileOpenFailed { path: dir.to_path_buf(), source: e }),
        }
    }
}

impl Drop for Database {
    /// Best-effort safety net: an explicit [`Database::close`] is still the
    /// right way to shut down, since only it can surface a final flush
    /// error and persist the closed signature.
    fn drop(&mut self) {
        if let Some(mut workers) = self.workers.take() {
            workers.shutdown();
        }
        if let Some(pidfile) = self.pidfile.take() {
            pidfile.release();
        }
    }
}

fn now_unix() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}

/// The documented default bucket-table size (spec §6), re-exported for
/// callers that want it without pulling in [`config`] directly.
pub const DEFAULT_HSIZE_HINT: u32 = DEFAULT_HSIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_opens_and_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let db = Builder::new().option(4096, 8, 8).open(dir.path(), OpenFlags::CREAT).unwrap();
        db.set(b"k", b"v", SetFlags::OVERWRITE, 0).unwrap();
        assert_eq!(db.get(b"k").unwrap(), b"v");
        db.close().unwrap();
    }

    #[test]
    fn reopen_after_close_sees_prior_writes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path(), OpenFlags::CREAT).unwrap();
            db.set(b"k", b"v", SetFlags::OVERWRITE, 0).unwrap();
            db.close().unwrap();
        }
        let db = Database::open(dir.path(), OpenFlags::empty()).unwrap();
        assert_eq!(db.get(b"k").unwrap(), b"v");
        db.close().unwrap();
    }

    #[test]
    fn insert_if_not_exist_surfaces_exist_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), OpenFlags::CREAT).unwrap();
        db.set(b"k", b"v1", SetFlags::OVERWRITE, 0).unwrap();
        let err = db.set(b"k", b"v2", SetFlags::INSERT_IF_NOT_EXIST, 0).unwrap_err();
        assert!(matches!(err, Error::Exist));
        db.close().unwrap();
    }

    #[test]
    fn del_then_get_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), OpenFlags::CREAT).unwrap();
        db.set(b"k", b"v", SetFlags::OVERWRITE, 0).unwrap();
        db.del(b"k").unwrap();
        assert!(matches!(db.get(b"k").unwrap_err(), Error::NotFound));
        db.close().unwrap();
    }

    #[test]
    fn expire_seconds_is_relative_to_now() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), OpenFlags::CREAT).unwrap();
        db.set(b"k", b"v", SetFlags::OVERWRITE, 3600).unwrap();
        assert_eq!(db.get(b"k").unwrap(), b"v");
        db.close().unwrap();
    }

    #[test]
    fn iterate_sees_live_records_through_the_public_api() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), OpenFlags::CREAT).unwrap();
        for i in 0..5u32 {
            db.set(format!("k{i}").as_bytes(), b"v", SetFlags::OVERWRITE, 0).unwrap();
        }
        let cursor = db.iterate_new(0);
        let mut seen = 0;
        db.iterate(&cursor, |_, _, _, _| {
            seen += 1;
            true
        })
        .unwrap();
        assert_eq!(seen, 5);
        db.close().unwrap();
    }

    #[test]
    fn memory_database_never_touches_disk() {
        let db = Database::open(kv::MEMORY_PATH, OpenFlags::empty()).unwrap();
        db.set(b"k", b"v", SetFlags::OVERWRITE, 0).unwrap();
        assert_eq!(db.get(b"k").unwrap(), b"v");
        db.close().unwrap();
    }

    #[test]
    fn stat_reports_record_count_after_writes() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), OpenFlags::CREAT).unwrap();
        db.set(b"k", b"v", SetFlags::OVERWRITE, 0).unwrap();
        assert_eq!(db.stat().record_count, 1);
        db.close().unwrap();
    }

    #[test]
    fn destroy_removes_a_closed_database_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let db = Database::open(&path, OpenFlags::CREAT).unwrap();
        db.set(b"k", b"v", SetFlags::OVERWRITE, 0).unwrap();
        db.close().unwrap();
        Database::destroy(&path).unwrap();
        assert!(!path.exists());
    }
}
