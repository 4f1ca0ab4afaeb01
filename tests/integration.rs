//! End-to-end coverage over the public `Database`/`Builder` API, one test
//! per seed scenario. Scenario 5 (data-compaction reclaiming an expired
//! segment) is exercised at the unit level in `workers.rs`, since the
//! compaction entry points aren't part of the public surface.

use cuttkv::{Builder, Database, Error, OpenFlags, SetFlags};

#[test]
fn scenario_1_write_close_reopen_read() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Builder::new().option(4096, 8, 8).open(dir.path(), OpenFlags::CREAT).unwrap();
        db.set(b"k", b"v", SetFlags::OVERWRITE, 0).unwrap();
        db.close().unwrap();
    }
    let db = Database::open(dir.path(), OpenFlags::empty()).unwrap();
    assert_eq!(db.get(b"k").unwrap(), b"v");
    db.close().unwrap();
}

#[test]
fn scenario_2_insert_if_not_exist_leaves_prior_value_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path(), OpenFlags::CREAT).unwrap();
    db.set(b"k", b"v1", SetFlags::OVERWRITE, 0).unwrap();
    let err = db.set(b"k", b"v2", SetFlags::INSERT_IF_NOT_EXIST, 0).unwrap_err();
    assert!(matches!(err, Error::Exist));
    assert_eq!(db.get(b"k").unwrap(), b"v1");
    db.close().unwrap();
}

#[test]
fn scenario_3_bloom_filter_avoids_page_reads_for_absent_keys() {
    let dir = tempfile::tempdir().unwrap();
    let db = Builder::new()
        .option(4096, 8, 8)
        .option_bloom(100_000)
        .open(dir.path(), OpenFlags::CREAT)
        .unwrap();

    for i in 0..1_000u32 {
        let key = format!("present-{i}");
        db.set(key.as_bytes(), b"v", SetFlags::OVERWRITE, 0).unwrap();
    }

    for i in 0..1_000u32 {
        let key = format!("absent-{i}");
        assert!(matches!(db.get(key.as_bytes()).unwrap_err(), Error::NotFound));
    }

    let stats = db.stat();
    assert!(stats.bloom_negatives >= 990, "bloom_negatives={}", stats.bloom_negatives);
    assert_eq!(stats.page_disk_reads, 0);
    db.close().unwrap();
}

#[test]
fn scenario_4_many_distinct_keys_roll_segments_over() {
    let dir = tempfile::tempdir().unwrap();
    let opened = cuttkv::recovery::open(
        dir.path(),
        cuttkv::Options::default().with_hsize(1 << 20),
        OpenFlags::CREAT,
    )
    .unwrap();
    let engine = opened.engine;

    let value = vec![7u8; 1_400];
    for i in 0..200_000u32 {
        let key = format!("key-{i:08}");
        engine.set(key.as_bytes(), &value, SetFlags::OVERWRITE, 0, 0).unwrap();
    }

    let store = engine.store().unwrap();
    let segments = store.data_segments_in_oid_order();
    let full = segments.iter().filter(|s| s.status() == cuttkv::segment::SegStatus::Full).count();
    let writing = segments.iter().filter(|s| s.status() == cuttkv::segment::SegStatus::Writing).count();
    assert!(full >= 2, "expected >= 2 FULL data segments, got {full}");
    assert_eq!(writing, 1, "expected exactly 1 WRITING data segment, got {writing}");

    engine.persist_header(dir.path(), cuttkv::mainfile::CLOSED_SIGNATURE).unwrap();
    opened.pidfile.release();
}

#[test]
fn scenario_6_crash_without_close_recovers_every_record() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(dir.path(), OpenFlags::CREAT).unwrap();
        for i in 0..1_000u32 {
            let key = format!("k{i}");
            db.set(key.as_bytes(), b"v", SetFlags::OVERWRITE, 0).unwrap();
        }
        // Leak the handle instead of calling close(): simulates a process
        // that dies before its Drop/close can run, leaving the open
        // signature and pid file exactly as a crash would.
        std::mem::forget(db);
    }
    std::fs::remove_file(dir.path().join("pid.cdb")).unwrap();

    assert!(!dir.path().join("force_recovery").exists());
    let db = Database::open(dir.path(), OpenFlags::empty()).unwrap();
    assert_eq!(db.stat().record_count, 1_000);

    let cursor = db.iterate_new(0);
    let mut seen = 0u64;
    db.iterate(&cursor, |_, _, _, _| {
        seen += 1;
        true
    })
    .unwrap();
    assert_eq!(seen, 1_000);
    db.close().unwrap();
}
