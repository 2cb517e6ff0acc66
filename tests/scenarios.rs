//! End-to-end scenarios driven entirely through the public `Database`/
//! `Session` surface, with the background provider/compactor threads
//! disabled so compaction and recovery can be exercised deterministically.

use radix_segment_alloc::{AllocError, OpenOptions};
use radix_segment_alloc::config::RuntimeConfig;

fn deterministic_config() -> RuntimeConfig {
    RuntimeConfig {
        segment_size: 4096,
        run_compactor: false,
        run_provider: false,
        ..RuntimeConfig::default()
    }
}

#[test]
fn basic_round_trip_then_modify_in_place_then_modify_across_sync() {
    let db = OpenOptions::new().config(deterministic_config()).open_anon().unwrap();
    let session = db.new_session().unwrap();

    // S1: alloc and read back.
    let addr = session.alloc(&[0xAB; 48]).unwrap();
    {
        let guard = session.read(addr).unwrap();
        assert_eq!(guard.bytes(), &[0xAB; 48][..]);
    }

    // S2: modify with no intervening sync; location doesn't move because
    // the owning segment is still active.
    {
        let mut m = session.modify(addr).unwrap();
        m.bytes_mut().copy_from_slice(&[0xCD; 48]);
    }
    {
        let guard = session.read(addr).unwrap();
        assert_eq!(guard.bytes(), &[0xCD; 48][..]);
    }

    // S3: after a sync finalizes the segment, the next modify must
    // copy-on-write to a fresh location but keep returning the new bytes.
    session.sync().unwrap();
    {
        let mut m = session.modify(addr).unwrap();
        m.bytes_mut().copy_from_slice(&[0xEF; 48]);
    }
    let guard = session.read(addr).unwrap();
    assert_eq!(guard.bytes(), &[0xEF; 48][..]);
}

#[test]
fn compaction_preserves_addresses_after_interleaved_frees() {
    let mut config = deterministic_config();
    config.compaction_threshold = radix_segment_alloc::config::Ratio::new(1, 4);
    let db = OpenOptions::new().config(config).open_anon().unwrap();
    let session = db.new_session().unwrap();

    let mut addrs = Vec::new();
    for i in 0..200u32 {
        let payload = i.to_le_bytes();
        addrs.push(session.alloc(&payload).unwrap());
    }
    // Free every other one so the segments they lived in cross the
    // compaction threshold.
    for (i, addr) in addrs.iter().enumerate() {
        if i % 2 == 0 {
            session.release(*addr);
        }
    }
    session.sync().unwrap();

    let drained = db.compact_once();
    assert!(drained > 0, "expected at least one segment to be drained");

    for (i, addr) in addrs.iter().enumerate() {
        if i % 2 != 0 {
            let guard = session.read(*addr).unwrap();
            assert_eq!(guard.bytes(), &(i as u32).to_le_bytes()[..]);
        }
    }
}

#[test]
fn recovery_after_unclean_shutdown_restores_every_address() {
    let dir = tempfile::tempdir().unwrap();
    let mut addrs = Vec::new();

    {
        let db = OpenOptions::new().config(deterministic_config()).open(dir.path()).unwrap();
        let session = db.new_session().unwrap();
        for i in 0..100u32 {
            addrs.push(session.alloc(&i.to_le_bytes()).unwrap());
        }
        session.sync().unwrap();
        // Simulate a crash: never run `Drop`, so `dbfile.bin` is never
        // marked clean and the next open must run recovery.
        std::mem::forget(db);
    }

    let db = OpenOptions::new().config(deterministic_config()).open(dir.path()).unwrap();
    let session = db.new_session().unwrap();
    for (i, addr) in addrs.iter().enumerate() {
        let guard = session.read(*addr).unwrap();
        assert_eq!(guard.bytes(), &(i as u32).to_le_bytes()[..]);
    }
}

#[test]
fn session_table_rejects_sessions_beyond_the_configured_capacity() {
    let mut config = deterministic_config();
    config.max_sessions = 4;
    let db = OpenOptions::new().config(config).open_anon().unwrap();

    let mut sessions = Vec::new();
    for _ in 0..4 {
        sessions.push(db.new_session().unwrap());
    }

    let err = db.new_session().unwrap_err();
    assert!(matches!(err, AllocError::SessionTableFull { max: 4 }));
}

#[test]
fn a_dropped_session_frees_its_slot_for_reuse() {
    let mut config = deterministic_config();
    config.max_sessions = 4;
    let db = OpenOptions::new().config(config).open_anon().unwrap();

    let mut sessions = Vec::new();
    for _ in 0..4 {
        sessions.push(db.new_session().unwrap());
    }
    db.new_session().unwrap_err();

    // Dropping one of the four concurrently-held sessions frees its slot;
    // this is the 65th-concurrent-not-65th-ever distinction the capacity
    // limit is supposed to enforce.
    sessions.pop();
    db.new_session().unwrap();
}
