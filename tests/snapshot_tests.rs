use basalt::tmpfs::TempDir;
use basalt::{Engine, IterOptions, Options};

fn open(dir: &TempDir) -> Engine {
    Engine::open(Options::new(dir.path())).expect("Failed to open engine")
}

#[test]
fn test_snapshot_isolated_from_later_delete() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    db.set(b"a", b"1").expect("set failed");
    let snapshot = db.new_snapshot().expect("snapshot failed");
    db.delete(b"a").expect("delete failed");

    assert_eq!(snapshot.get(b"a").expect("get failed"), Some(b"1".to_vec()));
    assert_eq!(db.get(b"a").expect("get failed"), None);
}

#[test]
fn test_snapshot_isolated_from_later_writes() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    db.set(b"k", b"old").expect("set failed");
    let snapshot = db.new_snapshot().expect("snapshot failed");
    db.set(b"k", b"new").expect("set failed");
    db.set(b"extra", b"x").expect("set failed");

    assert_eq!(snapshot.get(b"k").expect("get failed"), Some(b"old".to_vec()));
    assert_eq!(snapshot.get(b"extra").expect("get failed"), None);
    assert_eq!(db.get(b"k").expect("get failed"), Some(b"new".to_vec()));
}

#[test]
fn test_snapshot_survives_flush() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    db.set(b"k", b"before").expect("set failed");
    let snapshot = db.new_snapshot().expect("snapshot failed");
    db.set(b"k", b"after").expect("set failed");
    db.flush().expect("flush failed");

    // The snapshot's memtables were flushed out from under it; the
    // pinned read state keeps them readable.
    assert_eq!(
        snapshot.get(b"k").expect("get failed"),
        Some(b"before".to_vec())
    );
}

#[test]
fn test_repeated_gets_are_stable() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    for i in 0..50u32 {
        db.set(format!("key_{i}").as_bytes(), i.to_string().as_bytes())
            .expect("set failed");
    }
    let snapshot = db.new_snapshot().expect("snapshot failed");
    let first: Vec<_> = (0..50u32)
        .map(|i| snapshot.get(format!("key_{i}").as_bytes()).expect("get failed"))
        .collect();

    for i in 0..50u32 {
        db.set(format!("key_{i}").as_bytes(), b"mutated").expect("set failed");
    }
    let second: Vec<_> = (0..50u32)
        .map(|i| snapshot.get(format!("key_{i}").as_bytes()).expect("get failed"))
        .collect();
    assert_eq!(first, second);
}

#[test]
fn test_snapshot_iterator_sees_capture_time_state() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    db.set(b"a", b"1").expect("set failed");
    db.set(b"b", b"2").expect("set failed");
    let snapshot = db.new_snapshot().expect("snapshot failed");
    db.delete(b"a").expect("delete failed");
    db.set(b"c", b"3").expect("set failed");

    let mut iter = snapshot.iter(IterOptions::default()).expect("iter failed");
    let mut seen = vec![];
    let mut ok = iter.first();
    while ok {
        seen.push(iter.key().to_vec());
        ok = iter.next();
    }
    assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
}

#[test]
fn test_snapshot_sequence_is_monotonic() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    let s1 = db.new_snapshot().expect("snapshot failed");
    db.set(b"k", b"v").expect("set failed");
    let s2 = db.new_snapshot().expect("snapshot failed");
    assert!(s2.seq() > s1.seq());

    // Without intervening writes, sequences are unchanged.
    let s3 = db.new_snapshot().expect("snapshot failed");
    assert_eq!(s2.seq(), s3.seq());
}

#[test]
fn test_snapshot_of_range_delete() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    db.set(b"b", b"1").expect("set failed");
    let snapshot = db.new_snapshot().expect("snapshot failed");
    db.delete_range(b"a", b"c").expect("delete_range failed");

    assert_eq!(snapshot.get(b"b").expect("get failed"), Some(b"1".to_vec()));
    assert_eq!(db.get(b"b").expect("get failed"), None);
}
