use basalt::tmpfs::TempDir;
use basalt::{Engine, IterOptions, Options, SyncMode};

fn reopen(dir: &TempDir) -> Engine {
    Engine::open(Options::new(dir.path()).wal_sync(SyncMode::PerBatch))
        .expect("Failed to open engine")
}

#[test]
fn test_unflushed_writes_survive_restart() {
    // set, "crash" before flush, restart: the value comes back from WAL
    // replay under per-batch sync.
    let dir = TempDir::new().expect("Failed to create temp dir");
    {
        let db = reopen(&dir);
        db.set(b"k", b"v").expect("set failed");
        // Dropped without flush; the WAL is the only copy.
    }
    let db = reopen(&dir);
    assert_eq!(db.get(b"k").expect("get failed"), Some(b"v".to_vec()));
}

#[test]
fn test_flushed_and_unflushed_mix() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    {
        let db = reopen(&dir);
        db.set(b"flushed", b"1").expect("set failed");
        db.flush().expect("flush failed");
        db.set(b"pending", b"2").expect("set failed");
    }
    let db = reopen(&dir);
    assert_eq!(db.get(b"flushed").expect("get failed"), Some(b"1".to_vec()));
    assert_eq!(db.get(b"pending").expect("get failed"), Some(b"2".to_vec()));
}

#[test]
fn test_deletes_survive_restart() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    {
        let db = reopen(&dir);
        db.set(b"k", b"v").expect("set failed");
        db.flush().expect("flush failed");
        db.delete(b"k").expect("delete failed");
    }
    let db = reopen(&dir);
    assert_eq!(db.get(b"k").expect("get failed"), None);
}

#[test]
fn test_sequence_numbers_never_reused() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let first_seq;
    {
        let db = reopen(&dir);
        db.set(b"a", b"1").expect("set failed");
        db.set(b"b", b"2").expect("set failed");
        first_seq = db.new_snapshot().expect("snapshot failed").seq();
    }
    let db = reopen(&dir);
    let recovered_seq = db.new_snapshot().expect("snapshot failed").seq();
    assert!(
        recovered_seq >= first_seq,
        "sequence went backwards across restart: {recovered_seq} < {first_seq}"
    );
    db.set(b"c", b"3").expect("set failed");
    assert!(db.new_snapshot().expect("snapshot failed").seq() > recovered_seq);
}

#[test]
fn test_torn_wal_tail_drops_only_last_batch() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    {
        let db = reopen(&dir);
        db.set(b"safe", b"1").expect("set failed");
        db.set(b"torn", b"2").expect("set failed");
    }

    // Truncate the newest WAL segment mid-record to simulate a crash
    // during the final append.
    let wal_dir = dir.path().join("wal");
    let mut segments: Vec<_> = std::fs::read_dir(&wal_dir)
        .expect("Failed to read wal dir")
        .map(|e| e.expect("dir entry").path())
        .collect();
    segments.sort();
    let newest = segments.last().expect("expected a wal segment");
    let len = std::fs::metadata(newest).expect("Failed to stat").len();
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(newest)
        .expect("Failed to open");
    file.set_len(len - 3).expect("Failed to truncate");

    let db = reopen(&dir);
    assert_eq!(db.get(b"safe").expect("get failed"), Some(b"1".to_vec()));
    assert_eq!(db.get(b"torn").expect("get failed"), None);
    // The engine keeps working after the torn tail.
    db.set(b"after", b"3").expect("set failed");
    assert_eq!(db.get(b"after").expect("get failed"), Some(b"3".to_vec()));
}

#[test]
fn test_restart_preserves_iteration_order() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let keys: Vec<String> = (0..200).map(|i| format!("key_{i:04}")).collect();
    {
        let db = reopen(&dir);
        for (i, key) in keys.iter().enumerate() {
            db.set(key.as_bytes(), i.to_string().as_bytes()).expect("set failed");
            if i == 100 {
                db.flush().expect("flush failed");
            }
        }
    }

    let db = reopen(&dir);
    let mut iter = db
        .new_iter(IterOptions::default())
        .expect("Failed to create iterator");
    let mut seen = vec![];
    let mut ok = iter.first();
    while ok {
        seen.push(String::from_utf8(iter.key().to_vec()).expect("utf8"));
        ok = iter.next();
    }
    iter.close().expect("iterator error");
    assert_eq!(seen, keys);
}

#[test]
fn test_range_delete_survives_restart() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    {
        let db = reopen(&dir);
        db.set(b"b", b"dead").expect("set failed");
        db.set(b"e", b"alive").expect("set failed");
        db.delete_range(b"a", b"d").expect("delete_range failed");
    }
    let db = reopen(&dir);
    assert_eq!(db.get(b"b").expect("get failed"), None);
    assert_eq!(db.get(b"e").expect("get failed"), Some(b"alive".to_vec()));
}
