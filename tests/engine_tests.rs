use std::sync::Arc;

use basalt::tmpfs::TempDir;
use basalt::{ConcatMergeOperator, Engine, IterOptions, Options};

fn open(dir: &TempDir) -> Engine {
    Engine::open(Options::new(dir.path())).expect("Failed to open engine")
}

fn scan_all(db: &Engine) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut iter = db.new_iter(IterOptions::default()).expect("Failed to create iterator");
    let mut out = vec![];
    let mut ok = iter.first();
    while ok {
        out.push((iter.key().to_vec(), iter.value().to_vec()));
        ok = iter.next();
    }
    iter.close().expect("iterator error");
    out
}

#[test]
fn test_set_get_round_trip() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    db.set(b"k", b"v").expect("set failed");
    assert_eq!(db.get(b"k").expect("get failed"), Some(b"v".to_vec()));
    assert_eq!(db.get(b"missing").expect("get failed"), None);
}

#[test]
fn test_overwrite_returns_latest() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    db.set(b"k", b"v1").expect("set failed");
    db.set(b"k", b"v2").expect("set failed");
    assert_eq!(db.get(b"k").expect("get failed"), Some(b"v2".to_vec()));
}

#[test]
fn test_delete_hides_key() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    db.set(b"k", b"v").expect("set failed");
    db.delete(b"k").expect("delete failed");
    assert_eq!(db.get(b"k").expect("get failed"), None);
}

#[test]
fn test_get_after_flush() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    db.set(b"k", b"v").expect("set failed");
    db.flush().expect("flush failed");
    assert_eq!(db.get(b"k").expect("get failed"), Some(b"v".to_vec()));
    assert!(db.metrics().flushes >= 1);
}

#[test]
fn test_iterator_merges_memtable_and_table() {
    // set a, set b, flush, set a again: the iterator yields the new a
    // from the memtable and b from the flushed table.
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    db.set(b"a", b"1").expect("set failed");
    db.set(b"b", b"2").expect("set failed");
    db.flush().expect("flush failed");
    db.set(b"a", b"3").expect("set failed");

    let all = scan_all(&db);
    assert_eq!(
        all,
        vec![
            (b"a".to_vec(), b"3".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
        ]
    );
}

#[test]
fn test_delete_range_masks_older_only() {
    // delete_range(b, d) then set c: only the later set survives.
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    db.set(b"a", b"keep").expect("set failed");
    db.set(b"b", b"dead").expect("set failed");
    db.set(b"c", b"dead").expect("set failed");
    db.delete_range(b"b", b"d").expect("delete_range failed");
    db.set(b"c", b"x").expect("set failed");

    let all = scan_all(&db);
    assert_eq!(
        all,
        vec![
            (b"a".to_vec(), b"keep".to_vec()),
            (b"c".to_vec(), b"x".to_vec()),
        ]
    );
    assert_eq!(db.get(b"b").expect("get failed"), None);
}

#[test]
fn test_delete_range_survives_flush() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    db.set(b"b", b"dead").expect("set failed");
    db.delete_range(b"a", b"c").expect("delete_range failed");
    db.flush().expect("flush failed");

    assert_eq!(db.get(b"b").expect("get failed"), None);
}

#[test]
fn test_empty_delete_range_is_noop() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    db.set(b"c", b"v").expect("set failed");
    db.delete_range(b"c", b"c").expect("delete_range failed");
    assert_eq!(db.get(b"c").expect("get failed"), Some(b"v".to_vec()));
}

#[test]
fn test_single_delete_pairs_with_one_set() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    db.set(b"k", b"v1").expect("set failed");
    db.set(b"k", b"v2").expect("set failed");
    db.single_delete(b"k").expect("single_delete failed");

    // The newest set is cancelled; the older one resurfaces.
    assert_eq!(db.get(b"k").expect("get failed"), Some(b"v1".to_vec()));
}

#[test]
fn test_merge_folds_operands() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let opts = Options::new(dir.path()).merger(Arc::new(ConcatMergeOperator));
    let db = Engine::open(opts).expect("Failed to open engine");

    db.set(b"k", b"base").expect("set failed");
    db.merge(b"k", b"+1").expect("merge failed");
    db.merge(b"k", b"+2").expect("merge failed");
    assert_eq!(db.get(b"k").expect("get failed"), Some(b"base+1+2".to_vec()));

    // Merge with no base.
    db.merge(b"fresh", b"x").expect("merge failed");
    assert_eq!(db.get(b"fresh").expect("get failed"), Some(b"x".to_vec()));
}

#[test]
fn test_merge_without_operator_rejected() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);
    assert!(db.merge(b"k", b"v").is_err());
}

#[test]
fn test_batch_commits_atomically() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    let mut batch = db.new_batch();
    batch.set(b"a", b"1").set(b"b", b"2").delete(b"c");
    db.set(b"c", b"pre").expect("set failed");
    db.apply(batch).expect("apply failed");

    assert_eq!(db.get(b"a").expect("get failed"), Some(b"1".to_vec()));
    assert_eq!(db.get(b"b").expect("get failed"), Some(b"2".to_vec()));
    assert_eq!(db.get(b"c").expect("get failed"), None);
}

#[test]
fn test_indexed_batch_read_your_writes() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    db.set(b"a", b"committed").expect("set failed");
    db.set(b"b", b"committed").expect("set failed");

    let mut batch = db.new_indexed_batch();
    batch.set(b"a", b"pending").delete(b"b").set(b"c", b"new");

    let opts = IterOptions {
        batch: Some(&batch),
        ..Default::default()
    };
    let mut iter = db.new_iter(opts).expect("Failed to create iterator");
    let mut seen = vec![];
    let mut ok = iter.first();
    while ok {
        seen.push((iter.key().to_vec(), iter.value().to_vec()));
        ok = iter.next();
    }
    assert_eq!(
        seen,
        vec![
            (b"a".to_vec(), b"pending".to_vec()),
            (b"c".to_vec(), b"new".to_vec()),
        ]
    );
    drop(iter);

    // The batch was never committed; the database is unchanged.
    assert_eq!(db.get(b"a").expect("get failed"), Some(b"committed".to_vec()));
    assert_eq!(db.get(b"c").expect("get failed"), None);
}

#[test]
fn test_log_data_invisible_to_reads() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    db.log_data(b"replication marker").expect("log_data failed");
    db.set(b"k", b"v").expect("set failed");
    assert_eq!(scan_all(&db).len(), 1);
}

#[test]
fn test_range_keys_surface_and_mask() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);

    db.set(b"m@3", b"point").expect("set failed");
    db.range_key_set(b"a", b"z", b"@5", b"span").expect("range_key_set failed");

    let mut iter = db.new_iter(IterOptions::default()).expect("Failed to create iterator");
    assert!(iter.first());
    assert_eq!(iter.key(), b"m@3");
    let spans = iter.range_keys();
    assert_eq!(spans, vec![(b"@5".to_vec(), b"span".to_vec())]);
    drop(iter);

    // With default (whole-key-prefix) splitting, the point suffix is
    // empty and masking hides nothing.
    let opts = IterOptions {
        range_key_masking: true,
        ..Default::default()
    };
    let mut iter = db.new_iter(opts).expect("Failed to create iterator");
    assert!(iter.first());
    drop(iter);

    db.range_key_unset(b"a", b"z", b"@5").expect("range_key_unset failed");
    let mut iter = db.new_iter(IterOptions::default()).expect("Failed to create iterator");
    assert!(iter.first());
    assert!(iter.range_keys().is_empty());
}

#[test]
fn test_close_rejects_further_writes() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);
    db.set(b"k", b"v").expect("set failed");
    db.close().expect("close failed");
    assert!(db.set(b"k2", b"v2").is_err());
    assert!(db.get(b"k").is_err());
    // Idempotent.
    db.close().expect("close failed");
}

#[test]
fn test_read_only_rejects_writes() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    {
        let db = open(&dir);
        db.set(b"k", b"v").expect("set failed");
        db.flush().expect("flush failed");
    }

    let db = Engine::open(Options::new(dir.path()).read_only(true))
        .expect("Failed to open read-only");
    assert_eq!(db.get(b"k").expect("get failed"), Some(b"v".to_vec()));
    assert!(db.set(b"x", b"y").is_err());
    assert!(db.flush().is_err());
}

#[test]
fn test_second_open_fails_while_locked() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let _db = open(&dir);
    assert!(Engine::open(Options::new(dir.path())).is_err());
}

#[tokio::test]
async fn test_async_flush() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open(&dir);
    db.set(b"k", b"v").expect("set failed");

    let rx = db.async_flush().expect("async_flush failed");
    rx.await.expect("flush worker gone").expect("flush failed");
    assert!(db.metrics().flushes >= 1);
    assert_eq!(db.get(b"k").expect("get failed"), Some(b"v".to_vec()));
}
