//! Crash recovery: rebuilding memtables from WAL segments.
//!
//! The manifest's `log_num` bounds what matters: segments below it are
//! fully covered by flushed tables and are deleted; segments at or above
//! it are replayed batch by batch into one memtable per segment,
//! preserving the invariant that no two memtables share a WAL segment.
//! Replay of a segment stops at the first torn or corrupt record, which
//! marks the crash point.

use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::batch::Batch;
use crate::commit::apply_payload;
use crate::error::Result;
use crate::key::{InternalKeyCmp, SeqNum};
use crate::memtable::Memtable;
use crate::wal::{self, Wal};

/// Replays WAL segments >= `min_log`, returning the recovered immutable
/// memtables (oldest first) and the highest sequence number seen.
pub(crate) fn recover_memtables(
    dir: &Path,
    min_log: u64,
    cmp: InternalKeyCmp,
    read_only: bool,
) -> Result<(Vec<Arc<Memtable>>, SeqNum)> {
    let mut memtables = Vec::new();
    let mut max_seq: SeqNum = 0;

    for num in wal::list_segments(dir)? {
        if num < min_log {
            if !read_only {
                let path = wal::wal_path(dir, num);
                if let Err(err) = std::fs::remove_file(&path) {
                    tracing::warn!(num, error = %err, "failed to delete stale wal segment");
                } else {
                    tracing::info!(num, "deleted stale wal segment");
                }
            }
            continue;
        }

        let mem = Arc::new(Memtable::new(cmp.clone(), num));
        let mut batches = 0u64;
        for record in Wal::replay(dir, num)? {
            let payload = record?;
            let count = Batch::decoded_count(&payload)?;
            let base = BigEndian::read_u64(&payload[0..8]);
            apply_payload(&mem, base, &payload)?;
            if count > 0 {
                max_seq = max_seq.max(base + count as u64 - 1);
            }
            batches += 1;
        }
        tracing::info!(num, batches, "replayed wal segment");

        if mem.is_empty() {
            // Nothing to flush; the segment carried no surviving data.
            if !read_only {
                let path = wal::wal_path(dir, num);
                if let Err(err) = std::fs::remove_file(&path) {
                    tracing::warn!(num, error = %err, "failed to delete empty wal segment");
                }
            }
            continue;
        }
        mem.mark_immutable();
        memtables.push(mem);
    }

    Ok((memtables, max_seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::key::decode_key;
    use crate::tmpfs::TempDir;

    fn cmp() -> InternalKeyCmp {
        InternalKeyCmp(Arc::new(BytewiseComparator))
    }

    fn write_segment(dir: &Path, num: u64, batches: &[(u64, Vec<(&[u8], &[u8])>)]) {
        let wal = Wal::create(dir, num).expect("Failed to create wal");
        for (base, ops) in batches {
            let mut batch = Batch::new();
            for (key, value) in ops {
                batch.set(key, value);
            }
            batch.finalize(*base);
            wal.append(batch.payload(), true).expect("append failed");
        }
    }

    #[test]
    fn test_replay_rebuilds_memtables() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir_all(dir.path().join("wal")).expect("Failed to create wal dir");
        write_segment(dir.path(), 1, &[(1, vec![(b"a", b"1"), (b"b", b"2")])]);
        write_segment(dir.path(), 2, &[(3, vec![(b"c", b"3")])]);

        let (mems, max_seq) =
            recover_memtables(dir.path(), 0, cmp(), false).expect("recover failed");
        assert_eq!(mems.len(), 2);
        assert_eq!(max_seq, 3);
        assert_eq!(mems[0].wal_num(), 1);
        assert_eq!(mems[1].wal_num(), 2);

        use crate::iterator::InternalIterator;
        use crate::memtable::MemtableIter;
        let mut iter = MemtableIter::new(Arc::clone(&mems[0]));
        iter.first().expect("first failed");
        let (user, seq, _) = decode_key(iter.key()).expect("decode failed");
        assert_eq!((user, seq), (&b"a"[..], 1));
    }

    #[test]
    fn test_stale_segments_deleted() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir_all(dir.path().join("wal")).expect("Failed to create wal dir");
        write_segment(dir.path(), 1, &[(1, vec![(b"a", b"1")])]);
        write_segment(dir.path(), 5, &[(9, vec![(b"z", b"9")])]);

        let (mems, max_seq) =
            recover_memtables(dir.path(), 5, cmp(), false).expect("recover failed");
        assert_eq!(mems.len(), 1);
        assert_eq!(max_seq, 9);
        assert!(!wal::wal_path(dir.path(), 1).exists());
    }

    #[test]
    fn test_empty_segment_removed() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir_all(dir.path().join("wal")).expect("Failed to create wal dir");
        Wal::create(dir.path(), 3).expect("Failed to create wal");

        let (mems, _) = recover_memtables(dir.path(), 0, cmp(), false).expect("recover failed");
        assert!(mems.is_empty());
        assert!(!wal::wal_path(dir.path(), 3).exists());
    }
}
