//! Snapshots: read views pinned at a visible sequence number.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::db::EngineCore;
use crate::error::Result;
use crate::iterator::user::{Iter, IterOptions};
use crate::key::SeqNum;
use crate::readstate::ReadState;

/// Registry of live snapshot sequence numbers, oldest first. Retention
/// decisions (which versions and memtables may be reclaimed) consult the
/// oldest live entry.
#[derive(Default)]
pub(crate) struct SnapshotList {
    inner: Mutex<BTreeMap<SeqNum, usize>>,
}

impl SnapshotList {
    pub fn register(&self, seq: SeqNum) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner.entry(seq).or_insert(0) += 1;
        }
    }

    pub fn unregister(&self, seq: SeqNum) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(count) = inner.get_mut(&seq) {
                *count -= 1;
                if *count == 0 {
                    inner.remove(&seq);
                }
            }
        }
    }

    /// The oldest live snapshot sequence, if any.
    pub fn oldest(&self) -> Option<SeqNum> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.keys().next().copied())
    }

    pub fn count(&self) -> usize {
        self.inner.lock().map(|inner| inner.len()).unwrap_or(0)
    }
}

/// A consistent read view. Repeated reads through one snapshot observe
/// identical data regardless of concurrent writes, flushes, or version
/// changes; the captured read state pins its memtables and files.
pub struct Snapshot {
    core: Arc<EngineCore>,
    read_state: Arc<ReadState>,
    seq: SeqNum,
}

impl Snapshot {
    pub(crate) fn new(core: Arc<EngineCore>, read_state: Arc<ReadState>, seq: SeqNum) -> Self {
        core.snapshots().register(seq);
        Self {
            core,
            read_state,
            seq,
        }
    }

    /// The visible sequence number this snapshot was captured at.
    pub fn seq(&self) -> SeqNum {
        self.seq
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.core.get_at(&self.read_state, self.seq, key)
    }

    pub fn iter<'a>(&self, opts: IterOptions<'a>) -> Result<Iter<'a>> {
        self.core
            .build_iter(Arc::clone(&self.read_state), self.seq, opts)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.core.snapshots().unregister(self.seq);
    }
}
