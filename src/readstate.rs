//! The read state: what a reader sees.
//!
//! A read state is the pair {memtable queue, current version}, published
//! through an atomic pointer swap. Readers load it without touching the
//! engine mutex; the `Arc` they receive pins every memtable and file the
//! state references until the reader drops it.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::memtable::Memtable;
use crate::version::Version;

pub struct ReadState {
    /// Memtable queue, oldest first; the tail is the mutable one.
    pub memtables: Vec<Arc<Memtable>>,
    pub version: Arc<Version>,
}

pub struct ReadStateHolder {
    inner: ArcSwap<ReadState>,
}

impl ReadStateHolder {
    pub fn new(state: ReadState) -> Self {
        Self {
            inner: ArcSwap::from_pointee(state),
        }
    }

    /// Captures the current read state, pinning it for the caller.
    pub fn load(&self) -> Arc<ReadState> {
        self.inner.load_full()
    }

    /// Publishes a new read state. Single writer, under the engine mutex.
    pub fn publish(&self, state: ReadState) {
        self.inner.store(Arc::new(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::key::InternalKeyCmp;

    #[test]
    fn test_readers_keep_old_state() {
        let cmp = InternalKeyCmp(Arc::new(BytewiseComparator));
        let mem = Arc::new(Memtable::new(cmp.clone(), 1));
        let holder = ReadStateHolder::new(ReadState {
            memtables: vec![Arc::clone(&mem)],
            version: Version::empty(),
        });

        let captured = holder.load();
        let mem2 = Arc::new(Memtable::new(cmp, 2));
        holder.publish(ReadState {
            memtables: vec![mem, mem2],
            version: Version::empty(),
        });

        assert_eq!(captured.memtables.len(), 1);
        assert_eq!(holder.load().memtables.len(), 2);
    }
}
