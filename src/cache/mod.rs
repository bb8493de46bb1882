//! Shared caches for raw data blocks and open SST readers.
//!
//! One `Cache` may back several engines on the same host. Each engine
//! attaches through a [`CacheHandle`], whose id namespaces every key so
//! engines with colliding file numbers cannot see each other's entries.
//!
//! Both caches are partitioned into `4 × logical CPUs` shards (rounded up
//! to a power of two); the low bits of an xxh3 hash of the key route to a
//! shard, and each shard holds its own index, Clock-PRO state, and lock.

pub mod block;
pub mod clock;
pub mod file;
pub mod value;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use block::{BlockCache, BlockKey};
pub use file::FileCache;
pub use value::CacheValue;

/// Identifies one engine's namespace inside a shared cache.
pub type HandleId = u64;

pub(crate) fn shard_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (4 * cpus).next_power_of_two()
}

/// A block cache and file cache pair, shareable across engines.
pub struct Cache {
    block: BlockCache,
    files: FileCache,
    next_handle: AtomicU64,
}

impl Cache {
    /// Creates a cache with `block_bytes` of block capacity and an open
    /// reader budget of `max_open_files`.
    pub fn new(block_bytes: usize, max_open_files: usize) -> Arc<Self> {
        Arc::new(Self {
            block: BlockCache::new(block_bytes),
            files: FileCache::new(max_open_files),
            next_handle: AtomicU64::new(1),
        })
    }

    /// Attaches a new engine namespace.
    pub fn handle(self: &Arc<Self>) -> CacheHandle {
        CacheHandle {
            cache: Arc::clone(self),
            id: self.next_handle.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn block(&self) -> &BlockCache {
        &self.block
    }

    pub fn files(&self) -> &FileCache {
        &self.files
    }
}

/// An engine's view of the shared cache.
#[derive(Clone)]
pub struct CacheHandle {
    cache: Arc<Cache>,
    id: HandleId,
}

impl CacheHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn block(&self) -> &BlockCache {
        &self.cache.block
    }

    pub fn files(&self) -> &FileCache {
        &self.cache.files
    }

    /// Purges every cached block and the open reader for a deleted file.
    pub fn evict_file(&self, file_num: u64) {
        let blocks = self.cache.block.evict_file(self.id, file_num);
        self.cache.files.evict(self.id, file_num);
        if blocks > 0 {
            tracing::debug!(file_num, blocks, "evicted cache entries for deleted file");
        }
    }

    /// Releases everything this handle ever cached. Called on engine close.
    pub fn evict_all(&self) {
        self.cache.block.evict_handle(self.id);
        self.cache.files.evict_handle(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_distinct() {
        let cache = Cache::new(1 << 20, 16);
        let a = cache.handle();
        let b = cache.handle();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_handle_namespacing() {
        let cache = Cache::new(1 << 20, 16);
        let a = cache.handle();
        let b = cache.handle();

        a.block()
            .insert(BlockKey::new(a.id(), 7, 0), b"block-a")
            .expect("Failed to insert");

        // Same (file, offset) under another handle is a distinct entry.
        assert!(b.block().get(&BlockKey::new(b.id(), 7, 0)).is_none());
        assert!(a.block().get(&BlockKey::new(a.id(), 7, 0)).is_some());
    }
}
