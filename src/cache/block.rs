//! The block cache: raw SST blocks keyed by (handle, file, offset).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use xxhash_rust::xxh3::xxh3_64;

use super::clock::ClockShard;
use super::value::CacheValue;
use super::{shard_count, HandleId};
use crate::error::Result;

/// Cache key for one data block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub handle: HandleId,
    pub file_num: u64,
    pub offset: u64,
}

impl BlockKey {
    pub fn new(handle: HandleId, file_num: u64, offset: u64) -> Self {
        Self {
            handle,
            file_num,
            offset,
        }
    }

    fn hash(&self) -> u64 {
        let mut buf = [0u8; 24];
        buf[..8].copy_from_slice(&self.handle.to_le_bytes());
        buf[8..16].copy_from_slice(&self.file_num.to_le_bytes());
        buf[16..].copy_from_slice(&self.offset.to_le_bytes());
        xxh3_64(&buf)
    }
}

pub struct BlockCache {
    shards: Vec<Mutex<ClockShard<BlockKey, CacheValue>>>,
    mask: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        let count = shard_count();
        let per_shard = (capacity / count).max(1);
        let shards = (0..count)
            .map(|_| Mutex::new(ClockShard::new(per_shard)))
            .collect();
        Self {
            shards,
            mask: count as u64 - 1,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &BlockKey) -> &Mutex<ClockShard<BlockKey, CacheValue>> {
        &self.shards[(key.hash() & self.mask) as usize]
    }

    /// Looks up a block, pinning the value for the caller on a hit.
    pub fn get(&self, key: &BlockKey) -> Option<CacheValue> {
        let value = self.shard(key).lock().ok()?.get(key);
        match &value {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        value
    }

    /// Copies `data` into a refcounted value, inserts it, and returns the
    /// caller's pin. Allocation failure surfaces as `CacheFull` so readers
    /// can fall back to an uncached buffer.
    pub fn insert(&self, key: BlockKey, data: &[u8]) -> Result<CacheValue> {
        let value = CacheValue::new(data)?;
        let charge = value.len();
        self.shard(&key)
            .lock()?
            .insert(key, value.clone(), charge);
        Ok(value)
    }

    /// Removes every block belonging to `file_num` under `handle`.
    pub fn evict_file(&self, handle: HandleId, file_num: u64) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            if let Ok(mut shard) = shard.lock() {
                removed +=
                    shard.erase_matching(|k| k.handle == handle && k.file_num == file_num);
            }
        }
        removed
    }

    /// Removes every block belonging to `handle`.
    pub fn evict_handle(&self, handle: HandleId) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            if let Ok(mut shard) = shard.lock() {
                removed += shard.erase_matching(|k| k.handle == handle);
            }
        }
        removed
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
