//! The file cache: open SST readers keyed by (handle, file number).
//!
//! Misses are single-flight: concurrent readers of the same file block on
//! one opener, and everyone receives the reader the winner produced.
//! Eviction drops the cache's reference; readers stay open until the last
//! outstanding iterator releases its own reference.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use xxhash_rust::xxh3::xxh3_64;

use super::clock::ClockShard;
use super::{shard_count, HandleId};
use crate::error::Result;
use crate::sstable::reader::TableReader;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FileKey {
    handle: HandleId,
    file_num: u64,
}

impl FileKey {
    fn hash(&self) -> u64 {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.handle.to_le_bytes());
        buf[8..].copy_from_slice(&self.file_num.to_le_bytes());
        xxh3_64(&buf)
    }
}

/// One file's slot. The mutex is the single-flight latch: the opener
/// holds it across the open, losers queue on it and find the reader.
struct FileNode {
    slot: Mutex<Option<Arc<TableReader>>>,
}

pub struct FileCache {
    shards: Vec<Mutex<ClockShard<FileKey, Arc<FileNode>>>>,
    mask: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FileCache {
    pub fn new(max_open_files: usize) -> Self {
        let count = shard_count();
        let per_shard = (max_open_files / count).max(1);
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

    fn shard(&self, key: &FileKey) -> &Mutex<ClockShard<FileKey, Arc<FileNode>>> {
        &self.shards[(key.hash() & self.mask) as usize]
    }

    /// Returns the open reader for a file, opening it at most once across
    /// concurrent callers.
    pub fn find_or_create<F>(
        &self,
        handle: HandleId,
        file_num: u64,
        open: F,
    ) -> Result<Arc<TableReader>>
    where
        F: FnOnce() -> Result<TableReader>,
    {
        let key = FileKey { handle, file_num };
        let node = {
            let mut shard = self.shard(&key).lock()?;
            match shard.get(&key) {
                Some(node) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    node
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let node = Arc::new(FileNode {
                        slot: Mutex::new(None),
                    });
                    shard.insert(key.clone(), Arc::clone(&node), 1);
                    node
                }
            }
        };

        let mut slot = node.slot.lock()?;
        if let Some(reader) = slot.as_ref() {
            return Ok(Arc::clone(reader));
        }
        match open() {
            Ok(reader) => {
                let reader = Arc::new(reader);
                *slot = Some(Arc::clone(&reader));
                Ok(reader)
            }
            Err(err) => {
                // Drop the node so the next caller retries the open.
                drop(slot);
                if let Ok(mut shard) = self.shard(&key).lock() {
                    shard.erase(&key);
                }
                Err(err)
            }
        }
    }

    /// Drops the cached reader for a file, if any.
    pub fn evict(&self, handle: HandleId, file_num: u64) {
        let key = FileKey { handle, file_num };
        if let Ok(mut shard) = self.shard(&key).lock() {
            shard.erase(&key);
        }
    }

    /// Drops every cached reader for an engine namespace.
    pub fn evict_handle(&self, handle: HandleId) {
        for shard in &self.shards {
            if let Ok(mut shard) = shard.lock() {
                shard.erase_matching(|k| k.handle == handle);
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
