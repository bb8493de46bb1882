use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::Cache;
use crate::comparator::{BytewiseComparator, Comparator, MergeOperator};
use crate::error::{Error, Result};

/// WAL durability policy for committed batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Never fsync; durability rides on the OS page cache.
    Off,
    /// Fsync after every committed batch.
    PerBatch,
    /// Fsync once per commit group; the group leader amortizes the sync
    /// across every batch in its group.
    Group,
}

/// Configuration for an engine.
#[derive(Clone)]
pub struct Options {
    /// Directory path for the database.
    pub dir: PathBuf,

    /// User-key ordering. Persisted by name; must match on reopen.
    pub comparator: Arc<dyn Comparator>,

    /// Merge operator for `Merge` records. Engines without one reject
    /// `merge()` writes.
    pub merger: Option<Arc<dyn MergeOperator>>,

    /// Shared cache (block + file) to attach to. When absent the engine
    /// builds a private cache of `cache_size` bytes.
    pub cache: Option<Arc<Cache>>,

    /// Block cache capacity in bytes when no shared cache is supplied
    /// (default: 8MB).
    pub cache_size: usize,

    /// Maximum memtable size before rotation (default: 4MB).
    pub memtable_size: usize,

    /// Number of immutable memtables pending flush before writes stall
    /// (default: 4).
    pub max_immutable_memtables: usize,

    /// WAL sync policy (default: Group).
    pub wal_sync: SyncMode,

    /// Open SST reader budget for the file cache (default: 256).
    pub max_open_files: usize,

    /// Target uncompressed data block size (default: 4KB).
    pub block_size: usize,

    /// Restart point interval inside data blocks (default: 16).
    pub block_restart_interval: usize,

    /// Bloom filter bits per key; 0 disables filters (default: 10).
    pub bloom_bits_per_key: usize,

    /// Open the database without accepting writes or creating a WAL.
    pub read_only: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./basalt"),
            comparator: Arc::new(BytewiseComparator),
            merger: None,
            cache: None,
            cache_size: 8 * 1024 * 1024,
            memtable_size: 4 * 1024 * 1024,
            max_immutable_memtables: 4,
            wal_sync: SyncMode::Group,
            max_open_files: 256,
            block_size: 4096,
            block_restart_interval: 16,
            bloom_bits_per_key: 10,
            read_only: false,
        }
    }
}

impl Options {
    /// Create options rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn merger(mut self, merger: Arc<dyn MergeOperator>) -> Self {
        self.merger = Some(merger);
        self
    }

    pub fn cache(mut self, cache: Arc<Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache_size(mut self, bytes: usize) -> Self {
        self.cache_size = bytes;
        self
    }

    pub fn memtable_size(mut self, bytes: usize) -> Self {
        self.memtable_size = bytes;
        self
    }

    pub fn max_immutable_memtables(mut self, count: usize) -> Self {
        self.max_immutable_memtables = count;
        self
    }

    pub fn wal_sync(mut self, mode: SyncMode) -> Self {
        self.wal_sync = mode;
        self
    }

    pub fn max_open_files(mut self, count: usize) -> Self {
        self.max_open_files = count;
        self
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn block_restart_interval(mut self, interval: usize) -> Self {
        self.block_restart_interval = interval;
        self
    }

    pub fn bloom_bits_per_key(mut self, bits: usize) -> Self {
        self.bloom_bits_per_key = bits;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.memtable_size < 4096 {
            return Err(Error::InvalidArgument(
                "memtable_size must be at least 4096 bytes".to_string(),
            ));
        }
        if self.max_immutable_memtables == 0 {
            return Err(Error::InvalidArgument(
                "max_immutable_memtables must be at least 1".to_string(),
            ));
        }
        if self.block_size < 64 {
            return Err(Error::InvalidArgument(
                "block_size must be at least 64 bytes".to_string(),
            ));
        }
        if self.block_restart_interval == 0 {
            return Err(Error::InvalidArgument(
                "block_restart_interval must be at least 1".to_string(),
            ));
        }
        if self.max_open_files == 0 {
            return Err(Error::InvalidArgument(
                "max_open_files must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert_eq!(opts.dir, PathBuf::from("./basalt"));
        assert_eq!(opts.memtable_size, 4 * 1024 * 1024);
        assert_eq!(opts.wal_sync, SyncMode::Group);
        assert!(!opts.read_only);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_options_builder() {
        let opts = Options::new("/tmp/test")
            .memtable_size(1 << 20)
            .wal_sync(SyncMode::PerBatch)
            .bloom_bits_per_key(0)
            .max_immutable_memtables(2);

        assert_eq!(opts.dir, PathBuf::from("/tmp/test"));
        assert_eq!(opts.memtable_size, 1 << 20);
        assert_eq!(opts.wal_sync, SyncMode::PerBatch);
        assert_eq!(opts.bloom_bits_per_key, 0);
        assert_eq!(opts.max_immutable_memtables, 2);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(Options::new("/tmp/x").memtable_size(16).validate().is_err());
        assert!(Options::new("/tmp/x")
            .max_immutable_memtables(0)
            .validate()
            .is_err());
        assert!(Options::new("/tmp/x")
            .block_restart_interval(0)
            .validate()
            .is_err());
    }
}
