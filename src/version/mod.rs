//! Versions: immutable snapshots of the LSM's file structure.
//!
//! A version is a per-level list of file metadata. Applying a version
//! edit produces a successor version under the engine mutex; readers keep
//! iterating their captured version untouched. File metadata is
//! refcounted: when an edit removes a file, the metadata is flagged
//! obsolete, and the last reference to drop unlinks the file and purges
//! its cache entries. A file referenced by any live version is therefore
//! never deleted from disk.

pub mod edit;
pub mod manifest;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use itertools::Itertools;

use edit::{FileDesc, VersionEdit};
use manifest::Manifest;

use crate::cache::CacheHandle;
use crate::error::{Error, Result};
use crate::key::{user_key, InternalKeyCmp, SeqNum};
use crate::sstable::sst_path;

pub const NUM_LEVELS: usize = 7;

/// Deletes a file's bytes and cache entries once nothing references it.
pub struct FilePurger {
    dir: PathBuf,
    cache: CacheHandle,
}

impl FilePurger {
    pub fn new(dir: PathBuf, cache: CacheHandle) -> Arc<Self> {
        Arc::new(Self { dir, cache })
    }

    fn purge(&self, file_num: u64) {
        self.cache.evict_file(file_num);
        let path = sst_path(&self.dir, file_num);
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::info!(file_num, "deleted obsolete table"),
            Err(err) => {
                tracing::warn!(file_num, error = %err, "failed to delete obsolete table")
            }
        }
    }
}

/// Immutable metadata for one table file.
pub struct FileMetadata {
    pub file_num: u64,
    pub size: u64,
    pub entry_count: u64,
    pub smallest: Vec<u8>,
    pub largest: Vec<u8>,
    pub smallest_seq: SeqNum,
    pub largest_seq: SeqNum,
    obsolete: AtomicBool,
    purger: Arc<FilePurger>,
}

impl FileMetadata {
    pub fn from_desc(desc: FileDesc, purger: Arc<FilePurger>) -> Arc<Self> {
        Arc::new(Self {
            file_num: desc.file_num,
            size: desc.size,
            entry_count: desc.entry_count,
            smallest: desc.smallest,
            largest: desc.largest,
            smallest_seq: desc.smallest_seq,
            largest_seq: desc.largest_seq,
            obsolete: AtomicBool::new(false),
            purger,
        })
    }

    pub fn to_desc(&self) -> FileDesc {
        FileDesc {
            file_num: self.file_num,
            size: self.size,
            entry_count: self.entry_count,
            smallest: self.smallest.clone(),
            largest: self.largest.clone(),
            smallest_seq: self.smallest_seq,
            largest_seq: self.largest_seq,
        }
    }

    /// Flags the file for deletion once the last reference drops.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }
}

impl Drop for FileMetadata {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            self.purger.purge(self.file_num);
        }
    }
}

impl std::fmt::Debug for FileMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMetadata")
            .field("file_num", &self.file_num)
            .field("size", &self.size)
            .field("entries", &self.entry_count)
            .finish()
    }
}

/// One immutable view of the file tree. Level 0 is ordered newest first
/// and may overlap; levels >= 1 are disjoint and sorted by smallest key.
pub struct Version {
    levels: Vec<Vec<Arc<FileMetadata>>>,
}

impl Version {
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            levels: vec![Vec::new(); NUM_LEVELS],
        })
    }

    pub fn files(&self, level: usize) -> &[Arc<FileMetadata>] {
        &self.levels[level]
    }

    pub fn num_files(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Checks the level invariants: levels >= 1 sorted by smallest user
    /// key with non-overlapping ranges.
    pub fn validate(&self, cmp: &InternalKeyCmp) -> Result<()> {
        for (level, files) in self.levels.iter().enumerate().skip(1) {
            for (a, b) in files.iter().tuple_windows() {
                let a_largest = user_key(&a.largest);
                let b_smallest = user_key(&b.smallest);
                if cmp.user_cmp().compare(a_largest, b_smallest) != std::cmp::Ordering::Less {
                    return Err(Error::Invariant(format!(
                        "level {level} files {} and {} overlap",
                        a.file_num, b.file_num
                    )));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<usize> = self.levels.iter().map(Vec::len).collect();
        f.debug_struct("Version").field("files", &counts).finish()
    }
}

/// Owns the version history and the manifest that records it.
pub struct VersionSet {
    dir: PathBuf,
    cmp: InternalKeyCmp,
    purger: Arc<FilePurger>,
    manifest: Option<Manifest>,
    current: Arc<Version>,
    next_file_num: AtomicU64,
    /// WAL segments below this number are covered by flushed tables.
    log_num: u64,
    last_seq: SeqNum,
}

impl VersionSet {
    /// Replays the manifest (if any) and, unless opening read-only,
    /// installs a fresh one seeded with the recovered state.
    pub fn recover(
        dir: &Path,
        cmp: InternalKeyCmp,
        comparator_name: &str,
        cache: CacheHandle,
        read_only: bool,
    ) -> Result<Self> {
        let purger = FilePurger::new(dir.to_path_buf(), cache);

        let mut files: Vec<Vec<FileDesc>> = vec![Vec::new(); NUM_LEVELS];
        let mut next_file_num = 1u64;
        let mut log_num = 0u64;
        let mut last_seq = 0u64;
        let mut recorded_name: Option<String> = None;

        for edit in Manifest::replay(dir)? {
            if let Some(name) = edit.comparator_name {
                recorded_name = Some(name);
            }
            if let Some(num) = edit.log_num {
                log_num = num;
            }
            if let Some(num) = edit.next_file_num {
                next_file_num = num;
            }
            if let Some(seq) = edit.last_seq {
                last_seq = seq;
            }
            for (level, file_num) in edit.deleted_files {
                files[level as usize].retain(|f| f.file_num != file_num);
            }
            for (level, desc) in edit.new_files {
                if level as usize >= NUM_LEVELS {
                    return Err(Error::Corruption(format!("level {level} out of range")));
                }
                files[level as usize].push(desc);
            }
        }

        if let Some(name) = recorded_name {
            if name != comparator_name {
                return Err(Error::InvalidArgument(format!(
                    "comparator mismatch: database uses {name}, options supply {comparator_name}"
                )));
            }
        }

        // Levels >= 1 are kept sorted by smallest key; L0 newest first.
        for (level, level_files) in files.iter_mut().enumerate() {
            if level == 0 {
                level_files.sort_by(|a, b| b.largest_seq.cmp(&a.largest_seq));
            } else {
                let cmp = cmp.clone();
                level_files.sort_by(|a, b| cmp.compare(&a.smallest, &b.smallest));
            }
        }

        let levels: Vec<Vec<Arc<FileMetadata>>> = files
            .iter()
            .map(|level| {
                level
                    .iter()
                    .map(|desc| FileMetadata::from_desc(desc.clone(), Arc::clone(&purger)))
                    .collect()
            })
            .collect();
        let current = Arc::new(Version { levels });
        current.validate(&cmp)?;

        // Seed the fresh manifest with a snapshot of the recovered state.
        // Read-only opens leave the existing manifest untouched.
        let snapshot = VersionEdit {
            comparator_name: Some(comparator_name.to_string()),
            log_num: Some(log_num),
            next_file_num: Some(next_file_num),
            last_seq: Some(last_seq),
            new_files: files
                .iter()
                .enumerate()
                .flat_map(|(level, level_files)| {
                    level_files
                        .iter()
                        .map(move |desc| (level as u32, desc.clone()))
                })
                .collect(),
            deleted_files: Vec::new(),
        };
        let manifest = if read_only {
            None
        } else {
            Some(Manifest::create(dir, &snapshot)?)
        };

        tracing::info!(
            files = current.num_files(),
            next_file_num,
            log_num,
            last_seq,
            "recovered version set"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            cmp,
            purger,
            manifest,
            current,
            next_file_num: AtomicU64::new(next_file_num),
            log_num,
            last_seq,
        })
    }

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    pub fn last_seq(&self) -> SeqNum {
        self.last_seq
    }

    pub fn log_num(&self) -> u64 {
        self.log_num
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn next_file_num(&self) -> u64 {
        self.next_file_num.fetch_add(1, Ordering::SeqCst)
    }

    /// Peeks at the counter without consuming a number.
    pub fn pending_file_num(&self) -> u64 {
        self.next_file_num.load(Ordering::SeqCst)
    }

    /// Raises the counter past file numbers observed outside the
    /// manifest, such as WAL segments that outlived a crash.
    pub fn ensure_file_num_at_least(&self, n: u64) {
        self.next_file_num.fetch_max(n, Ordering::SeqCst);
    }

    /// Applies an edit: writes it durably to the manifest, then swaps in
    /// the successor version. Removed files are flagged obsolete so the
    /// last reference unlinks them.
    pub fn log_and_apply(&mut self, mut edit: VersionEdit) -> Result<Arc<Version>> {
        edit.next_file_num = Some(self.next_file_num.load(Ordering::SeqCst));
        if let Some(seq) = edit.last_seq {
            self.last_seq = self.last_seq.max(seq);
        } else {
            edit.last_seq = Some(self.last_seq);
        }
        if let Some(num) = edit.log_num {
            self.log_num = self.log_num.max(num);
        }

        let mut levels = self.current.levels.clone();
        for (level, file_num) in &edit.deleted_files {
            let level_files = &mut levels[*level as usize];
            if let Some(pos) = level_files.iter().position(|f| f.file_num == *file_num) {
                let removed = level_files.remove(pos);
                removed.mark_obsolete();
            } else {
                return Err(Error::Invariant(format!(
                    "edit deletes file {file_num} absent from level {level}"
                )));
            }
        }
        for (level, desc) in &edit.new_files {
            let meta = FileMetadata::from_desc(desc.clone(), Arc::clone(&self.purger));
            let level_files = &mut levels[*level as usize];
            if *level == 0 {
                // Newest tables first: L0 read order is recency order.
                level_files.insert(0, meta);
            } else {
                let cmp = self.cmp.clone();
                let pos = level_files.partition_point(|f| {
                    cmp.compare(&f.smallest, &desc.smallest) == std::cmp::Ordering::Less
                });
                level_files.insert(pos, meta);
            }
        }

        let next = Arc::new(Version { levels });
        next.validate(&self.cmp)?;

        // Durable before visible: the manifest append happens ahead of
        // the in-memory install.
        let manifest = self.manifest.as_ref().ok_or(Error::ReadOnly)?;
        manifest.append(&edit)?;
        self.current = Arc::clone(&next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::comparator::BytewiseComparator;
    use crate::key::{encode_key, ValueKind};
    use crate::tmpfs::TempDir;

    fn cmp() -> InternalKeyCmp {
        InternalKeyCmp(Arc::new(BytewiseComparator))
    }

    fn desc(file_num: u64, smallest: &[u8], largest: &[u8]) -> FileDesc {
        FileDesc {
            file_num,
            size: 1024,
            entry_count: 10,
            smallest: encode_key(smallest, 1, ValueKind::Set),
            largest: encode_key(largest, 10, ValueKind::Set),
            smallest_seq: 1,
            largest_seq: 10,
        }
    }

    fn version_set(dir: &TempDir) -> VersionSet {
        let cache = Cache::new(1 << 20, 4);
        VersionSet::recover(dir.path(), cmp(), "basalt.bytewise", cache.handle(), false)
            .expect("Failed to recover")
    }

    #[test]
    fn test_fresh_recover() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let vs = version_set(&dir);
        assert_eq!(vs.current().num_files(), 0);
        assert_eq!(vs.last_seq(), 0);
    }

    #[test]
    fn test_apply_and_reopen() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        {
            let mut vs = version_set(&dir);
            let edit = VersionEdit {
                new_files: vec![(0, desc(1, b"a", b"m")), (0, desc(2, b"n", b"z"))],
                last_seq: Some(20),
                log_num: Some(3),
                ..Default::default()
            };
            vs.log_and_apply(edit).expect("apply failed");
            assert_eq!(vs.current().files(0).len(), 2);
        }

        let vs = version_set(&dir);
        assert_eq!(vs.current().files(0).len(), 2);
        assert_eq!(vs.last_seq(), 20);
        assert_eq!(vs.log_num(), 3);
    }

    #[test]
    fn test_comparator_mismatch_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        drop(version_set(&dir));

        let cache = Cache::new(1 << 20, 4);
        let result =
            VersionSet::recover(dir.path(), cmp(), "custom.reversed", cache.handle(), false);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_level_overlap_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut vs = version_set(&dir);
        let edit = VersionEdit {
            new_files: vec![(1, desc(1, b"a", b"m")), (1, desc(2, b"k", b"z"))],
            ..Default::default()
        };
        assert!(vs.log_and_apply(edit).is_err());
    }

    #[test]
    fn test_delete_marks_obsolete() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir_all(dir.path().join("sst")).expect("Failed to create sst dir");
        let path = sst_path(dir.path(), 1);
        std::fs::write(&path, b"table bytes").expect("Failed to write");

        let mut vs = version_set(&dir);
        vs.log_and_apply(VersionEdit {
            new_files: vec![(0, desc(1, b"a", b"z"))],
            ..Default::default()
        })
        .expect("apply failed");

        let old = vs.current();
        vs.log_and_apply(VersionEdit {
            deleted_files: vec![(0, 1)],
            ..Default::default()
        })
        .expect("apply failed");

        // The old version still pins the file on disk.
        assert!(path.exists());
        drop(old);
        assert!(!path.exists(), "file should be purged once unreferenced");
    }

    #[test]
    fn test_old_version_untouched_by_edit() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut vs = version_set(&dir);
        vs.log_and_apply(VersionEdit {
            new_files: vec![(0, desc(1, b"a", b"z"))],
            ..Default::default()
        })
        .expect("apply failed");

        let before = vs.current();
        vs.log_and_apply(VersionEdit {
            new_files: vec![(0, desc(2, b"a", b"z"))],
            ..Default::default()
        })
        .expect("apply failed");

        assert_eq!(before.files(0).len(), 1);
        assert_eq!(vs.current().files(0).len(), 2);
    }
}
