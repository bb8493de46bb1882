//! Level iterator for the disjoint levels (>= 1).
//!
//! One iterator serves a whole level: it binary-searches the level's
//! sorted file list for the file that can contain the target, opens that
//! file's table iterator lazily through the file cache, and walks across
//! file boundaries as iteration proceeds. Holding a `TableIter` pins the
//! underlying reader, so file-cache eviction never closes a table out
//! from under an iterator.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;

use super::InternalIterator;
use crate::cache::CacheHandle;
use crate::error::Result;
use crate::key::{user_key, InternalKeyCmp};
use crate::sstable::reader::{TableIter, TableReader};
use crate::sstable::sst_path;
use crate::version::FileMetadata;

pub struct LevelIter {
    files: Vec<Arc<FileMetadata>>,
    dir: PathBuf,
    cache: CacheHandle,
    cmp: InternalKeyCmp,
    current: Option<(usize, TableIter)>,
}

impl LevelIter {
    pub fn new(
        files: Vec<Arc<FileMetadata>>,
        dir: PathBuf,
        cache: CacheHandle,
        cmp: InternalKeyCmp,
    ) -> Self {
        Self {
            files,
            dir,
            cache,
            cmp,
            current: None,
        }
    }

    fn open_file(&self, idx: usize) -> Result<TableIter> {
        let meta = &self.files[idx];
        let file_num = meta.file_num;
        let reader = self.cache.files().find_or_create(
            self.cache.id(),
            file_num,
            || {
                TableReader::open(
                    &sst_path(&self.dir, file_num),
                    file_num,
                    self.cache.clone(),
                    self.cmp.clone(),
                )
            },
        )?;
        reader.new_iter()
    }

    /// Index of the first file whose largest key is >= `key`.
    fn find_file_ge(&self, key: &[u8]) -> usize {
        self.files
            .partition_point(|f| self.cmp.compare(&f.largest, key) == Ordering::Less)
    }

    fn iter_valid(&self) -> bool {
        self.current.as_ref().is_some_and(|(_, iter)| iter.valid())
    }

    /// Walks forward across files until positioned or exhausted.
    fn skip_forward(&mut self) -> Result<()> {
        while !self.iter_valid() {
            let Some(idx) = self.current.as_ref().map(|(idx, _)| *idx) else {
                return Ok(());
            };
            let next_idx = idx + 1;
            if next_idx >= self.files.len() {
                self.current = None;
                return Ok(());
            }
            let mut iter = self.open_file(next_idx)?;
            iter.first()?;
            self.current = Some((next_idx, iter));
        }
        Ok(())
    }

    fn skip_backward(&mut self) -> Result<()> {
        while !self.iter_valid() {
            let Some(idx) = self.current.as_ref().map(|(idx, _)| *idx) else {
                return Ok(());
            };
            if idx == 0 {
                self.current = None;
                return Ok(());
            }
            let prev_idx = idx - 1;
            let mut iter = self.open_file(prev_idx)?;
            iter.last()?;
            self.current = Some((prev_idx, iter));
        }
        Ok(())
    }
}

impl InternalIterator for LevelIter {
    fn seek_ge(&mut self, key: &[u8]) -> Result<()> {
        let idx = self.find_file_ge(key);
        if idx >= self.files.len() {
            self.current = None;
            return Ok(());
        }
        let mut iter = self.open_file(idx)?;
        iter.seek_ge(key)?;
        self.current = Some((idx, iter));
        self.skip_forward()
    }

    fn seek_lt(&mut self, key: &[u8]) -> Result<()> {
        // Last file whose smallest key is < `key`.
        let idx = self
            .files
            .partition_point(|f| self.cmp.compare(&f.smallest, key) == Ordering::Less);
        if idx == 0 {
            self.current = None;
            return Ok(());
        }
        let mut iter = self.open_file(idx - 1)?;
        iter.seek_lt(key)?;
        self.current = Some((idx - 1, iter));
        self.skip_backward()
    }

    fn first(&mut self) -> Result<()> {
        if self.files.is_empty() {
            self.current = None;
            return Ok(());
        }
        let mut iter = self.open_file(0)?;
        iter.first()?;
        self.current = Some((0, iter));
        self.skip_forward()
    }

    fn last(&mut self) -> Result<()> {
        if self.files.is_empty() {
            self.current = None;
            return Ok(());
        }
        let idx = self.files.len() - 1;
        let mut iter = self.open_file(idx)?;
        iter.last()?;
        self.current = Some((idx, iter));
        self.skip_backward()
    }

    fn next(&mut self) -> Result<()> {
        if let Some((_, iter)) = self.current.as_mut() {
            iter.next()?;
        }
        self.skip_forward()
    }

    fn prev(&mut self) -> Result<()> {
        if let Some((_, iter)) = self.current.as_mut() {
            iter.prev()?;
        }
        self.skip_backward()
    }

    fn valid(&self) -> bool {
        self.iter_valid()
    }

    fn key(&self) -> &[u8] {
        self.current
            .as_ref()
            .expect("iterator not positioned")
            .1
            .key()
    }

    fn value(&self) -> &[u8] {
        self.current
            .as_ref()
            .expect("iterator not positioned")
            .1
            .value()
    }

    fn seek_prefix_ge(&mut self, prefix: &[u8], key: &[u8]) -> Result<()> {
        let mut idx = self.find_file_ge(key);
        loop {
            if idx >= self.files.len() {
                self.current = None;
                return Ok(());
            }
            let mut iter = self.open_file(idx)?;
            iter.seek_prefix_ge(prefix, key)?;
            let valid = iter.valid();
            self.current = Some((idx, iter));
            if valid {
                return Ok(());
            }
            // The prefix may continue into the next file; anything else
            // is outside the prefix-seek contract.
            let next = idx + 1;
            if next >= self.files.len()
                || !user_key(&self.files[next].smallest).starts_with(prefix)
            {
                self.current = None;
                return Ok(());
            }
            idx = next;
        }
    }
}
