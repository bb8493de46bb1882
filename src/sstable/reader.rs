//! Reads a table through the block cache.

use std::fs::File;
use std::os::unix::fs::FileExt;

use byteorder::{BigEndian, ByteOrder};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use super::block::{BlockData, BlockIter};
use super::bloom::BloomFilter;
use super::{BlockHandle, Footer, FOOTER_SIZE};
use crate::cache::{BlockKey, CacheHandle};
use crate::error::{Error, Result};
use crate::iterator::InternalIterator;
use crate::key::InternalKeyCmp;
use crate::wal::CRC32;

pub struct TableReader {
    file: File,
    file_num: u64,
    cache: CacheHandle,
    cmp: InternalKeyCmp,
    index: Arc<Vec<u8>>,
    bloom: Option<BloomFilter>,
    range_del: Option<BlockHandle>,
    range_key: Option<BlockHandle>,
    /// Outstanding iterators; non-zero at drop means a leak upstream.
    open_iters: AtomicI64,
}

impl TableReader {
    pub fn open(
        path: &Path,
        file_num: u64,
        cache: CacheHandle,
        cmp: InternalKeyCmp,
    ) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        if size < FOOTER_SIZE as u64 {
            return Err(Error::Corruption(format!(
                "table {file_num} too short: {size} bytes"
            )));
        }
        let mut footer_buf = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer_buf, size - FOOTER_SIZE as u64)?;
        let footer = Footer::decode(&footer_buf)?;

        let index = Arc::new(read_verified(&file, file_num, footer.index)?);
        let bloom = if footer.bloom.is_empty() {
            None
        } else {
            Some(BloomFilter::decode(&read_verified(
                &file,
                file_num,
                footer.bloom,
            )?)?)
        };

        Ok(Self {
            file,
            file_num,
            cache,
            cmp,
            index,
            bloom,
            range_del: (!footer.range_del.is_empty()).then_some(footer.range_del),
            range_key: (!footer.range_key.is_empty()).then_some(footer.range_key),
            open_iters: AtomicI64::new(0),
        })
    }

    pub fn file_num(&self) -> u64 {
        self.file_num
    }

    /// False means no point record with this user key exists in the table.
    pub fn may_contain(&self, user_key: &[u8]) -> bool {
        self.bloom
            .as_ref()
            .map_or(true, |filter| filter.may_contain(user_key))
    }

    pub fn open_iter_count(&self) -> i64 {
        self.open_iters.load(Ordering::Acquire)
    }

    /// Fetches a data block, consulting the block cache first. A full
    /// cache degrades to an uncached read.
    fn read_block(&self, handle: BlockHandle) -> Result<BlockData> {
        let key = BlockKey::new(self.cache.id(), self.file_num, handle.offset);
        if let Some(value) = self.cache.block().get(&key) {
            return Ok(BlockData::Cached(value));
        }
        let data = read_verified(&self.file, self.file_num, handle)?;
        match self.cache.block().insert(key, &data) {
            Ok(value) => Ok(BlockData::Cached(value)),
            Err(Error::CacheFull) => {
                tracing::warn!(file_num = self.file_num, "block cache full, reading uncached");
                Ok(BlockData::Owned(Arc::new(data)))
            }
            Err(err) => Err(err),
        }
    }

    pub fn new_iter(self: Arc<Self>) -> Result<TableIter> {
        let index_iter =
            BlockIter::new(BlockData::Owned(Arc::clone(&self.index)), self.cmp.clone())?;
        self.open_iters.fetch_add(1, Ordering::AcqRel);
        Ok(TableIter {
            reader: self,
            index: index_iter,
            data: None,
        })
    }

    /// Side iterator over the table's range deletions, if any.
    pub fn new_range_del_iter(&self) -> Result<Option<BlockIter>> {
        self.side_iter(self.range_del)
    }

    /// Side iterator over the table's range keys, if any.
    pub fn new_range_key_iter(&self) -> Result<Option<BlockIter>> {
        self.side_iter(self.range_key)
    }

    fn side_iter(&self, handle: Option<BlockHandle>) -> Result<Option<BlockIter>> {
        match handle {
            None => Ok(None),
            Some(handle) => {
                let data = self.read_block(handle)?;
                Ok(Some(BlockIter::new(data, self.cmp.clone())?))
            }
        }
    }
}

impl Drop for TableReader {
    fn drop(&mut self) {
        let open = self.open_iters.load(Ordering::Acquire);
        if open != 0 {
            tracing::error!(
                file_num = self.file_num,
                open,
                "table reader dropped with open iterators"
            );
        }
    }
}

/// Reads `handle`'s block plus trailing CRC and verifies it.
fn read_verified(file: &File, file_num: u64, handle: BlockHandle) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; handle.size as usize + 4];
    file.read_exact_at(&mut buf, handle.offset)?;
    let stored = BigEndian::read_u32(&buf[handle.size as usize..]);
    buf.truncate(handle.size as usize);
    let computed = CRC32.checksum(&buf);
    if stored != computed {
        return Err(Error::Corruption(format!(
            "block crc mismatch in table {file_num} at offset {}",
            handle.offset
        )));
    }
    Ok(buf)
}

/// Two-level iterator: the index block locates data blocks, which are
/// opened lazily through the block cache.
pub struct TableIter {
    reader: Arc<TableReader>,
    index: BlockIter,
    data: Option<BlockIter>,
}

impl TableIter {
    /// Loads the data block the index currently points at.
    fn load_data_block(&mut self) -> Result<()> {
        debug_assert!(self.index.valid());
        let handle = BlockHandle::decode(self.index.value())?;
        let data = self.reader.read_block(handle)?;
        self.data = Some(BlockIter::new(data, self.reader.cmp.clone())?);
        Ok(())
    }

    fn data_valid(&self) -> bool {
        self.data.as_ref().is_some_and(|d| d.valid())
    }

    /// Moves to the first entry of the next data block, if any.
    fn skip_forward(&mut self) -> Result<()> {
        while !self.data_valid() {
            self.index.next()?;
            if !self.index.valid() {
                self.data = None;
                return Ok(());
            }
            self.load_data_block()?;
            if let Some(data) = self.data.as_mut() {
                data.first()?;
            }
        }
        Ok(())
    }

    /// Moves to the last entry of the previous data block, if any.
    fn skip_backward(&mut self) -> Result<()> {
        while !self.data_valid() {
            self.index.prev()?;
            if !self.index.valid() {
                self.data = None;
                return Ok(());
            }
            self.load_data_block()?;
            if let Some(data) = self.data.as_mut() {
                data.last()?;
            }
        }
        Ok(())
    }
}

impl InternalIterator for TableIter {
    fn seek_ge(&mut self, key: &[u8]) -> Result<()> {
        // Index keys are each block's largest key, so the first index
        // entry >= key names the only block that can contain it.
        self.index.seek_ge(key)?;
        if !self.index.valid() {
            self.data = None;
            return Ok(());
        }
        self.load_data_block()?;
        if let Some(data) = self.data.as_mut() {
            data.seek_ge(key)?;
        }
        self.skip_forward()
    }

    fn seek_lt(&mut self, key: &[u8]) -> Result<()> {
        self.index.seek_ge(key)?;
        if !self.index.valid() {
            return self.last();
        }
        self.load_data_block()?;
        if let Some(data) = self.data.as_mut() {
            data.seek_lt(key)?;
        }
        self.skip_backward()
    }

    fn first(&mut self) -> Result<()> {
        self.index.first()?;
        if !self.index.valid() {
            self.data = None;
            return Ok(());
        }
        self.load_data_block()?;
        if let Some(data) = self.data.as_mut() {
            data.first()?;
        }
        self.skip_forward()
    }

    fn last(&mut self) -> Result<()> {
        self.index.last()?;
        if !self.index.valid() {
            self.data = None;
            return Ok(());
        }
        self.load_data_block()?;
        if let Some(data) = self.data.as_mut() {
            data.last()?;
        }
        self.skip_backward()
    }

    fn next(&mut self) -> Result<()> {
        match self.data.as_mut() {
            None => Ok(()),
            Some(data) => {
                data.next()?;
                self.skip_forward()
            }
        }
    }

    fn prev(&mut self) -> Result<()> {
        match self.data.as_mut() {
            None => Ok(()),
            Some(data) => {
                data.prev()?;
                self.skip_backward()
            }
        }
    }

    fn valid(&self) -> bool {
        self.data_valid()
    }

    fn key(&self) -> &[u8] {
        self.data.as_ref().expect("iterator not positioned").key()
    }

    fn value(&self) -> &[u8] {
        self.data.as_ref().expect("iterator not positioned").value()
    }

    fn seek_prefix_ge(&mut self, prefix: &[u8], key: &[u8]) -> Result<()> {
        if !self.reader.may_contain(prefix) {
            self.data = None;
            return Ok(());
        }
        self.seek_ge(key)
    }
}

impl Drop for TableIter {
    fn drop(&mut self) {
        self.reader.open_iters.fetch_sub(1, Ordering::AcqRel);
    }
}
