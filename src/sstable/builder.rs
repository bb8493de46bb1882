//! Writes a table from an ascending stream of internal keys.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, WriteBytesExt};

use std::sync::Arc;

use super::block::BlockBuilder;
use super::bloom::{key_hash, BloomFilter};
use super::{BlockHandle, Footer};
use crate::comparator::Comparator;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::key::{decode_key, SeqNum, ValueKind};
use crate::wal::CRC32;

/// Metadata produced by a finished table, consumed by the version edit
/// that publishes the file.
#[derive(Debug, Clone)]
pub struct TableProps {
    pub file_num: u64,
    pub size: u64,
    pub entry_count: u64,
    pub smallest: Vec<u8>,
    pub largest: Vec<u8>,
    pub smallest_seq: SeqNum,
    pub largest_seq: SeqNum,
}

pub struct TableBuilder {
    file: BufWriter<File>,
    path: PathBuf,
    file_num: u64,
    offset: u64,

    block: BlockBuilder,
    block_last_key: Vec<u8>,
    index: Vec<(Vec<u8>, BlockHandle)>,
    range_del: BlockBuilder,
    range_key: BlockBuilder,

    block_size: usize,
    restart_interval: usize,
    bloom_bits_per_key: usize,
    comparator: Arc<dyn Comparator>,
    key_hashes: Vec<(u64, u64)>,
    last_hashed_prefix: Vec<u8>,

    entry_count: u64,
    smallest: Option<Vec<u8>>,
    largest: Vec<u8>,
    smallest_seq: SeqNum,
    largest_seq: SeqNum,
}

impl TableBuilder {
    pub fn new(path: &Path, file_num: u64, opts: &Options) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            file: BufWriter::new(file),
            path: path.to_path_buf(),
            file_num,
            offset: 0,
            block: BlockBuilder::new(opts.block_restart_interval),
            block_last_key: Vec::new(),
            index: Vec::new(),
            range_del: BlockBuilder::new(1),
            range_key: BlockBuilder::new(1),
            block_size: opts.block_size,
            restart_interval: opts.block_restart_interval,
            bloom_bits_per_key: opts.bloom_bits_per_key,
            comparator: Arc::clone(&opts.comparator),
            key_hashes: Vec::new(),
            last_hashed_prefix: Vec::new(),
            entry_count: 0,
            smallest: None,
            largest: Vec::new(),
            smallest_seq: SeqNum::MAX,
            largest_seq: 0,
        })
    }

    /// Appends one record. Keys must arrive in ascending internal-key
    /// order within each stream (point, range deletion, range key).
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let (ukey, seq, kind) = decode_key(key)?;
        if self.smallest.is_none() {
            self.smallest = Some(key.to_vec());
        }
        self.largest.clear();
        self.largest.extend_from_slice(key);
        self.smallest_seq = self.smallest_seq.min(seq);
        self.largest_seq = self.largest_seq.max(seq);
        self.entry_count += 1;

        match kind {
            ValueKind::RangeDelete => {
                self.range_del.add(key, value);
                return Ok(());
            }
            k if k.is_range_key() => {
                self.range_key.add(key, value);
                return Ok(());
            }
            ValueKind::LogData => {
                return Err(Error::Invariant(
                    "LogData records never reach a table".to_string(),
                ));
            }
            _ => {}
        }

        // The filter indexes comparator prefixes: that is what
        // seek_prefix_ge probes with.
        if self.bloom_bits_per_key > 0 {
            let (prefix, _) = self.comparator.split_suffix(ukey);
            if self.last_hashed_prefix != prefix {
                self.key_hashes.push(key_hash(prefix));
                self.last_hashed_prefix.clear();
                self.last_hashed_prefix.extend_from_slice(prefix);
            }
        }

        self.block.add(key, value);
        self.block_last_key.clear();
        self.block_last_key.extend_from_slice(key);
        if self.block.size_estimate() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let block = std::mem::replace(&mut self.block, BlockBuilder::new(self.restart_interval));
        let handle = self.write_block(block.finish())?;
        self.index.push((std::mem::take(&mut self.block_last_key), handle));
        Ok(())
    }

    /// Writes block bytes followed by their CRC, returning the handle.
    fn write_block(&mut self, data: Vec<u8>) -> Result<BlockHandle> {
        let handle = BlockHandle {
            offset: self.offset,
            size: data.len() as u64,
        };
        let crc = CRC32.checksum(&data);
        self.file.write_all(&data)?;
        self.file.write_u32::<BigEndian>(crc)?;
        self.offset += data.len() as u64 + 4;
        Ok(handle)
    }

    /// Number of records added so far.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Finalizes the table: side blocks, bloom, index, footer.
    pub fn finish(mut self) -> Result<TableProps> {
        self.flush_data_block()?;

        let range_del = std::mem::replace(&mut self.range_del, BlockBuilder::new(1));
        let range_del_handle = if range_del.is_empty() {
            BlockHandle::default()
        } else {
            self.write_block(range_del.finish())?
        };

        let range_key = std::mem::replace(&mut self.range_key, BlockBuilder::new(1));
        let range_key_handle = if range_key.is_empty() {
            BlockHandle::default()
        } else {
            self.write_block(range_key.finish())?
        };

        let bloom_handle = if self.bloom_bits_per_key > 0 && !self.key_hashes.is_empty() {
            let filter = BloomFilter::from_hashes(&self.key_hashes, self.bloom_bits_per_key);
            self.write_block(filter.encode())?
        } else {
            BlockHandle::default()
        };

        let mut index_block = BlockBuilder::new(1);
        for (last_key, handle) in std::mem::take(&mut self.index) {
            let mut encoded = Vec::with_capacity(16);
            handle.encode_into(&mut encoded);
            index_block.add(&last_key, &encoded);
        }
        let index_handle = self.write_block(index_block.finish())?;

        let footer = Footer {
            index: index_handle,
            bloom: bloom_handle,
            range_del: range_del_handle,
            range_key: range_key_handle,
        };
        self.file.write_all(&footer.encode())?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        let size = self.offset + super::FOOTER_SIZE as u64;
        tracing::debug!(
            file_num = self.file_num,
            size,
            entries = self.entry_count,
            path = %self.path.display(),
            "finished table"
        );
        Ok(TableProps {
            file_num: self.file_num,
            size,
            entry_count: self.entry_count,
            smallest: self.smallest.unwrap_or_default(),
            largest: self.largest,
            smallest_seq: if self.entry_count == 0 {
                0
            } else {
                self.smallest_seq
            },
            largest_seq: self.largest_seq,
        })
    }
}
