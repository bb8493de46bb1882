//! Sorted string tables.
//!
//! ## File layout
//!
//! ```text
//! +--------------------+
//! | Data Block 1 + crc |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! | Data Block N + crc |
//! +--------------------+
//! | RangeDel Blk + crc |  (optional)
//! +--------------------+
//! | RangeKey Blk + crc |  (optional)
//! +--------------------+
//! | Bloom Block  + crc |  (optional)
//! +--------------------+
//! | Index Block  + crc |
//! +--------------------+
//! | Footer (72 bytes)  |
//! +--------------------+
//! ```
//!
//! Point records live in the data blocks; range deletions and range keys
//! are segregated into their own blocks so the merge layer can consult
//! them as side iterators without touching point data.

pub mod block;
pub mod bloom;
pub mod builder;
pub mod reader;

use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

pub const FOOTER_SIZE: usize = 72;
pub const FOOTER_MAGIC: u64 = 0x6261_7361_6c74_0001;

/// Location of a block within the table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let mut tmp = [0u8; 16];
        BigEndian::write_u64(&mut tmp[..8], self.offset);
        BigEndian::write_u64(&mut tmp[8..], self.size);
        buf.extend_from_slice(&tmp);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 16 {
            return Err(Error::Corruption("block handle too short".to_string()));
        }
        Ok(Self {
            offset: BigEndian::read_u64(&data[..8]),
            size: BigEndian::read_u64(&data[8..16]),
        })
    }
}

/// Table footer: four block handles and a magic number.
#[derive(Debug, Clone, Copy, Default)]
pub struct Footer {
    pub index: BlockHandle,
    pub bloom: BlockHandle,
    pub range_del: BlockHandle,
    pub range_key: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        self.index.encode_into(&mut buf);
        self.bloom.encode_into(&mut buf);
        self.range_del.encode_into(&mut buf);
        self.range_key.encode_into(&mut buf);
        let mut magic = [0u8; 8];
        BigEndian::write_u64(&mut magic, FOOTER_MAGIC);
        buf.extend_from_slice(&magic);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != FOOTER_SIZE {
            return Err(Error::Corruption(format!(
                "footer must be {FOOTER_SIZE} bytes, got {}",
                data.len()
            )));
        }
        if BigEndian::read_u64(&data[64..72]) != FOOTER_MAGIC {
            return Err(Error::Corruption("bad table magic".to_string()));
        }
        Ok(Self {
            index: BlockHandle::decode(&data[0..16])?,
            bloom: BlockHandle::decode(&data[16..32])?,
            range_del: BlockHandle::decode(&data[32..48])?,
            range_key: BlockHandle::decode(&data[48..64])?,
        })
    }
}

/// Path of an SST file inside the database directory.
pub fn sst_path(dir: &Path, file_num: u64) -> PathBuf {
    dir.join("sst").join(format!("{file_num:08}.sst"))
}
