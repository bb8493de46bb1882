//! WAL record framing.
//!
//! Segments are sequences of 32KiB blocks. A logical record (one encoded
//! batch) is split into fragments that never straddle a block boundary:
//!
//! ```text
//! +---------+--------+---------+------------------+
//! | crc u32 | len u16| type u8 | payload (len)    |
//! +---------+--------+---------+------------------+
//! ```
//!
//! The CRC covers the type byte and payload. A block tail smaller than
//! the 7-byte header is zero-padded. Replay reassembles First/Middle/Last
//! chains and stops at the first checksum mismatch or truncated fragment,
//! which marks the crash point.

use crate::error::{Error, Result};

pub const BLOCK_SIZE: usize = 32 * 1024;
pub const RECORD_HEADER_SIZE: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl RecordType {
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(RecordType::Full),
            2 => Ok(RecordType::First),
            3 => Ok(RecordType::Middle),
            4 => Ok(RecordType::Last),
            other => Err(Error::Corruption(format!("invalid record type: {other}"))),
        }
    }
}
