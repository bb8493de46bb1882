use std::fs::File;
use std::io::Write;

use byteorder::{BigEndian, ByteOrder};

use super::record::{RecordType, BLOCK_SIZE, RECORD_HEADER_SIZE};
use super::CRC32;
use crate::error::Result;

/// Appends framed records to one WAL segment.
pub struct LogWriter {
    file: File,
    block_offset: usize,
    written: u64,
}

impl LogWriter {
    pub fn new(file: File) -> Self {
        Self {
            file,
            block_offset: 0,
            written: 0,
        }
    }

    /// Appends one logical record, fragmenting across blocks as needed.
    pub fn add_record(&mut self, payload: &[u8]) -> Result<()> {
        let mut remaining = payload;
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < RECORD_HEADER_SIZE {
                // Too small for a header: pad out the block.
                if leftover > 0 {
                    self.file.write_all(&[0u8; RECORD_HEADER_SIZE][..leftover])?;
                    self.written += leftover as u64;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - RECORD_HEADER_SIZE;
            let fragment_len = remaining.len().min(avail);
            let end = fragment_len == remaining.len();
            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            let (fragment, rest) = remaining.split_at(fragment_len);
            self.emit(record_type, fragment)?;
            remaining = rest;
            begin = false;
            if end {
                return Ok(());
            }
        }
    }

    fn emit(&mut self, record_type: RecordType, fragment: &[u8]) -> Result<()> {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        let mut digest = CRC32.digest();
        digest.update(&[record_type as u8]);
        digest.update(fragment);
        BigEndian::write_u32(&mut header[0..4], digest.finalize());
        BigEndian::write_u16(&mut header[4..6], fragment.len() as u16);
        header[6] = record_type as u8;

        self.file.write_all(&header)?;
        self.file.write_all(fragment)?;
        self.block_offset += RECORD_HEADER_SIZE + fragment.len();
        self.written += (RECORD_HEADER_SIZE + fragment.len()) as u64;
        Ok(())
    }

    /// Makes everything appended so far durable.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Bytes written to this segment.
    pub fn size(&self) -> u64 {
        self.written
    }
}
