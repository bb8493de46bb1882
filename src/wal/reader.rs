use std::fs::File;
use std::io::Read;

use byteorder::{BigEndian, ByteOrder};

use super::record::{RecordType, BLOCK_SIZE, RECORD_HEADER_SIZE};
use super::CRC32;
use crate::error::Result;

/// Replays one WAL segment's logical records.
///
/// Replay stops cleanly at EOF or at the first damaged fragment: a torn
/// tail is the expected shape of a crash, not a reportable corruption.
pub struct LogReader {
    file: File,
    block: Vec<u8>,
    block_len: usize,
    block_pos: usize,
    eof: bool,
}

impl LogReader {
    pub fn new(file: File) -> Self {
        Self {
            file,
            block: vec![0u8; BLOCK_SIZE],
            block_len: 0,
            block_pos: 0,
            eof: false,
        }
    }

    /// Returns the next logical record, or None at end of replayable data.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut record = Vec::new();
        let mut in_fragmented = false;
        loop {
            let Some((record_type, fragment)) = self.read_fragment()? else {
                // A dangling First/Middle chain is a torn write.
                if in_fragmented {
                    tracing::warn!("wal replay: dropping torn fragmented record");
                }
                return Ok(None);
            };
            match record_type {
                RecordType::Full => {
                    if in_fragmented {
                        tracing::warn!("wal replay: Full record interrupts fragment chain");
                        return Ok(None);
                    }
                    return Ok(Some(fragment));
                }
                RecordType::First => {
                    if in_fragmented {
                        tracing::warn!("wal replay: First record interrupts fragment chain");
                        return Ok(None);
                    }
                    in_fragmented = true;
                    record.clear();
                    record.extend_from_slice(&fragment);
                }
                RecordType::Middle => {
                    if !in_fragmented {
                        tracing::warn!("wal replay: orphaned Middle fragment");
                        return Ok(None);
                    }
                    record.extend_from_slice(&fragment);
                }
                RecordType::Last => {
                    if !in_fragmented {
                        tracing::warn!("wal replay: orphaned Last fragment");
                        return Ok(None);
                    }
                    record.extend_from_slice(&fragment);
                    return Ok(Some(record));
                }
            }
        }
    }

    /// Reads one physical fragment, refilling the block buffer as needed.
    /// Returns None at EOF or on a damaged fragment.
    fn read_fragment(&mut self) -> Result<Option<(RecordType, Vec<u8>)>> {
        loop {
            if self.block_len - self.block_pos < RECORD_HEADER_SIZE {
                if !self.refill()? {
                    return Ok(None);
                }
                continue;
            }
            let base = self.block_pos;
            let stored_crc = BigEndian::read_u32(&self.block[base..]);
            let len = BigEndian::read_u16(&self.block[base + 4..]) as usize;
            let type_byte = self.block[base + 6];

            // Zero padding at a block tail reads as len 0, type 0.
            if type_byte == 0 && stored_crc == 0 && len == 0 {
                self.block_pos = self.block_len;
                continue;
            }

            let Ok(record_type) = RecordType::from_u8(type_byte) else {
                tracing::warn!("wal replay: bad record type, stopping");
                return Ok(None);
            };
            let body_start = base + RECORD_HEADER_SIZE;
            if body_start + len > self.block_len {
                tracing::warn!("wal replay: truncated fragment, stopping");
                return Ok(None);
            }
            let fragment = &self.block[body_start..body_start + len];

            let mut digest = CRC32.digest();
            digest.update(&[type_byte]);
            digest.update(fragment);
            if digest.finalize() != stored_crc {
                tracing::warn!("wal replay: crc mismatch, stopping");
                return Ok(None);
            }

            let fragment = fragment.to_vec();
            self.block_pos = body_start + len;
            return Ok(Some((record_type, fragment)));
        }
    }

    /// Loads the next 32KiB block; false at EOF.
    fn refill(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.file.read(&mut self.block[filled..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            filled += n;
        }
        self.block_len = filled;
        self.block_pos = 0;
        Ok(filled >= RECORD_HEADER_SIZE)
    }
}

impl Iterator for LogReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}
