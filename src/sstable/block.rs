//! Data block encoding with prefix compression and restart points.
//!
//! ```text
//! +--------+--------+---------+------------+-------+
//! |shared  |unshared|value_len| key suffix | value |  (one entry)
//! |u16     |u16     |u32      | var len    |var len|
//! +--------+--------+---------+------------+-------+
//! | ... entries ...                                 |
//! +-------------------------------------------------+
//! | restart offsets: u32 × n | restart count: u32   |
//! +-------------------------------------------------+
//! ```
//!
//! Keys share a prefix with their predecessor except at restart points,
//! where the full key is stored. Restarts give the iterator binary-search
//! targets and let it reconstruct keys when scanning backwards.

use std::cmp::Ordering;
use std::ops::Deref;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};

use crate::cache::CacheValue;
use crate::error::{Error, Result};
use crate::key::InternalKeyCmp;

const ENTRY_HEADER_SIZE: usize = 8;

pub struct BlockBuilder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        Self {
            buffer: Vec::new(),
            restarts: Vec::new(),
            restart_interval: restart_interval.max(1),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in ascending internal-key order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.entry_count % self.restart_interval == 0 {
            self.restarts.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_len(&self.last_key, key).min(u16::MAX as usize)
        };
        let unshared = key.len() - shared;

        self.buffer.write_u16::<BigEndian>(shared as u16).unwrap();
        self.buffer.write_u16::<BigEndian>(unshared as u16).unwrap();
        self.buffer
            .write_u32::<BigEndian>(value.len() as u32)
            .unwrap();
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        for pos in &self.restarts {
            self.buffer.write_u32::<BigEndian>(*pos).unwrap();
        }
        self.buffer
            .write_u32::<BigEndian>(self.restarts.len() as u32)
            .unwrap();
        self.buffer
    }

    /// Bytes the finished block would occupy.
    pub fn size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// A finished block's bytes, either pinned in the block cache or owned.
#[derive(Clone)]
pub enum BlockData {
    Cached(CacheValue),
    Owned(Arc<Vec<u8>>),
}

impl Deref for BlockData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            BlockData::Cached(v) => v.as_slice(),
            BlockData::Owned(v) => v.as_slice(),
        }
    }
}

/// A positioned cursor over one block.
pub struct BlockIter {
    data: BlockData,
    cmp: InternalKeyCmp,
    /// End of the entry region (start of the restart array).
    entries_end: usize,
    restarts: Vec<u32>,
    /// Offset of the current entry; meaningless unless `valid`.
    offset: usize,
    /// Offset just past the current entry.
    next_offset: usize,
    key: Vec<u8>,
    value_range: (usize, usize),
    valid: bool,
}

impl BlockIter {
    pub fn new(data: BlockData, cmp: InternalKeyCmp) -> Result<Self> {
        let len = data.len();
        if len < 4 {
            return Err(Error::Corruption("block too short".to_string()));
        }
        let num_restarts = BigEndian::read_u32(&data[len - 4..]) as usize;
        let restart_array = num_restarts
            .checked_mul(4)
            .ok_or_else(|| Error::Corruption("restart count overflow".to_string()))?;
        if len < 4 + restart_array {
            return Err(Error::Corruption(
                "block too short for restart array".to_string(),
            ));
        }
        let entries_end = len - 4 - restart_array;
        let mut restarts = Vec::with_capacity(num_restarts);
        let mut cursor = &data[entries_end..len - 4];
        for _ in 0..num_restarts {
            let restart = cursor.read_u32::<BigEndian>()? as usize;
            if restart >= entries_end && !(restart == 0 && entries_end == 0) {
                return Err(Error::Corruption("restart offset out of range".to_string()));
            }
            restarts.push(restart as u32);
        }
        Ok(Self {
            data,
            cmp,
            entries_end,
            restarts,
            offset: 0,
            next_offset: 0,
            key: Vec::new(),
            value_range: (0, 0),
            valid: false,
        })
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.data[self.value_range.0..self.value_range.1]
    }

    /// Decodes the entry at `offset`, assuming `self.key` holds the
    /// preceding entry's key (or the restart base).
    fn decode_at(&mut self, offset: usize) -> Result<()> {
        if offset + ENTRY_HEADER_SIZE > self.entries_end {
            return Err(Error::Corruption("entry header out of range".to_string()));
        }
        let shared = BigEndian::read_u16(&self.data[offset..]) as usize;
        let unshared = BigEndian::read_u16(&self.data[offset + 2..]) as usize;
        let value_len = BigEndian::read_u32(&self.data[offset + 4..]) as usize;
        let suffix_start = offset + ENTRY_HEADER_SIZE;
        let value_start = suffix_start + unshared;
        let value_end = value_start + value_len;
        if value_end > self.entries_end {
            return Err(Error::Corruption("entry body out of range".to_string()));
        }
        if shared > self.key.len() {
            return Err(Error::Corruption(
                "shared prefix exceeds previous key".to_string(),
            ));
        }
        self.key.truncate(shared);
        self.key
            .extend_from_slice(&self.data[suffix_start..value_start]);
        self.value_range = (value_start, value_end);
        self.offset = offset;
        self.next_offset = value_end;
        self.valid = true;
        Ok(())
    }

    fn seek_to_restart(&mut self, index: usize) -> Result<()> {
        self.key.clear();
        self.decode_at(self.restarts[index] as usize)
    }

    /// Reads the full key stored at a restart point without repositioning.
    fn restart_key(&self, index: usize) -> Result<&[u8]> {
        let offset = self.restarts[index] as usize;
        if offset + ENTRY_HEADER_SIZE > self.entries_end {
            return Err(Error::Corruption("restart entry out of range".to_string()));
        }
        let unshared = BigEndian::read_u16(&self.data[offset + 2..]) as usize;
        let start = offset + ENTRY_HEADER_SIZE;
        if start + unshared > self.entries_end {
            return Err(Error::Corruption("restart key out of range".to_string()));
        }
        Ok(&self.data[start..start + unshared])
    }

    pub fn first(&mut self) -> Result<()> {
        self.valid = false;
        if self.restarts.is_empty() {
            return Ok(());
        }
        self.seek_to_restart(0)
    }

    pub fn last(&mut self) -> Result<()> {
        self.valid = false;
        if self.restarts.is_empty() {
            return Ok(());
        }
        self.seek_to_restart(self.restarts.len() - 1)?;
        while self.next_offset < self.entries_end {
            let next = self.next_offset;
            self.decode_at(next)?;
        }
        Ok(())
    }

    pub fn next(&mut self) -> Result<()> {
        debug_assert!(self.valid);
        if self.next_offset >= self.entries_end {
            self.valid = false;
            return Ok(());
        }
        let next = self.next_offset;
        self.decode_at(next)
    }

    pub fn prev(&mut self) -> Result<()> {
        debug_assert!(self.valid);
        let target = self.offset;
        if target == 0 {
            self.valid = false;
            return Ok(());
        }
        // Replay forward from the nearest restart before the current entry.
        let index = match self.restarts.binary_search(&(target as u32)) {
            Ok(0) | Err(0) => 0,
            Ok(i) => i - 1,
            Err(i) => i - 1,
        };
        self.seek_to_restart(index)?;
        while self.next_offset < target {
            let next = self.next_offset;
            self.decode_at(next)?;
        }
        Ok(())
    }

    /// Positions at the first entry with key >= target.
    pub fn seek_ge(&mut self, target: &[u8]) -> Result<()> {
        self.valid = false;
        if self.restarts.is_empty() {
            return Ok(());
        }
        // Rightmost restart whose key is < target.
        let (mut lo, mut hi) = (0usize, self.restarts.len() - 1);
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if self.cmp.compare(self.restart_key(mid)?, target) == Ordering::Less {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        self.seek_to_restart(lo)?;
        while self.cmp.compare(&self.key, target) == Ordering::Less {
            if self.next_offset >= self.entries_end {
                self.valid = false;
                return Ok(());
            }
            let next = self.next_offset;
            self.decode_at(next)?;
        }
        Ok(())
    }

    /// Positions at the last entry with key < target.
    pub fn seek_lt(&mut self, target: &[u8]) -> Result<()> {
        self.seek_ge(target)?;
        if self.valid {
            self.prev()
        } else {
            self.last()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::key::{encode_key, ValueKind};

    fn cmp() -> InternalKeyCmp {
        InternalKeyCmp(Arc::new(BytewiseComparator))
    }

    fn build(entries: &[(&[u8], u64, &[u8])]) -> BlockData {
        let mut builder = BlockBuilder::new(4);
        for (user, seq, value) in entries {
            builder.add(&encode_key(user, *seq, ValueKind::Set), value);
        }
        BlockData::Owned(Arc::new(builder.finish()))
    }

    fn keys_of(data: BlockData) -> Vec<Vec<u8>> {
        let mut iter = BlockIter::new(data, cmp()).expect("Failed to parse block");
        let mut keys = vec![];
        iter.first().expect("first failed");
        while iter.valid() {
            keys.push(iter.key().to_vec());
            iter.next().expect("next failed");
        }
        keys
    }

    #[test]
    fn test_forward_iteration() {
        let data = build(&[
            (b"aardvark", 3, b"1"),
            (b"aardwolf", 2, b"2"),
            (b"badger", 9, b"3"),
            (b"bear", 1, b"4"),
            (b"beaver", 5, b"5"),
        ]);
        let keys = keys_of(data);
        assert_eq!(keys.len(), 5);
        assert_eq!(keys[0], encode_key(b"aardvark", 3, ValueKind::Set));
        assert_eq!(keys[4], encode_key(b"beaver", 5, ValueKind::Set));
    }

    #[test]
    fn test_empty_block() {
        let builder = BlockBuilder::new(4);
        let data = BlockData::Owned(Arc::new(builder.finish()));
        let mut iter = BlockIter::new(data, cmp()).expect("Failed to parse block");
        iter.first().expect("first failed");
        assert!(!iter.valid());
        iter.last().expect("last failed");
        assert!(!iter.valid());
    }

    #[test]
    fn test_seek_ge() {
        let data = build(&[
            (b"apple", 1, b"a"),
            (b"banana", 1, b"b"),
            (b"cherry", 1, b"c"),
            (b"damson", 1, b"d"),
            (b"elder", 1, b"e"),
            (b"fig", 1, b"f"),
        ]);
        let mut iter = BlockIter::new(data, cmp()).expect("Failed to parse block");

        iter.seek_ge(&encode_key(b"banana", crate::key::MAX_SEQUENCE, ValueKind::Set))
            .expect("seek failed");
        assert!(iter.valid());
        assert_eq!(iter.value(), b"b");

        iter.seek_ge(&encode_key(b"blueberry", crate::key::MAX_SEQUENCE, ValueKind::Set))
            .expect("seek failed");
        assert!(iter.valid());
        assert_eq!(iter.value(), b"c");

        iter.seek_ge(&encode_key(b"zzz", crate::key::MAX_SEQUENCE, ValueKind::Set))
            .expect("seek failed");
        assert!(!iter.valid());
    }

    #[test]
    fn test_reverse_iteration() {
        let entries: Vec<(Vec<u8>, u64, Vec<u8>)> = (0..20)
            .map(|i| (format!("key_{i:03}").into_bytes(), 1, vec![i as u8]))
            .collect();
        let refs: Vec<(&[u8], u64, &[u8])> = entries
            .iter()
            .map(|(k, s, v)| (k.as_slice(), *s, v.as_slice()))
            .collect();
        let data = build(&refs);

        let mut iter = BlockIter::new(data, cmp()).expect("Failed to parse block");
        iter.last().expect("last failed");
        let mut reversed = vec![];
        while iter.valid() {
            reversed.push(iter.value().to_vec());
            iter.prev().expect("prev failed");
        }
        assert_eq!(reversed.len(), 20);
        assert_eq!(reversed[0], vec![19u8]);
        assert_eq!(reversed[19], vec![0u8]);
    }

    #[test]
    fn test_seek_lt() {
        let data = build(&[(b"b", 1, b"1"), (b"d", 1, b"2"), (b"f", 1, b"3")]);
        let mut iter = BlockIter::new(data, cmp()).expect("Failed to parse block");

        iter.seek_lt(&encode_key(b"d", crate::key::MAX_SEQUENCE, ValueKind::Set))
            .expect("seek failed");
        assert!(iter.valid());
        assert_eq!(iter.value(), b"1");

        iter.seek_lt(&encode_key(b"a", crate::key::MAX_SEQUENCE, ValueKind::Set))
            .expect("seek failed");
        assert!(!iter.valid());

        iter.seek_lt(&encode_key(b"zzz", crate::key::MAX_SEQUENCE, ValueKind::Set))
            .expect("seek failed");
        assert!(iter.valid());
        assert_eq!(iter.value(), b"3");
    }

    #[test]
    fn test_corrupt_block_rejected() {
        let data = BlockData::Owned(Arc::new(vec![0xff, 0xff]));
        assert!(BlockIter::new(data, cmp()).is_err());
    }
}
