//! Write batches.
//!
//! A batch is an ordered log of operations in one contiguous buffer:
//!
//! ```text
//! +--------------+-----------+----------------------------------+
//! | base seq u64 | count u32 | ops...                           |
//! +--------------+-----------+----------------------------------+
//! op: [kind u8][key_len u32][key][value_len u32][value]
//! ```
//!
//! The header's base sequence number is assigned at commit time; the
//! buffer doubles as the WAL payload, so replay decodes exactly what was
//! committed. Range operations store their end key inside the value (see
//! [`encode_range_value`]), and an *indexed* batch additionally maintains
//! a skip list over its own operations so uncommitted state can be read
//! through an iterator.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crossbeam_skiplist::SkipMap;

use crate::error::{Error, Result};
use crate::iterator::InternalIterator;
use crate::key::{encode_key, InternalKeyCmp, SeqNum, ValueKind, SEQ_BATCH_BIT};
use crate::memtable::OrderedKey;

pub const BATCH_HEADER_SIZE: usize = 12;

pub struct Batch {
    buf: Vec<u8>,
    count: u32,
    index: Option<BatchIndex>,
}

struct BatchIndex {
    map: Arc<SkipMap<OrderedKey, u32>>,
    cmp: InternalKeyCmp,
}

impl Batch {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; BATCH_HEADER_SIZE],
            count: 0,
            index: None,
        }
    }

    /// A batch that also indexes its own operations for iteration over
    /// uncommitted state.
    pub fn new_indexed(cmp: InternalKeyCmp) -> Self {
        Self {
            buf: vec![0u8; BATCH_HEADER_SIZE],
            count: 0,
            index: Some(BatchIndex {
                map: Arc::new(SkipMap::new()),
                cmp,
            }),
        }
    }

    pub fn is_indexed(&self) -> bool {
        self.index.is_some()
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn byte_size(&self) -> usize {
        self.buf.len()
    }

    /// Assigns the reserved base sequence number; called by the commit
    /// pipeline just before the WAL append.
    pub(crate) fn finalize(&mut self, base_seq: SeqNum) {
        BigEndian::write_u64(&mut self.buf[0..8], base_seq);
        BigEndian::write_u32(&mut self.buf[8..12], self.count);
    }

    pub fn base_seq(&self) -> SeqNum {
        BigEndian::read_u64(&self.buf[0..8])
    }

    /// The encoded buffer, used as the WAL payload.
    pub(crate) fn payload(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the batch, yielding the buffer the pipeline logs and
    /// applies.
    pub(crate) fn into_payload(self) -> Vec<u8> {
        self.buf
    }

    fn push_op(&mut self, kind: ValueKind, key: &[u8], value: &[u8]) -> &mut Self {
        let offset = self.buf.len() as u32;
        self.buf.push(kind as u8);
        self.buf.write_u32::<BigEndian>(key.len() as u32).unwrap();
        self.buf.extend_from_slice(key);
        self.buf.write_u32::<BigEndian>(value.len() as u32).unwrap();
        self.buf.extend_from_slice(value);

        if let Some(index) = &self.index {
            if kind != ValueKind::LogData {
                let seq = SEQ_BATCH_BIT | self.count as u64;
                let encoded = OrderedKey::new(encode_key(key, seq, kind), index.cmp.clone());
                index.map.insert(encoded, offset);
            }
        }
        self.count += 1;
        self
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        self.push_op(ValueKind::Set, key, value)
    }

    pub fn delete(&mut self, key: &[u8]) -> &mut Self {
        self.push_op(ValueKind::Delete, key, &[])
    }

    pub fn single_delete(&mut self, key: &[u8]) -> &mut Self {
        self.push_op(ValueKind::SingleDelete, key, &[])
    }

    pub fn merge(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        self.push_op(ValueKind::Merge, key, value)
    }

    /// Deletes every key in `[lo, hi)` at sequence numbers below the
    /// batch's. An empty range is recorded but shadows nothing.
    pub fn delete_range(&mut self, lo: &[u8], hi: &[u8]) -> &mut Self {
        self.push_op(ValueKind::RangeDelete, lo, &encode_range_value(hi, &[]))
    }

    pub fn range_key_set(&mut self, start: &[u8], end: &[u8], suffix: &[u8], value: &[u8]) -> &mut Self {
        let mut payload = Vec::with_capacity(4 + suffix.len() + value.len());
        payload.write_u32::<BigEndian>(suffix.len() as u32).unwrap();
        payload.extend_from_slice(suffix);
        payload.extend_from_slice(value);
        self.push_op(ValueKind::RangeKeySet, start, &encode_range_value(end, &payload))
    }

    pub fn range_key_unset(&mut self, start: &[u8], end: &[u8], suffix: &[u8]) -> &mut Self {
        let mut payload = Vec::with_capacity(4 + suffix.len());
        payload.write_u32::<BigEndian>(suffix.len() as u32).unwrap();
        payload.extend_from_slice(suffix);
        self.push_op(ValueKind::RangeKeyUnset, start, &encode_range_value(end, &payload))
    }

    pub fn range_key_delete(&mut self, start: &[u8], end: &[u8]) -> &mut Self {
        self.push_op(ValueKind::RangeKeyDelete, start, &encode_range_value(end, &[]))
    }

    /// Opaque bytes recorded in the WAL but never applied to a memtable.
    pub fn log_data(&mut self, data: &[u8]) -> &mut Self {
        self.push_op(ValueKind::LogData, &[], data)
    }

    /// Iterates the batch's operations in insertion order.
    pub fn reader(&self) -> BatchReader<'_> {
        BatchReader {
            buf: &self.buf,
            pos: BATCH_HEADER_SIZE,
            remaining: self.count,
        }
    }

    /// Operation count recorded in an encoded payload's header.
    pub(crate) fn decoded_count(payload: &[u8]) -> Result<u32> {
        if payload.len() < BATCH_HEADER_SIZE {
            return Err(Error::Corruption("batch header too short".to_string()));
        }
        Ok(BigEndian::read_u32(&payload[8..12]))
    }

    /// Decodes a WAL payload back into (base_seq, ops).
    pub fn decode(payload: &[u8]) -> Result<(SeqNum, BatchReader<'_>)> {
        if payload.len() < BATCH_HEADER_SIZE {
            return Err(Error::Corruption("batch header too short".to_string()));
        }
        let base_seq = BigEndian::read_u64(&payload[0..8]);
        let count = BigEndian::read_u32(&payload[8..12]);
        Ok((
            base_seq,
            BatchReader {
                buf: payload,
                pos: BATCH_HEADER_SIZE,
                remaining: count,
            },
        ))
    }

    /// Iterator over an indexed batch's operations in key order, for the
    /// merge layer. Returns None for unindexed batches.
    pub fn internal_iter(&self) -> Option<BatchIter<'_>> {
        let index = self.index.as_ref()?;
        Some(BatchIter {
            batch: self,
            map: Arc::clone(&index.map),
            cmp: index.cmp.clone(),
            key: Vec::new(),
            offset: 0,
            valid: false,
        })
    }

    /// Range deletions recorded in this batch, for read-your-writes
    /// shadowing: (start internal key, value) pairs.
    pub fn range_del_entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for (i, op) in self.reader().enumerate() {
            let op = op?;
            if op.kind == ValueKind::RangeDelete {
                let seq = SEQ_BATCH_BIT | i as u64;
                out.push((
                    encode_key(op.key, seq, ValueKind::RangeDelete),
                    op.value.to_vec(),
                ));
            }
        }
        Ok(out)
    }

    /// Range-key operations recorded in this batch.
    pub fn range_key_entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for (i, op) in self.reader().enumerate() {
            let op = op?;
            if op.kind.is_range_key() {
                let seq = SEQ_BATCH_BIT | i as u64;
                out.push((encode_key(op.key, seq, op.kind), op.value.to_vec()));
            }
        }
        Ok(out)
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

/// Packs a range operation's end key ahead of its payload:
/// `[end_len u32][end key][payload]`.
pub fn encode_range_value(end: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + end.len() + payload.len());
    buf.write_u32::<BigEndian>(end.len() as u32).unwrap();
    buf.extend_from_slice(end);
    buf.extend_from_slice(payload);
    buf
}

/// Splits a range operation's value into (end key, payload).
pub fn decode_range_value(value: &[u8]) -> Result<(&[u8], &[u8])> {
    if value.len() < 4 {
        return Err(Error::Corruption("range value too short".to_string()));
    }
    let end_len = BigEndian::read_u32(&value[0..4]) as usize;
    if value.len() < 4 + end_len {
        return Err(Error::Corruption("range value end key truncated".to_string()));
    }
    Ok((&value[4..4 + end_len], &value[4 + end_len..]))
}

/// Splits a range-key payload into (suffix, value).
pub fn decode_range_key_payload(payload: &[u8]) -> Result<(&[u8], &[u8])> {
    if payload.is_empty() {
        return Ok((&[], &[]));
    }
    if payload.len() < 4 {
        return Err(Error::Corruption("range key payload too short".to_string()));
    }
    let suffix_len = BigEndian::read_u32(&payload[0..4]) as usize;
    if payload.len() < 4 + suffix_len {
        return Err(Error::Corruption("range key suffix truncated".to_string()));
    }
    Ok((&payload[4..4 + suffix_len], &payload[4 + suffix_len..]))
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOp<'a> {
    pub kind: ValueKind,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

pub struct BatchReader<'a> {
    buf: &'a [u8],
    pos: usize,
    remaining: u32,
}

impl<'a> BatchReader<'a> {
    fn read_op(&mut self) -> Result<BatchOp<'a>> {
        let buf = self.buf;
        if self.pos + 1 + 4 > buf.len() {
            return Err(Error::Corruption("batch op header truncated".to_string()));
        }
        let kind = ValueKind::from_u8(buf[self.pos])?;
        let key_len = BigEndian::read_u32(&buf[self.pos + 1..]) as usize;
        let key_start = self.pos + 5;
        if key_start + key_len + 4 > buf.len() {
            return Err(Error::Corruption("batch op key truncated".to_string()));
        }
        let key = &buf[key_start..key_start + key_len];
        let value_len = BigEndian::read_u32(&buf[key_start + key_len..]) as usize;
        let value_start = key_start + key_len + 4;
        if value_start + value_len > buf.len() {
            return Err(Error::Corruption("batch op value truncated".to_string()));
        }
        let value = &buf[value_start..value_start + value_len];
        self.pos = value_start + value_len;
        Ok(BatchOp { kind, key, value })
    }
}

impl<'a> Iterator for BatchReader<'a> {
    type Item = Result<BatchOp<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.read_op())
    }
}

/// Cursor over an indexed batch's point operations in internal-key order.
pub struct BatchIter<'a> {
    batch: &'a Batch,
    map: Arc<SkipMap<OrderedKey, u32>>,
    cmp: InternalKeyCmp,
    key: Vec<u8>,
    offset: u32,
    valid: bool,
}

impl BatchIter<'_> {
    fn assign(&mut self, position: Option<(Vec<u8>, u32)>) {
        match position {
            Some((key, offset)) => {
                self.key = key;
                self.offset = offset;
                self.valid = true;
            }
            None => self.valid = false,
        }
    }

    fn probe(&self, bytes: &[u8]) -> OrderedKey {
        OrderedKey::new(bytes.to_vec(), self.cmp.clone())
    }

    /// Decodes the op this iterator currently points at.
    fn current_op(&self) -> BatchOp<'_> {
        let mut reader = BatchReader {
            buf: &self.batch.buf,
            pos: self.offset as usize,
            remaining: 1,
        };
        reader.read_op().expect("indexed offset points at valid op")
    }
}

impl InternalIterator for BatchIter<'_> {
    fn seek_ge(&mut self, key: &[u8]) -> Result<()> {
        let probe = self.probe(key);
        let position = self
            .map
            .lower_bound(std::ops::Bound::Included(&probe))
            .map(|e| (e.key().bytes.clone(), *e.value()));
        self.assign(position);
        Ok(())
    }

    fn seek_lt(&mut self, key: &[u8]) -> Result<()> {
        let probe = self.probe(key);
        let position = self
            .map
            .upper_bound(std::ops::Bound::Excluded(&probe))
            .map(|e| (e.key().bytes.clone(), *e.value()));
        self.assign(position);
        Ok(())
    }

    fn first(&mut self) -> Result<()> {
        let position = self
            .map
            .front()
            .map(|e| (e.key().bytes.clone(), *e.value()));
        self.assign(position);
        Ok(())
    }

    fn last(&mut self) -> Result<()> {
        let position = self.map.back().map(|e| (e.key().bytes.clone(), *e.value()));
        self.assign(position);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if !self.valid {
            return Ok(());
        }
        let probe = self.probe(&self.key);
        let position = self
            .map
            .lower_bound(std::ops::Bound::Excluded(&probe))
            .map(|e| (e.key().bytes.clone(), *e.value()));
        self.assign(position);
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        if !self.valid {
            return Ok(());
        }
        let probe = self.probe(&self.key);
        let position = self
            .map
            .upper_bound(std::ops::Bound::Excluded(&probe))
            .map(|e| (e.key().bytes.clone(), *e.value()));
        self.assign(position);
        Ok(())
    }

    fn valid(&self) -> bool {
        self.valid
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        self.current_op().value
    }
}
