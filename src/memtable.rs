//! In-memory sorted table over a concurrent skip list.
//!
//! Keys are encoded internal keys ordered by the engine's
//! [`InternalKeyCmp`], so a single memtable holds every version of a user
//! key with the newest first. Inserts are wait-free for readers: the
//! skip list publishes nodes with release stores and readers traverse
//! with acquire loads, so a consistent forward view needs no locks.
//!
//! Point records, range deletions, and range keys live in three separate
//! skip lists. Range records are rare and consulted as side structures
//! during iteration, so segregating them keeps the hot point path free of
//! kind filtering.
//!
//! A memtable walks through four states:
//! mutable -> immutable-pending-flush -> flushing -> flushed.
//! Only the tail of the engine's memtable queue is mutable, and each
//! memtable is tied to the WAL segment that records its writes.

use std::cmp::Ordering as CmpOrdering;
use std::ops::Bound;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::error::{Error, Result};
use crate::iterator::InternalIterator;
use crate::key::{encode_key, InternalKeyCmp, SeqNum, ValueKind};

/// Skip-list key: encoded internal key bytes ordered by the engine's
/// comparator rather than raw byte order.
pub(crate) struct OrderedKey {
    pub bytes: Vec<u8>,
    cmp: InternalKeyCmp,
}

impl OrderedKey {
    pub fn new(bytes: Vec<u8>, cmp: InternalKeyCmp) -> Self {
        Self { bytes, cmp }
    }
}

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp.compare(&self.bytes, &other.bytes) == CmpOrdering::Equal
    }
}

impl Eq for OrderedKey {}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.cmp.compare(&self.bytes, &other.bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemtableState {
    Mutable = 0,
    ImmutablePendingFlush = 1,
    Flushing = 2,
    Flushed = 3,
}

impl MemtableState {
    fn from_u8(byte: u8) -> Self {
        match byte {
            0 => MemtableState::Mutable,
            1 => MemtableState::ImmutablePendingFlush,
            2 => MemtableState::Flushing,
            _ => MemtableState::Flushed,
        }
    }
}

/// Per-entry overhead charged against the memtable budget, covering the
/// skip-list node and trailer.
const ENTRY_OVERHEAD: usize = 24;

pub struct Memtable {
    points: SkipMap<OrderedKey, Vec<u8>>,
    range_dels: SkipMap<OrderedKey, Vec<u8>>,
    range_keys: SkipMap<OrderedKey, Vec<u8>>,
    cmp: InternalKeyCmp,
    wal_num: u64,
    size: AtomicUsize,
    state: AtomicU8,
    /// In-flight commit appliers. A sealed memtable may still receive
    /// inserts from commits bound to it before the seal; flush waits for
    /// this count to drain to zero.
    writers: AtomicUsize,
}

impl Memtable {
    pub fn new(cmp: InternalKeyCmp, wal_num: u64) -> Self {
        Self {
            points: SkipMap::new(),
            range_dels: SkipMap::new(),
            range_keys: SkipMap::new(),
            cmp,
            wal_num,
            size: AtomicUsize::new(0),
            state: AtomicU8::new(MemtableState::Mutable as u8),
            writers: AtomicUsize::new(0),
        }
    }

    pub fn wal_num(&self) -> u64 {
        self.wal_num
    }

    pub fn state(&self) -> MemtableState {
        MemtableState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_mutable(&self) -> bool {
        self.state() == MemtableState::Mutable
    }

    /// Seals the memtable against further writes.
    pub fn mark_immutable(&self) {
        self.state
            .store(MemtableState::ImmutablePendingFlush as u8, Ordering::Release);
    }

    pub fn mark_flushing(&self) {
        self.state
            .store(MemtableState::Flushing as u8, Ordering::Release);
    }

    pub fn mark_flushed(&self) {
        self.state
            .store(MemtableState::Flushed as u8, Ordering::Release);
    }

    pub fn approximate_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty() && self.range_dels.is_empty() && self.range_keys.is_empty()
    }

    /// Registers an in-flight applier. Acquired by the commit pipeline
    /// while the memtable is the mutable tail; inserts stay legal after a
    /// seal until every ref drops.
    pub fn writer_ref(self: Arc<Self>) -> WriterRef {
        self.writers.fetch_add(1, Ordering::AcqRel);
        WriterRef(Arc::new(WriterRefInner { mem: self }))
    }

    pub fn writer_count(&self) -> usize {
        self.writers.load(Ordering::Acquire)
    }

    /// Inserts one record at its reserved sequence number. `LogData`
    /// records are WAL-only and rejected here.
    pub fn insert(&self, seq: SeqNum, kind: ValueKind, key: &[u8], value: &[u8]) -> Result<()> {
        if matches!(
            self.state(),
            MemtableState::Flushing | MemtableState::Flushed
        ) {
            return Err(Error::ReadOnly);
        }
        let encoded = OrderedKey::new(encode_key(key, seq, kind), self.cmp.clone());
        let charge = encoded.bytes.len() + value.len() + ENTRY_OVERHEAD;
        match kind {
            ValueKind::LogData => {
                return Err(Error::Invariant(
                    "LogData records never reach a memtable".to_string(),
                ))
            }
            ValueKind::RangeDelete => {
                self.range_dels.insert(encoded, value.to_vec());
            }
            k if k.is_range_key() => {
                self.range_keys.insert(encoded, value.to_vec());
            }
            _ => {
                self.points.insert(encoded, value.to_vec());
            }
        }
        self.size.fetch_add(charge, Ordering::Relaxed);
        Ok(())
    }

    /// Snapshot of the range deletions, as (internal key, value) pairs in
    /// key order.
    pub fn range_del_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.range_dels
            .iter()
            .map(|e| (e.key().bytes.clone(), e.value().clone()))
            .collect()
    }

    /// Snapshot of the range keys, as (internal key, value) pairs in key
    /// order.
    pub fn range_key_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.range_keys
            .iter()
            .map(|e| (e.key().bytes.clone(), e.value().clone()))
            .collect()
    }

    /// All entries across the three lists merged into key order, for the
    /// flush path.
    pub fn flush_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .points
            .iter()
            .map(|e| (e.key().bytes.clone(), e.value().clone()))
            .collect();
        entries.extend(self.range_del_entries());
        entries.extend(self.range_key_entries());
        let cmp = self.cmp.clone();
        entries.sort_by(|a, b| cmp.compare(&a.0, &b.0));
        entries
    }

    fn probe(&self, bytes: &[u8]) -> OrderedKey {
        OrderedKey::new(bytes.to_vec(), self.cmp.clone())
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("wal_num", &self.wal_num)
            .field("size", &self.approximate_size())
            .field("state", &self.state())
            .finish()
    }
}

/// Keeps a sealed memtable writable until the last in-flight commit
/// bound to it finishes applying.
#[derive(Clone)]
pub struct WriterRef(Arc<WriterRefInner>);

struct WriterRefInner {
    mem: Arc<Memtable>,
}

impl Drop for WriterRefInner {
    fn drop(&mut self) {
        self.mem.writers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Cursor over a memtable's point records.
///
/// Positions are materialized (key and value copied out) so the iterator
/// never holds a skip-list entry across calls; repositioning re-probes
/// the list, which stays correct under concurrent inserts.
pub struct MemtableIter {
    mem: Arc<Memtable>,
    key: Vec<u8>,
    value: Vec<u8>,
    valid: bool,
}

impl MemtableIter {
    pub fn new(mem: Arc<Memtable>) -> Self {
        Self {
            mem,
            key: Vec::new(),
            value: Vec::new(),
            valid: false,
        }
    }

    fn assign(&mut self, position: Option<(Vec<u8>, Vec<u8>)>) {
        match position {
            Some((key, value)) => {
                self.key = key;
                self.value = value;
                self.valid = true;
            }
            None => self.valid = false,
        }
    }
}

impl InternalIterator for MemtableIter {
    fn seek_ge(&mut self, key: &[u8]) -> Result<()> {
        let probe = self.mem.probe(key);
        let position = self
            .mem
            .points
            .lower_bound(Bound::Included(&probe))
            .map(|e| (e.key().bytes.clone(), e.value().clone()));
        self.assign(position);
        Ok(())
    }

    fn seek_lt(&mut self, key: &[u8]) -> Result<()> {
        let probe = self.mem.probe(key);
        let position = self
            .mem
            .points
            .upper_bound(Bound::Excluded(&probe))
            .map(|e| (e.key().bytes.clone(), e.value().clone()));
        self.assign(position);
        Ok(())
    }

    fn first(&mut self) -> Result<()> {
        let position = self
            .mem
            .points
            .front()
            .map(|e| (e.key().bytes.clone(), e.value().clone()));
        self.assign(position);
        Ok(())
    }

    fn last(&mut self) -> Result<()> {
        let position = self
            .mem
            .points
            .back()
            .map(|e| (e.key().bytes.clone(), e.value().clone()));
        self.assign(position);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if !self.valid {
            return Ok(());
        }
        let probe = self.mem.probe(&self.key);
        let position = self
            .mem
            .points
            .lower_bound(Bound::Excluded(&probe))
            .map(|e| (e.key().bytes.clone(), e.value().clone()));
        self.assign(position);
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        if !self.valid {
            return Ok(());
        }
        let probe = self.mem.probe(&self.key);
        let position = self
            .mem
            .points
            .upper_bound(Bound::Excluded(&probe))
            .map(|e| (e.key().bytes.clone(), e.value().clone()));
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
        &self.value
    }
}
