//! The public iterator.
//!
//! Wraps the merged internal iterator and turns raw versioned records
//! into user-visible (key, value) pairs: one emission per user key,
//! chosen from the newest visible record after tombstone suppression,
//! merge folding, and range-key masking. Also enforces bounds, caller
//! limits, cancellation, and direction reversal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::merge::MergingIter;
use super::InternalIterator;
use crate::batch::Batch;
use crate::comparator::MergeOperator;
use crate::error::{Error, Result};
use crate::key::{decode_key, search_key, user_key, InternalKeyCmp, SeqNum, ValueKind};
use crate::rangedel::TombstoneSet;
use crate::rangekey::RangeKeySet;
use crate::readstate::ReadState;

/// Where a positioning call left the iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterValidity {
    /// Positioned at a key within bounds.
    Valid,
    /// No further keys in this direction.
    Exhausted,
    /// The caller-supplied limit stopped the scan before exhaustion;
    /// iteration can resume cheaply past the limit.
    AtLimit,
}

/// Relationship between the merged iterator's position and the exposed
/// key; direction reversal depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// At an unprocessed record block (after an AtLimit stop).
    Cur,
    /// Past the exposed key's records (forward iteration).
    Next,
    /// Before the exposed key's records (reverse iteration).
    Prev,
}

/// Options for constructing an iterator.
#[derive(Default)]
pub struct IterOptions<'a> {
    /// Inclusive lower bound on user keys.
    pub lower_bound: Option<Vec<u8>>,
    /// Exclusive upper bound on user keys.
    pub upper_bound: Option<Vec<u8>>,
    /// Read through this uncommitted indexed batch.
    pub batch: Option<&'a Batch>,
    /// Checked at seek boundaries and between steps.
    pub cancel: Option<Arc<AtomicBool>>,
    /// Hide point keys covered by a range key with an equal or
    /// higher-sorting suffix.
    pub range_key_masking: bool,
}

pub struct Iter<'a> {
    merge: MergingIter<'a>,
    cmp: InternalKeyCmp,
    merger: Option<Arc<dyn MergeOperator>>,
    tombstones: TombstoneSet,
    range_keys: RangeKeySet,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    cancel: Option<Arc<AtomicBool>>,
    masking: bool,
    validity: IterValidity,
    position: Position,
    key: Vec<u8>,
    value: Vec<u8>,
    err: Option<Error>,
    /// Pins the captured memtables and version for the iterator's life.
    _read_state: Option<Arc<ReadState>>,
}

impl<'a> Iter<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        merge: MergingIter<'a>,
        cmp: InternalKeyCmp,
        merger: Option<Arc<dyn MergeOperator>>,
        tombstones: TombstoneSet,
        range_keys: RangeKeySet,
        opts: &IterOptions<'a>,
        read_state: Option<Arc<ReadState>>,
    ) -> Self {
        Self {
            merge,
            cmp,
            merger,
            tombstones,
            range_keys,
            lower: opts.lower_bound.clone(),
            upper: opts.upper_bound.clone(),
            cancel: opts.cancel.clone(),
            masking: opts.range_key_masking,
            validity: IterValidity::Exhausted,
            position: Position::Next,
            key: Vec::new(),
            value: Vec::new(),
            err: None,
            _read_state: read_state,
        }
    }

    pub fn valid(&self) -> bool {
        self.validity == IterValidity::Valid && self.err.is_none()
    }

    pub fn validity(&self) -> IterValidity {
        if self.err.is_some() {
            IterValidity::Exhausted
        } else {
            self.validity
        }
    }

    /// The first sticky error, if any.
    pub fn error(&self) -> Option<Error> {
        self.err.clone()
    }

    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.value
    }

    /// The (suffix, value) range keys active at the current position.
    pub fn range_keys(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        if !self.valid() {
            return Vec::new();
        }
        self.range_keys.active_at(&self.key)
    }

    /// Replaces the iteration bounds and invalidates the position; the
    /// snapshot is unchanged. Callers must re-seek.
    pub fn set_bounds(&mut self, lower: Option<Vec<u8>>, upper: Option<Vec<u8>>) {
        self.lower = lower;
        self.upper = upper;
        self.validity = IterValidity::Exhausted;
        self.position = Position::Next;
        self.key.clear();
        self.value.clear();
    }

    /// Releases the iterator, surfacing any pending error.
    pub fn close(self) -> Result<()> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn latch(&mut self, result: Result<()>) {
        if let Err(err) = result {
            if self.err.is_none() {
                self.err = Some(err);
            }
            self.validity = IterValidity::Exhausted;
        }
    }

    fn check_cancel(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(Error::Canceled),
            _ => Ok(()),
        }
    }

    pub fn seek_ge(&mut self, key: &[u8]) -> bool {
        self.seek_ge_with_limit(key, None) == IterValidity::Valid
    }

    /// Seek with a caller limit: scanning stops with `AtLimit` at the
    /// first key >= `limit`, letting callers page through a range
    /// without paying for records past the page.
    pub fn seek_ge_with_limit(&mut self, key: &[u8], limit: Option<&[u8]>) -> IterValidity {
        let result = self.seek_ge_inner(key, limit);
        self.latch(result);
        self.validity()
    }

    fn seek_ge_inner(&mut self, key: &[u8], limit: Option<&[u8]>) -> Result<()> {
        self.check_cancel()?;
        let target = match &self.lower {
            Some(lower) if self.cmp.user_cmp().compare(key, lower) == std::cmp::Ordering::Less => {
                lower.clone()
            }
            _ => key.to_vec(),
        };
        self.merge.seek_ge(&search_key(&target))?;
        self.find_next_entry(limit)
    }

    /// Seek with a prefix hint: table sources consult their bloom
    /// filters and may skip without touching data blocks. Iteration
    /// after a prefix seek is only defined within the prefix.
    pub fn seek_prefix_ge(&mut self, prefix: &[u8], key: &[u8]) -> bool {
        let result = self.seek_prefix_ge_inner(prefix, key);
        self.latch(result);
        self.valid()
    }

    fn seek_prefix_ge_inner(&mut self, prefix: &[u8], key: &[u8]) -> Result<()> {
        self.check_cancel()?;
        self.merge.seek_prefix_ge(prefix, &search_key(key))?;
        self.find_next_entry(None)
    }

    pub fn seek_lt(&mut self, key: &[u8]) -> bool {
        self.seek_lt_with_limit(key, None) == IterValidity::Valid
    }

    pub fn seek_lt_with_limit(&mut self, key: &[u8], limit: Option<&[u8]>) -> IterValidity {
        let result = self.seek_lt_inner(key, limit);
        self.latch(result);
        self.validity()
    }

    fn seek_lt_inner(&mut self, key: &[u8], limit: Option<&[u8]>) -> Result<()> {
        self.check_cancel()?;
        let target = match &self.upper {
            Some(upper)
                if self.cmp.user_cmp().compare(key, upper) == std::cmp::Ordering::Greater =>
            {
                upper.clone()
            }
            _ => key.to_vec(),
        };
        self.merge.seek_lt(&search_key(&target))?;
        self.find_prev_entry(limit)
    }

    pub fn first(&mut self) -> bool {
        let result = match self.lower.clone() {
            Some(lower) => self.seek_ge_inner(&lower, None),
            None => self
                .merge
                .first()
                .and_then(|()| self.find_next_entry(None)),
        };
        self.latch(result);
        self.valid()
    }

    pub fn last(&mut self) -> bool {
        let result = match self.upper.clone() {
            Some(upper) => self.seek_lt_inner(&upper, None),
            None => self.merge.last().and_then(|()| self.find_prev_entry(None)),
        };
        self.latch(result);
        self.valid()
    }

    pub fn next(&mut self) -> bool {
        self.next_with_limit(None) == IterValidity::Valid
    }

    pub fn next_with_limit(&mut self, limit: Option<&[u8]>) -> IterValidity {
        let result = self.next_inner(limit);
        self.latch(result);
        self.validity()
    }

    fn next_inner(&mut self, limit: Option<&[u8]>) -> Result<()> {
        self.check_cancel()?;
        match self.position {
            Position::Next | Position::Cur => {}
            Position::Prev => {
                // Reverse-to-forward: step over the exposed key's block.
                let exposed = self.key.clone();
                if !self.merge.valid() {
                    self.merge.first()?;
                } else {
                    self.merge.next()?;
                }
                while self.merge.valid() && self.same_user(&exposed) {
                    self.merge.next()?;
                }
            }
        }
        self.find_next_entry(limit)
    }

    pub fn prev(&mut self) -> bool {
        self.prev_with_limit(None) == IterValidity::Valid
    }

    pub fn prev_with_limit(&mut self, limit: Option<&[u8]>) -> IterValidity {
        let result = self.prev_inner(limit);
        self.latch(result);
        self.validity()
    }

    fn prev_inner(&mut self, limit: Option<&[u8]>) -> Result<()> {
        self.check_cancel()?;
        match self.position {
            Position::Prev => {}
            Position::Cur => {
                // At an unprocessed block: back off to before it.
                if self.merge.valid() {
                    let cur = user_key(self.merge.key()).to_vec();
                    self.merge.seek_lt(&search_key(&cur))?;
                }
            }
            Position::Next => {
                // Forward-to-reverse: step back over the exposed block.
                let exposed = self.key.clone();
                if !self.merge.valid() {
                    self.merge.last()?;
                } else {
                    self.merge.prev()?;
                }
                while self.merge.valid() && self.same_user(&exposed) {
                    self.merge.prev()?;
                }
            }
        }
        self.find_prev_entry(limit)
    }

    /// Forward scan: consume record blocks until one resolves to a
    /// visible value or a bound/limit stops us.
    fn find_next_entry(&mut self, limit: Option<&[u8]>) -> Result<()> {
        while self.merge.valid() {
            self.check_cancel()?;
            let user = user_key(self.merge.key()).to_vec();
            if let Some(upper) = &self.upper {
                if self.cmp.user_cmp().compare(&user, upper) != std::cmp::Ordering::Less {
                    self.validity = IterValidity::Exhausted;
                    self.position = Position::Next;
                    return Ok(());
                }
            }
            if let Some(lim) = limit {
                if self.cmp.user_cmp().compare(&user, lim) != std::cmp::Ordering::Less {
                    self.validity = IterValidity::AtLimit;
                    self.position = Position::Cur;
                    self.key = user;
                    self.value.clear();
                    return Ok(());
                }
            }

            let records = self.collect_forward(&user)?;
            if let Some(value) = self.resolve(&user, &records)? {
                if self.should_mask(&user) {
                    continue;
                }
                self.key = user;
                self.value = value;
                self.validity = IterValidity::Valid;
                self.position = Position::Next;
                return Ok(());
            }
        }
        self.validity = IterValidity::Exhausted;
        self.position = Position::Next;
        Ok(())
    }

    /// Reverse scan: same contract, walking backwards.
    fn find_prev_entry(&mut self, limit: Option<&[u8]>) -> Result<()> {
        while self.merge.valid() {
            self.check_cancel()?;
            let user = user_key(self.merge.key()).to_vec();
            if let Some(lower) = &self.lower {
                if self.cmp.user_cmp().compare(&user, lower) == std::cmp::Ordering::Less {
                    self.validity = IterValidity::Exhausted;
                    self.position = Position::Prev;
                    return Ok(());
                }
            }
            if let Some(lim) = limit {
                if self.cmp.user_cmp().compare(&user, lim) == std::cmp::Ordering::Less {
                    self.validity = IterValidity::AtLimit;
                    self.position = Position::Cur;
                    self.key = user;
                    self.value.clear();
                    return Ok(());
                }
            }

            let records = self.collect_backward(&user)?;
            if let Some(value) = self.resolve(&user, &records)? {
                if self.should_mask(&user) {
                    continue;
                }
                self.key = user;
                self.value = value;
                self.validity = IterValidity::Valid;
                self.position = Position::Prev;
                return Ok(());
            }
        }
        self.validity = IterValidity::Exhausted;
        self.position = Position::Prev;
        Ok(())
    }

    /// Collects the visible, unshadowed records of `user`'s block going
    /// forward. The merge iterator ends up past the block.
    fn collect_forward(&mut self, user: &[u8]) -> Result<Vec<(SeqNum, ValueKind, Vec<u8>)>> {
        let mut records = Vec::new();
        while self.merge.valid() && self.same_user(user) {
            let (_, seq, kind) = decode_key(self.merge.key())?;
            if !self.tombstones.shadows(user, seq) {
                records.push((seq, kind, self.merge.value().to_vec()));
            }
            self.merge.next()?;
        }
        Ok(records)
    }

    /// Reverse collection: walking prev yields the block oldest first,
    /// so the result is reversed into newest-first order. The merge
    /// iterator ends up before the block.
    fn collect_backward(&mut self, user: &[u8]) -> Result<Vec<(SeqNum, ValueKind, Vec<u8>)>> {
        let mut records = Vec::new();
        while self.merge.valid() && self.same_user(user) {
            let (_, seq, kind) = decode_key(self.merge.key())?;
            if !self.tombstones.shadows(user, seq) {
                records.push((seq, kind, self.merge.value().to_vec()));
            }
            self.merge.prev()?;
        }
        records.reverse();
        Ok(records)
    }

    /// Resolves one user key's records (newest first) to its visible
    /// value, honoring point tombstones, single deletes, and merges.
    fn resolve(
        &self,
        user: &[u8],
        records: &[(SeqNum, ValueKind, Vec<u8>)],
    ) -> Result<Option<Vec<u8>>> {
        let mut idx = 0;
        loop {
            let Some((_, kind, value)) = records.get(idx) else {
                return Ok(None);
            };
            match kind {
                ValueKind::Set => return Ok(Some(value.clone())),
                ValueKind::Delete => return Ok(None),
                ValueKind::SingleDelete => {
                    // Cancels the newest older record if it is a Set (or
                    // Merge); earlier history resumes. A Delete below the
                    // single delete still deletes.
                    match records.get(idx + 1) {
                        Some((_, ValueKind::Set, _)) | Some((_, ValueKind::Merge, _)) => {
                            idx += 2;
                        }
                        Some(_) => idx += 1,
                        None => return Ok(None),
                    }
                }
                ValueKind::Merge => {
                    let mut operands = vec![value.clone()];
                    let mut base = None;
                    let mut j = idx + 1;
                    while let Some((_, kind2, value2)) = records.get(j) {
                        match kind2 {
                            ValueKind::Merge => {
                                operands.push(value2.clone());
                                j += 1;
                            }
                            ValueKind::Set => {
                                base = Some(value2.clone());
                                break;
                            }
                            ValueKind::Delete | ValueKind::SingleDelete => break,
                            _ => j += 1,
                        }
                    }
                    let merger = self.merger.as_ref().ok_or_else(|| {
                        Error::InvalidArgument(
                            "merge records present but no merge operator configured".to_string(),
                        )
                    })?;
                    operands.reverse();
                    return match merger.merge(user, base.as_deref(), &operands) {
                        Some(merged) => Ok(Some(merged)),
                        None => Err(Error::Corruption(format!(
                            "merge operator failed for key {:?}",
                            String::from_utf8_lossy(user)
                        ))),
                    };
                }
                // Range kinds and LogData never reach the point path;
                // skip defensively.
                _ => idx += 1,
            }
        }
    }

    fn same_user(&self, user: &[u8]) -> bool {
        self.cmp
            .user_cmp()
            .compare(user_key(self.merge.key()), user)
            == std::cmp::Ordering::Equal
    }

    fn should_mask(&self, user: &[u8]) -> bool {
        if !self.masking {
            return false;
        }
        let (_, suffix) = self.cmp.user_cmp().split_suffix(user);
        self.range_keys.masks(user, suffix)
    }
}
