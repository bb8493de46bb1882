//! Range keys: suffixed annotations over key spans.
//!
//! `RangeKeySet` records annotate `[start, end)` with a (suffix, value)
//! pair; `RangeKeyUnset` removes a suffix from a span at a later
//! sequence number, and `RangeKeyDelete` removes every suffix. Range-key
//! records travel beside point data (separate memtable list, separate
//! table block) and are combined lazily at read time: the set resolves
//! which (suffix, value) pairs are active at a given user key under the
//! snapshot's visibility.
//!
//! Masking: when an iterator enables range-key masking, a point key is
//! hidden if an active range key covers it with a suffix that sorts at
//! or after the point key's own suffix (bytewise).

use std::sync::Arc;

use crate::batch::{decode_range_key_payload, decode_range_value};
use crate::comparator::Comparator;
use crate::error::{Error, Result};
use crate::key::{decode_key, SeqNum, ValueKind};

#[derive(Debug, Clone)]
struct Span {
    start: Vec<u8>,
    end: Vec<u8>,
    seq: SeqNum,
    kind: ValueKind,
    suffix: Vec<u8>,
    value: Vec<u8>,
}

pub struct RangeKeySet {
    spans: Vec<Span>,
    cmp: Arc<dyn Comparator>,
}

impl RangeKeySet {
    pub fn new(cmp: Arc<dyn Comparator>) -> Self {
        Self {
            spans: Vec::new(),
            cmp,
        }
    }

    /// Adds a range-key record from its encoded form.
    pub fn add_encoded(&mut self, internal_key: &[u8], value: &[u8]) -> Result<()> {
        let (start, seq, kind) = decode_key(internal_key)?;
        if !kind.is_range_key() {
            return Err(Error::Invariant(format!(
                "record kind {kind:?} is not a range key"
            )));
        }
        let (end, payload) = decode_range_value(value)?;
        let (suffix, payload_value) = decode_range_key_payload(payload)?;
        if self.cmp.compare(start, end) != std::cmp::Ordering::Less {
            return Ok(());
        }
        self.spans.push(Span {
            start: start.to_vec(),
            end: end.to_vec(),
            seq,
            kind,
            suffix: suffix.to_vec(),
            value: payload_value.to_vec(),
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    fn covers(&self, span: &Span, key: &[u8]) -> bool {
        use std::cmp::Ordering;
        self.cmp.compare(&span.start, key) != Ordering::Greater
            && self.cmp.compare(key, &span.end) == Ordering::Less
    }

    /// The (suffix, value) pairs active at `key`: every visible set not
    /// superseded by a newer unset of the same suffix or a newer delete.
    pub fn active_at(&self, key: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for set in &self.spans {
            if set.kind != ValueKind::RangeKeySet || !self.covers(set, key) {
                continue;
            }
            let dead = self.spans.iter().any(|other| {
                other.seq > set.seq
                    && self.covers(other, key)
                    && match other.kind {
                        ValueKind::RangeKeyDelete => true,
                        ValueKind::RangeKeyUnset => other.suffix == set.suffix,
                        _ => false,
                    }
            });
            if !dead && !out.iter().any(|(suffix, _)| suffix == &set.suffix) {
                out.push((set.suffix.clone(), set.value.clone()));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Whether a point key with `point_suffix` is masked at `key`. Point
    /// keys without a suffix (the default comparator splits none) are
    /// never masked.
    pub fn masks(&self, key: &[u8], point_suffix: &[u8]) -> bool {
        if point_suffix.is_empty() {
            return false;
        }
        self.active_at(key)
            .iter()
            .any(|(suffix, _)| !suffix.is_empty() && suffix.as_slice() >= point_suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::encode_range_value;
    use crate::key::encode_key;

    fn set() -> RangeKeySet {
        RangeKeySet::new(Arc::new(crate::comparator::BytewiseComparator))
    }

    fn add(rk: &mut RangeKeySet, kind: ValueKind, start: &[u8], end: &[u8], seq: SeqNum, suffix: &[u8], value: &[u8]) {
        let key = encode_key(start, seq, kind);
        let mut payload = Vec::new();
        use byteorder::{BigEndian, WriteBytesExt};
        payload.write_u32::<BigEndian>(suffix.len() as u32).unwrap();
        payload.extend_from_slice(suffix);
        payload.extend_from_slice(value);
        let encoded = encode_range_value(end, &payload);
        rk.add_encoded(&key, &encoded).expect("add failed");
    }

    #[test]
    fn test_set_active_inside_span() {
        let mut rk = set();
        add(&mut rk, ValueKind::RangeKeySet, b"b", b"f", 5, b"@1", b"v");

        assert_eq!(rk.active_at(b"c"), vec![(b"@1".to_vec(), b"v".to_vec())]);
        assert!(rk.active_at(b"a").is_empty());
        assert!(rk.active_at(b"f").is_empty(), "end is exclusive");
    }

    #[test]
    fn test_unset_removes_suffix() {
        let mut rk = set();
        add(&mut rk, ValueKind::RangeKeySet, b"a", b"z", 5, b"@1", b"v1");
        add(&mut rk, ValueKind::RangeKeySet, b"a", b"z", 6, b"@2", b"v2");
        add(&mut rk, ValueKind::RangeKeyUnset, b"a", b"z", 7, b"@1", b"");

        let active = rk.active_at(b"m");
        assert_eq!(active, vec![(b"@2".to_vec(), b"v2".to_vec())]);
    }

    #[test]
    fn test_delete_removes_all() {
        let mut rk = set();
        add(&mut rk, ValueKind::RangeKeySet, b"a", b"z", 5, b"@1", b"v1");
        add(&mut rk, ValueKind::RangeKeyDelete, b"a", b"m", 9, b"", b"");

        assert!(rk.active_at(b"c").is_empty());
        assert_eq!(rk.active_at(b"n").len(), 1, "outside the delete span");
    }

    #[test]
    fn test_unset_before_set_is_inert() {
        let mut rk = set();
        add(&mut rk, ValueKind::RangeKeyUnset, b"a", b"z", 3, b"@1", b"");
        add(&mut rk, ValueKind::RangeKeySet, b"a", b"z", 5, b"@1", b"v");
        assert_eq!(rk.active_at(b"m").len(), 1);
    }

    #[test]
    fn test_masking() {
        let mut rk = set();
        add(&mut rk, ValueKind::RangeKeySet, b"a", b"z", 5, b"@5", b"v");

        assert!(rk.masks(b"m", b"@3"), "same or higher suffix masks");
        assert!(rk.masks(b"m", b"@5"));
        assert!(!rk.masks(b"m", b"@7"));
        assert!(!rk.masks(b"zz", b"@3"), "outside the span");
    }
}
