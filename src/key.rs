//! Internal key encoding.
//!
//! Every record in a memtable or SSTable is keyed by an *internal key*:
//! the user key followed by an 8-byte trailer packing the sequence number
//! and the record kind.
//!
//! ```text
//! +----------------------+---------------------------+
//! | user key (var len)   | trailer (8 bytes, BE)     |
//! +----------------------+---------------------------+
//!                          trailer = seq << 8 | kind
//! ```
//!
//! Ordering: user key ascending (by the configured comparator), then
//! trailer *descending*. Descending trailers mean the newest write for a
//! user key sorts first, which is what lets the merge iterator emit the
//! visible record and skip everything it shadows in a single forward pass.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::comparator::Comparator;
use crate::error::{Error, Result};

/// Sequence numbers are 56-bit; the trailer's low byte holds the kind.
pub type SeqNum = u64;

/// The largest representable sequence number.
pub const MAX_SEQUENCE: SeqNum = (1 << 56) - 1;

/// Marks sequence numbers belonging to an uncommitted indexed batch.
/// Batch entries sort above all committed entries for the same user key
/// and are always visible to the iterator that owns the batch.
pub const SEQ_BATCH_BIT: SeqNum = 1 << 55;

pub const TRAILER_SIZE: usize = 8;

/// The kind of a single record.
///
/// The numeric values participate in ordering: among records with equal
/// user key and sequence number, the higher kind sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueKind {
    Delete = 0,
    Set = 1,
    Merge = 2,
    LogData = 3,
    SingleDelete = 4,
    RangeDelete = 5,
    RangeKeySet = 6,
    RangeKeyUnset = 7,
    RangeKeyDelete = 8,
}

impl ValueKind {
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(ValueKind::Delete),
            1 => Ok(ValueKind::Set),
            2 => Ok(ValueKind::Merge),
            3 => Ok(ValueKind::LogData),
            4 => Ok(ValueKind::SingleDelete),
            5 => Ok(ValueKind::RangeDelete),
            6 => Ok(ValueKind::RangeKeySet),
            7 => Ok(ValueKind::RangeKeyUnset),
            8 => Ok(ValueKind::RangeKeyDelete),
            other => Err(Error::Corruption(format!("invalid value kind: {other}"))),
        }
    }

    /// Range-key kinds travel through a parallel pipeline and never appear
    /// as point records to the user.
    pub fn is_range_key(self) -> bool {
        matches!(
            self,
            ValueKind::RangeKeySet | ValueKind::RangeKeyUnset | ValueKind::RangeKeyDelete
        )
    }
}

/// Packs a sequence number and kind into a trailer.
pub fn pack_trailer(seq: SeqNum, kind: ValueKind) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE);
    (seq << 8) | kind as u64
}

/// Splits a trailer into sequence number and kind.
pub fn unpack_trailer(trailer: u64) -> Result<(SeqNum, ValueKind)> {
    let kind = ValueKind::from_u8((trailer & 0xff) as u8)?;
    Ok((trailer >> 8, kind))
}

/// Encodes an internal key into a fresh buffer.
pub fn encode_key(user_key: &[u8], seq: SeqNum, kind: ValueKind) -> Vec<u8> {
    let mut buf = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
    buf.extend_from_slice(user_key);
    append_trailer(&mut buf, seq, kind);
    buf
}

/// Appends the 8-byte trailer to an existing buffer.
pub fn append_trailer(buf: &mut Vec<u8>, seq: SeqNum, kind: ValueKind) {
    let mut trailer = [0u8; TRAILER_SIZE];
    BigEndian::write_u64(&mut trailer, pack_trailer(seq, kind));
    buf.extend_from_slice(&trailer);
}

/// Returns the user-key portion of an encoded internal key.
pub fn user_key(key: &[u8]) -> &[u8] {
    debug_assert!(key.len() >= TRAILER_SIZE);
    &key[..key.len().saturating_sub(TRAILER_SIZE)]
}

/// Returns the trailer of an encoded internal key.
pub fn trailer(key: &[u8]) -> u64 {
    debug_assert!(key.len() >= TRAILER_SIZE);
    BigEndian::read_u64(&key[key.len() - TRAILER_SIZE..])
}

/// Decodes an internal key into (user key, seq, kind).
pub fn decode_key(key: &[u8]) -> Result<(&[u8], SeqNum, ValueKind)> {
    if key.len() < TRAILER_SIZE {
        return Err(Error::Corruption(format!(
            "internal key too short: {} bytes",
            key.len()
        )));
    }
    let (seq, kind) = unpack_trailer(trailer(key))?;
    Ok((user_key(key), seq, kind))
}

/// An internal key that sorts before every real record of `user_key`,
/// used as a seek target for positioning at a user key's newest version.
pub fn search_key(user_key: &[u8]) -> Vec<u8> {
    encode_key(user_key, MAX_SEQUENCE, ValueKind::RangeKeyDelete)
}

/// Whether a record at `seq` is visible to a reader at `visible`.
///
/// Batch entries (SEQ_BATCH_BIT set) are visible only within the batch's
/// own iterator, which is the only place they can appear.
pub fn is_visible(seq: SeqNum, visible: SeqNum) -> bool {
    seq & SEQ_BATCH_BIT != 0 || seq <= visible
}

/// Compares encoded internal keys: user key ascending by the wrapped
/// comparator, then trailer descending.
#[derive(Clone)]
pub struct InternalKeyCmp(pub Arc<dyn Comparator>);

impl InternalKeyCmp {
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.0.compare(user_key(a), user_key(b)) {
            Ordering::Equal => trailer(b).cmp(&trailer(a)),
            ord => ord,
        }
    }

    pub fn user_cmp(&self) -> &Arc<dyn Comparator> {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    #[test]
    fn test_trailer_round_trip() {
        let trailer = pack_trailer(42, ValueKind::Merge);
        let (seq, kind) = unpack_trailer(trailer).expect("Failed to unpack trailer");
        assert_eq!(seq, 42);
        assert_eq!(kind, ValueKind::Merge);
    }

    #[test]
    fn test_decode_key() {
        let key = encode_key(b"user", 7, ValueKind::Set);
        let (user, seq, kind) = decode_key(&key).expect("Failed to decode key");
        assert_eq!(user, b"user");
        assert_eq!(seq, 7);
        assert_eq!(kind, ValueKind::Set);
    }

    #[test]
    fn test_decode_too_short() {
        assert!(decode_key(b"abc").is_err());
    }

    #[test]
    fn test_newest_sorts_first() {
        let cmp = InternalKeyCmp(Arc::new(BytewiseComparator));
        let old = encode_key(b"k", 5, ValueKind::Set);
        let new = encode_key(b"k", 9, ValueKind::Set);
        assert_eq!(cmp.compare(&new, &old), Ordering::Less);

        // Different user keys order by user key regardless of seq.
        let a = encode_key(b"a", 1, ValueKind::Set);
        let b = encode_key(b"b", 100, ValueKind::Set);
        assert_eq!(cmp.compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_kind_breaks_seq_ties() {
        let cmp = InternalKeyCmp(Arc::new(BytewiseComparator));
        let del = encode_key(b"k", 5, ValueKind::Delete);
        let set = encode_key(b"k", 5, ValueKind::Set);
        // Higher kind sorts first at equal seq.
        assert_eq!(cmp.compare(&set, &del), Ordering::Less);
    }

    #[test]
    fn test_batch_visibility() {
        assert!(is_visible(10, 20));
        assert!(!is_visible(30, 20));
        assert!(is_visible(SEQ_BATCH_BIT | 3, 0));
    }
}
