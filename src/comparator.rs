//! User-key comparison and value merging seams.
//!
//! The engine never interprets user keys or values itself. Key ordering is
//! delegated to a [`Comparator`] and `Merge` records are folded through a
//! [`MergeOperator`], both supplied via
//! [`Options`](crate::config::Options).

use std::cmp::Ordering;

/// Total order over user keys.
///
/// Implementations must be consistent: the same comparator that wrote a
/// database must be used to open it. The name is persisted in the manifest
/// and checked on open.
pub trait Comparator: Send + Sync {
    /// Stable identifier persisted with the database.
    fn name(&self) -> &str;

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Splits a key into (prefix, suffix) for prefix seeks and range-key
    /// masking. The default treats the whole key as the prefix with an
    /// empty suffix, which disables suffix masking.
    fn split_suffix<'a>(&self, key: &'a [u8]) -> (&'a [u8], &'a [u8]) {
        (key, &[])
    }
}

/// Lexicographic byte ordering, the default comparator.
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &str {
        "basalt.bytewise"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Folds `Merge` operands into a single value.
///
/// Operands are presented oldest to newest, with the base value (the most
/// recent `Set`, if any record below the merges exists) first. Returning
/// `None` signals a merge failure, surfaced as a corruption error.
pub trait MergeOperator: Send + Sync {
    fn name(&self) -> &str;

    fn merge(&self, key: &[u8], base: Option<&[u8]>, operands: &[Vec<u8>]) -> Option<Vec<u8>>;
}

/// A merge operator that concatenates operands onto the base value.
/// Primarily useful in tests and as a reference implementation.
pub struct ConcatMergeOperator;

impl MergeOperator for ConcatMergeOperator {
    fn name(&self) -> &str {
        "basalt.concat"
    }

    fn merge(&self, _key: &[u8], base: Option<&[u8]>, operands: &[Vec<u8>]) -> Option<Vec<u8>> {
        let mut out = base.map(|b| b.to_vec()).unwrap_or_default();
        for op in operands {
            out.extend_from_slice(op);
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytewise_ordering() {
        let cmp = BytewiseComparator;
        assert_eq!(cmp.compare(b"a", b"b"), Ordering::Less);
        assert_eq!(cmp.compare(b"b", b"a"), Ordering::Greater);
        assert_eq!(cmp.compare(b"ab", b"ab"), Ordering::Equal);
        assert_eq!(cmp.compare(b"a", b"ab"), Ordering::Less);
    }

    #[test]
    fn test_concat_merge() {
        let merger = ConcatMergeOperator;
        let merged = merger
            .merge(b"k", Some(b"base"), &[b"+1".to_vec(), b"+2".to_vec()])
            .expect("Merge failed");
        assert_eq!(merged, b"base+1+2");

        let no_base = merger
            .merge(b"k", None, &[b"x".to_vec()])
            .expect("Merge failed");
        assert_eq!(no_base, b"x");
    }
}
