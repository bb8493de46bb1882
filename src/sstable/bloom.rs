//! Bloom filter over user keys, one per table.
//!
//! Probes use double hashing over the two halves of a 128-bit xxh3 hash:
//! `h_i = h1 + i * h2 (mod num_bits)`. The filter answers "definitely
//! absent" or "probably present"; `seek_prefix_ge` uses it to skip tables
//! that cannot contain the sought prefix.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use xxhash_rust::xxh3::xxh3_128;

use crate::error::{Error, Result};

pub struct BloomFilter {
    bits: Vec<u64>,
    num_hashes: u32,
    num_bits: u32,
}

impl BloomFilter {
    /// Sizes the filter for `expected_keys` at `bits_per_key`.
    pub fn new(expected_keys: usize, bits_per_key: usize) -> Self {
        let num_bits = (expected_keys.max(1) * bits_per_key).max(64) as u32;
        // k = bits_per_key * ln 2, clamped to a sane probe count.
        let num_hashes = ((bits_per_key as f64 * 0.69) as u32).clamp(1, 30);
        let words = (num_bits as usize).div_ceil(64);
        Self {
            bits: vec![0u64; words],
            num_hashes,
            num_bits,
        }
    }

    /// Builds a filter from pre-computed key hashes (see [`key_hash`]);
    /// the table builder accumulates hashes so keys need not be retained.
    pub fn from_hashes(hashes: &[(u64, u64)], bits_per_key: usize) -> Self {
        let mut filter = Self::new(hashes.len(), bits_per_key);
        for &(h1, h2) in hashes {
            filter.insert_hash(h1, h2);
        }
        filter
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        self.insert_hash(h1, h2);
    }

    fn insert_hash(&mut self, h1: u64, h2: u64) {
        for i in 0..self.num_hashes {
            let pos = probe(h1, h2, i, self.num_bits);
            self.bits[(pos / 64) as usize] |= 1 << (pos % 64);
        }
    }

    /// False means the key is definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let pos = probe(h1, h2, i, self.num_bits);
            if self.bits[(pos / 64) as usize] >> (pos % 64) & 1 == 0 {
                return false;
            }
        }
        true
    }

    /// Encoding: `[num_hashes u32][num_bits u32][word_count u32][words u64 × n]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.bits.len() * 8);
        buf.write_u32::<BigEndian>(self.num_hashes).unwrap();
        buf.write_u32::<BigEndian>(self.num_bits).unwrap();
        buf.write_u32::<BigEndian>(self.bits.len() as u32).unwrap();
        for word in &self.bits {
            buf.write_u64::<BigEndian>(*word).unwrap();
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return Err(Error::Corruption("bloom filter too short".to_string()));
        }
        let num_hashes = BigEndian::read_u32(&data[0..4]);
        let num_bits = BigEndian::read_u32(&data[4..8]);
        let words = BigEndian::read_u32(&data[8..12]) as usize;
        if words != (num_bits as usize).div_ceil(64) {
            return Err(Error::Corruption(
                "bloom filter word count mismatch".to_string(),
            ));
        }
        if data.len() != 12 + words * 8 {
            return Err(Error::Corruption("bloom filter length mismatch".to_string()));
        }
        let mut bits = Vec::with_capacity(words);
        for i in 0..words {
            bits.push(BigEndian::read_u64(&data[12 + i * 8..]));
        }
        Ok(Self {
            bits,
            num_hashes,
            num_bits,
        })
    }
}

/// The (h1, h2) pair fed to the double-hashing probe sequence.
pub fn key_hash(key: &[u8]) -> (u64, u64) {
    hash_pair(key)
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    let hash = xxh3_128(key);
    (hash as u64, (hash >> 64) as u64)
}

fn probe(h1: u64, h2: u64, i: u32, num_bits: u32) -> u32 {
    (h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership() {
        let mut filter = BloomFilter::new(100, 10);
        for i in 0..100 {
            filter.insert(format!("key_{i}").as_bytes());
        }
        for i in 0..100 {
            assert!(filter.may_contain(format!("key_{i}").as_bytes()));
        }
    }

    #[test]
    fn test_false_positive_rate_is_sane() {
        let mut filter = BloomFilter::new(1000, 10);
        for i in 0..1000 {
            filter.insert(format!("present_{i}").as_bytes());
        }
        let false_positives = (0..1000)
            .filter(|i| filter.may_contain(format!("absent_{i}").as_bytes()))
            .count();
        // 10 bits/key targets ~1%; allow generous slack.
        assert!(
            false_positives < 50,
            "false positive rate too high: {false_positives}/1000"
        );
    }

    #[test]
    fn test_encode_decode() {
        let mut filter = BloomFilter::new(50, 10);
        filter.insert(b"alpha");
        filter.insert(b"beta");

        let decoded = BloomFilter::decode(&filter.encode()).expect("Failed to decode");
        assert!(decoded.may_contain(b"alpha"));
        assert!(decoded.may_contain(b"beta"));
        assert!(!decoded.may_contain(b"gamma"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(BloomFilter::decode(b"short").is_err());
        let mut buf = BloomFilter::new(10, 10).encode();
        buf.truncate(buf.len() - 3);
        assert!(BloomFilter::decode(&buf).is_err());
    }
}
