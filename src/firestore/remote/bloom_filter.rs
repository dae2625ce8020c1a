use md5::{Digest, Md5};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Probabilistic set of document names sent with an existence filter, used
/// to work out which cached documents the backend no longer matches.
///
/// Probe `i` for a value checks bit `(h1 + i * h2) mod bit_count`, where `h1`
/// and `h2` are the little-endian halves of the value's MD5 digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: u32, hash_count: u32) -> FirestoreResult<Self> {
        if padding >= 8 {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!(
                "Invalid padding when bitmap length is 0: {padding}"
            )));
        }
        let bit_count = bitmap.len() as u64 * 8 - u64::from(padding);
        Ok(Self {
            bitmap,
            hash_count,
            bit_count,
        })
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    /// `false` means the value is definitely absent.
    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (hash1, hash2) = md5_halves(value);
        (0..self.hash_count).all(|probe| self.is_bit_set(self.bit_index(hash1, hash2, probe)))
    }

    fn bit_index(&self, hash1: u64, hash2: u64, probe: u32) -> u64 {
        hash1
            .wrapping_add(hash2.wrapping_mul(u64::from(probe)))
            % self.bit_count
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }

    /// Sets the probe bits of `value`. Used by backends building filters.
    pub fn insert(&mut self, value: &str) {
        let (hash1, hash2) = md5_halves(value);
        for probe in 0..self.hash_count {
            let index = self.bit_index(hash1, hash2, probe);
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }
}

fn md5_halves(value: &str) -> (u64, u64) {
    let digest = Md5::digest(value.as_bytes());
    let mut low = [0u8; 8];
    let mut high = [0u8; 8];
    low.copy_from_slice(&digest[..8]);
    high.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(low), u64::from_le_bytes(high))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "projects/p/databases/(default)/documents/";

    #[test]
    fn rejects_invalid_shapes() {
        assert!(BloomFilter::new(vec![0xff], 8, 1).is_err());
        assert!(BloomFilter::new(vec![0xff], 0, 0).is_err());
        assert!(BloomFilter::new(Vec::new(), 1, 0).is_err());
        assert_eq!(BloomFilter::new(vec![0, 0], 3, 2).unwrap().bit_count(), 13);
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(Vec::new(), 0, 0).unwrap();
        assert!(!filter.might_contain(""));
        assert!(!filter.might_contain("a"));
    }

    #[test]
    fn inserted_names_are_members() {
        let mut filter = BloomFilter::new(vec![0; 128], 0, 7).unwrap();
        for id in ["a", "b", "c"] {
            filter.insert(&format!("{PREFIX}coll/{id}"));
        }
        for id in ["a", "b", "c"] {
            assert!(filter.might_contain(&format!("{PREFIX}coll/{id}")));
        }
        assert!(!filter.might_contain(&format!("{PREFIX}coll/d")));
    }

    #[test]
    fn padding_keeps_probes_inside_bit_count() {
        let mut filter = BloomFilter::new(vec![0; 2], 7, 3).unwrap();
        filter.insert("x");
        assert!(filter.might_contain("x"));
        assert_eq!(filter.bitmap[1] & 0b1111_1110, 0);
    }
}
