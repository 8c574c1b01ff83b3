// File: metric.rs
//
// The purpose of this file is to define the ring's identifier space:
// hashing keys onto it and measuring clockwise distance around it.

use md5::{Digest, Md5};

/// Default number of entries in a finger table.
pub const FINGER_TABLE_SIZE: usize = 128;

/// A ring metric: keys hash into `[0, 2^B)` and distance is measured
/// clockwise. Clockwise distance is asymmetric, which lets successor
/// and finger computations stay monotonic across the wrap-around.
pub trait Metric: Send + Sync {
    /// Number of bits in the identifier space.
    fn hash_bits(&self) -> u32;

    /// Hashes a key onto the ring.
    ///
    /// # Arguments
    ///
    /// * `key` - the key to be placed
    fn hash_key(&self, key: &str) -> u128;

    /// Bitmask covering the identifier space.
    fn space_mask(&self) -> u128 {
        if self.hash_bits() >= 128 {
            u128::MAX
        } else {
            (1u128 << self.hash_bits()) - 1
        }
    }

    /// Clockwise distance from `a` to `b`: `(b - a) mod 2^B`.
    ///
    /// # Arguments
    ///
    /// * `a` - the identifier the measurement starts from
    /// * `b` - the identifier the measurement runs to
    fn distance(&self, a: u128, b: u128) -> u128 {
        b.wrapping_sub(a) & self.space_mask()
    }
}

/// MD5-based ring metric.
///
/// Keys are placed by the integer value of their full MD5 digest,
/// reduced to the identifier space. Both the digest and the default
/// space are 128-bit, so the sizes line up.
pub struct Md5Metric {
    hash_bits: u32,
}

impl Md5Metric {
    /// Returns a new MD5-based ring metric
    ///
    /// # Arguments
    ///
    /// * `hash_bits` - the number of bits in the ring size
    pub fn new(hash_bits: u32) -> Md5Metric {
        Md5Metric { hash_bits }
    }
}

impl Default for Md5Metric {
    fn default() -> Md5Metric {
        Md5Metric::new(128)
    }
}

impl Metric for Md5Metric {
    fn hash_bits(&self) -> u32 {
        self.hash_bits
    }

    fn hash_key(&self, key: &str) -> u128 {
        let mut hasher = Md5::new();
        hasher.input(key.as_bytes());
        let digest = hasher.result();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest);
        u128::from_be_bytes(bytes) & self.space_mask()
    }
}

/// Trivial ring metric used for testing.
///
/// Hashes are the integer values of the key strings reduced to the
/// identifier space, so all keys must be integer strings.
pub struct TrivialMetric {
    hash_bits: u32,
}

impl TrivialMetric {
    /// Returns a new trivial ring metric
    ///
    /// # Arguments
    ///
    /// * `hash_bits` - the number of bits in the ring size
    pub fn new(hash_bits: u32) -> TrivialMetric {
        TrivialMetric { hash_bits }
    }
}

impl Metric for TrivialMetric {
    fn hash_bits(&self) -> u32 {
        self.hash_bits
    }

    fn hash_key(&self, key: &str) -> u128 {
        let value: u128 = key
            .parse()
            .unwrap_or_else(|_| panic!("trivial metric requires integer keys, got {:?}", key));
        value & self.space_mask()
    }
}

/// Computes the finger offsets for a table of `nfingers` entries over a
/// `hash_bits`-bit space: `2^(hash_bits * i / nfingers)` for each i,
/// sorted ascending. The first offset is always 1, so finger 0 resolves
/// to the immediate successor.
///
/// # Arguments
///
/// * `hash_bits` - the number of bits in the ring size
/// * `nfingers` - the number of entries in the finger table
pub fn finger_steps(hash_bits: u32, nfingers: usize) -> Vec<u128> {
    let nfingers = nfingers.min(hash_bits as usize).max(1);
    let mut steps: Vec<u128> = (0..nfingers)
        .map(|i| 1u128 << (hash_bits as usize * i / nfingers))
        .collect();
    steps.sort_unstable();
    steps
}
