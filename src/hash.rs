//! Salted 64-bit hashing of fixed-width salts.

use core::fmt::{Debug, Formatter};

use rand::{rngs::OsRng, TryRngCore};

use crate::error::Error;

/// The fixed input width of the hasher, matching the widest salt any
/// supported cipher emits. Narrower salts are zero-padded by the caller.
pub const IV_LEN: usize = 32;

/// The exact length of a serialized hash table.
const TABLE_BYTES: usize = IV_LEN * 256 * 8;

/// A salted 64-bit hash over [`IV_LEN`]-byte inputs, implemented as a
/// classic tabulation hash:
/// <https://en.wikipedia.org/wiki/Tabulation_hashing>
///
/// The table is filled from system entropy once at construction and never
/// mutated afterwards, so a hasher is freely shared across threads.
/// Collisions between distinct inputs occur with probability 2⁻⁶⁴ per
/// pair, independent of the attacker's choice of inputs.
pub struct TabulationHasher(Box<[[u64; 256]; IV_LEN]>);

impl TabulationHasher {
    /// Creates a hasher with a fresh random table.
    ///
    /// # Panics
    ///
    /// Panics if the system entropy source fails; no usable hasher can
    /// exist without it.
    pub fn new() -> Self {
        let mut bytes = vec![0u8; TABLE_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .expect("system random source failure");
        Self::from_bytes(&bytes).expect("table length is exact")
    }

    /// Reconstructs a hasher from a table serialized by [`to_bytes`].
    ///
    /// A file-backed replay cache is only meaningful when reopened with
    /// the exact hash function that populated it, so the table must be
    /// persisted alongside the cache files.
    ///
    /// [`to_bytes`]: TabulationHasher::to_bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != TABLE_BYTES {
            return Err(Error::InvalidTableLength {
                expected: TABLE_BYTES,
                received: bytes.len(),
            });
        }
        let mut table = Box::new([[0u64; 256]; IV_LEN]);
        for (cell, chunk) in table
            .iter_mut()
            .flatten()
            .zip(bytes.chunks_exact(8))
        {
            *cell = u64::from_be_bytes(chunk.try_into().expect("chunks are 8 bytes"));
        }
        Ok(Self(table))
    }

    /// Serializes the table to a big-endian byte vector of exactly
    /// 32 × 256 × 8 = 65,536 bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(TABLE_BYTES);
        for cell in self.0.iter().flatten() {
            bytes.extend_from_slice(&cell.to_be_bytes());
        }
        bytes
    }

    /// Hashes `vec` to a 64-bit value.
    pub fn hash(&self, vec: &[u8; IV_LEN]) -> u64 {
        let mut hash = 0u64;
        for (row, &byte) in self.0.iter().zip(vec.iter()) {
            hash ^= row[byte as usize];
        }
        hash
    }
}

impl Default for TabulationHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for TabulationHasher {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TabulationHasher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn make_vecs(n: usize, seed: u8) -> Vec<[u8; IV_LEN]> {
        let mut rng = StdRng::from_seed([seed; 32]);
        (0..n).map(|_| rng.random()).collect()
    }

    #[test]
    fn test_no_two_sample_collision() {
        let hasher = TabulationHasher::new();
        let vecs = make_vecs(2, 1);
        // A collision between two independent random inputs is a 2^-64
        // event; observing one means the hasher is broken.
        assert_ne!(hasher.hash(&vecs[0]), hasher.hash(&vecs[1]));
    }

    #[test]
    fn test_deterministic() {
        let hasher = TabulationHasher::new();
        let vec = [0x5au8; IV_LEN];
        assert_eq!(hasher.hash(&vec), hasher.hash(&vec));
    }

    #[test]
    fn test_serialize_round_trip() {
        let hasher = TabulationHasher::new();
        let restored = TabulationHasher::from_bytes(&hasher.to_bytes()).unwrap();
        for vec in make_vecs(64, 2) {
            assert_eq!(hasher.hash(&vec), restored.hash(&vec));
        }
    }

    #[test]
    fn test_bad_table_length_rejected() {
        assert!(matches!(
            TabulationHasher::from_bytes(&[0u8; 16]),
            Err(Error::InvalidTableLength { received: 16, .. })
        ));
    }

    #[test]
    fn test_independent_hashers_disagree() {
        let a = TabulationHasher::new();
        let b = TabulationHasher::new();
        let vec = [0u8; IV_LEN];
        // Equal outputs from independently salted tables would mean the
        // tables themselves collided.
        assert_ne!(a.hash(&vec), b.hash(&vec));
    }
}
