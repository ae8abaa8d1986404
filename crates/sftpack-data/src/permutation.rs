//! EpochPermutation: deterministic per-epoch ordering of example indices.
//!
//! The ordering is a pure function of `(seed, epoch, N)`. Workers started
//! independently derive the same permutation, which is what lets them agree
//! on a global packing plan without talking to each other.
//!
//! # Derivation (`PackingVersion::V1`)
//! 1. Key = `seed.wrapping_add(epoch)`
//! 2. Generator = `ChaCha8Rng::seed_from_u64(key)`
//! 3. Order = Fisher–Yates shuffle of `0..N` driven by that generator
//!
//! `N` does not take part in seeding. ChaCha8 is used instead of `StdRng`
//! because its output stream is fixed across `rand` releases.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sftpack_core::PackingVersion;

/// Generator key for `(seed, epoch)`.
#[inline]
pub fn epoch_key(seed: u64, epoch: u64) -> u64 {
    seed.wrapping_add(epoch)
}

/// Seeded generator for `(seed, epoch)`.
pub fn epoch_rng(seed: u64, epoch: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(epoch_key(seed, epoch))
}

/// Permutation of `0..n` for `(seed, epoch)` under the v1 derivation.
pub fn epoch_permutation(seed: u64, epoch: u64, n: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = epoch_rng(seed, epoch);
    indices.shuffle(&mut rng);
    indices
}

/// Seeded permutation source bound to an algorithm version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochPermutation {
    pub seed: u64,
    pub version: PackingVersion,
}

impl EpochPermutation {
    pub fn new(seed: u64, version: PackingVersion) -> Self {
        Self { seed, version }
    }

    /// Ordering of all `n` example indices for `epoch`.
    pub fn permutation(&self, epoch: u64, n: usize) -> Vec<usize> {
        match self.version {
            PackingVersion::V1 => epoch_permutation(self.seed, epoch, n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_bijection(perm: &[usize], n: usize) -> bool {
        let mut seen = vec![false; n];
        for &i in perm {
            if i >= n || seen[i] {
                return false;
            }
            seen[i] = true;
        }
        perm.len() == n
    }

    #[test]
    fn test_permutation_is_bijection() {
        for n in [0, 1, 2, 17, 1000] {
            let perm = epoch_permutation(42, 3, n);
            assert!(is_bijection(&perm, n), "n={}", n);
        }
    }

    #[test]
    fn test_permutation_stable() {
        let a = epoch_permutation(877645, 2, 500);
        let b = epoch_permutation(877645, 2, 500);
        assert_eq!(a, b);
    }

    #[test]
    fn test_permutation_varies_per_epoch() {
        let e0 = epoch_permutation(877645, 0, 500);
        let e1 = epoch_permutation(877645, 1, 500);
        let e2 = epoch_permutation(877645, 2, 500);
        assert_ne!(e0, e1);
        assert_ne!(e1, e2);
        assert_ne!(e0, e2);
    }

    #[test]
    fn test_permutation_varies_per_seed() {
        assert_ne!(epoch_permutation(1, 0, 500), epoch_permutation(2, 0, 500));
    }

    #[test]
    fn test_key_is_seed_plus_epoch() {
        // (seed=10, epoch=2) and (seed=11, epoch=1) share a key, so they share an order.
        assert_eq!(epoch_key(10, 2), 12);
        assert_eq!(epoch_permutation(10, 2, 64), epoch_permutation(11, 1, 64));
        assert_eq!(epoch_key(u64::MAX, 1), 0);
    }

    #[test]
    fn test_permutation_actually_shuffles() {
        let identity: Vec<usize> = (0..256).collect();
        assert_ne!(epoch_permutation(0, 0, 256), identity);
    }

    #[test]
    fn test_v1_golden_vectors() {
        // Fixed outputs of ChaCha8 + rand 0.8 Fisher-Yates. Upgrading either
        // crate must keep these, or the upgrade needs a new PackingVersion.
        assert_eq!(
            epoch_permutation(877645, 0, 16),
            vec![9, 12, 7, 15, 5, 0, 8, 2, 14, 13, 6, 3, 11, 10, 4, 1]
        );
        assert_eq!(
            epoch_permutation(877645, 1, 16),
            vec![14, 10, 15, 7, 13, 2, 0, 3, 8, 1, 11, 6, 9, 12, 4, 5]
        );
        assert_eq!(epoch_permutation(0, 0, 8), vec![1, 4, 0, 2, 6, 3, 7, 5]);
        assert_eq!(epoch_permutation(877645, 0, 1), vec![0]);
    }

    #[test]
    fn test_versioned_source_matches_v1() {
        let source = EpochPermutation::new(9, PackingVersion::V1);
        assert_eq!(source.permutation(4, 100), epoch_permutation(9, 4, 100));
    }
}
