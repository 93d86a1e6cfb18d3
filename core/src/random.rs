//! The single randomness source for the pipeline.
//!
//! Every pass draws nondeterminism through [`RandomSource`] so that a fixed
//! seed reproduces a protection run byte for byte. Unseeded sources are
//! cryptographically seeded from OS entropy.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Uniform random generator, deterministic when seeded.
///
/// Cloning yields an independent generator with the same state, which is what
/// a forked context wants: the child replays the parent's stream without
/// advancing it.
#[derive(Debug, Clone)]
pub struct RandomSource {
    rng: StdRng,
    seed: Option<u64>,
}

impl RandomSource {
    /// Entropy-seeded source for regular runs.
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            seed: None,
        }
    }

    /// Deterministic source for reproducible builds.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            seed: Some(seed),
        }
    }

    /// Seeded when the configuration requested reproducibility.
    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::from_seed(seed),
            None => Self::from_entropy(),
        }
    }

    /// The configured seed, if any.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Uniform integer in the half-open range `[min, max)`.
    ///
    /// `min == max` returns `min`. `min > max` is a caller error.
    pub fn next_int(&mut self, min: i64, max: i64) -> i64 {
        assert!(min <= max, "next_int called with min {min} > max {max}");
        if min == max {
            return min;
        }
        self.rng.gen_range(min..max)
    }

    /// `n` uniform random bytes. A negative count is a caller error by
    /// construction (the count is unsigned).
    pub fn next_bytes(&mut self, n: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; n];
        self.rng.fill(bytes.as_mut_slice());
        bytes
    }

    /// Random string of length `n` over the alphanumeric alphabet.
    pub fn next_string(&mut self, n: usize) -> String {
        (0..n)
            .map(|_| ALPHANUMERIC[self.rng.gen_range(0..ALPHANUMERIC.len())] as char)
            .collect()
    }

    /// Uniform double in `[0, 1)`.
    pub fn next_double(&mut self) -> f64 {
        self.rng.r#gen::<f64>()
    }

    /// True with the given percent probability (0 never, 100 always).
    pub fn next_percent(&mut self, percent: u32) -> bool {
        self.next_int(0, 100) < i64::from(percent)
    }

    /// Uniform in-place permutation.
    pub fn shuffle<T>(&mut self, slice: &mut [T]) {
        slice.shuffle(&mut self.rng);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_equals_max_returns_min() {
        let mut rng = RandomSource::from_seed(1);
        assert_eq!(rng.next_int(7, 7), 7);
    }

    #[test]
    #[should_panic(expected = "min")]
    fn min_above_max_is_a_caller_error() {
        let mut rng = RandomSource::from_seed(1);
        rng.next_int(2, 1);
    }

    #[test]
    fn seeded_streams_are_reproducible() {
        let mut a = RandomSource::from_seed(99);
        let mut b = RandomSource::from_seed(99);
        assert_eq!(a.next_bytes(32), b.next_bytes(32));
        assert_eq!(a.next_string(16), b.next_string(16));
        assert_eq!(a.next_int(0, 1000), b.next_int(0, 1000));
    }

    #[test]
    fn clone_replays_the_stream() {
        let mut a = RandomSource::from_seed(5);
        let mut b = a.clone();
        assert_eq!(a.next_int(0, 1 << 30), b.next_int(0, 1 << 30));
    }

    #[test]
    fn values_stay_in_range() {
        let mut rng = RandomSource::from_seed(3);
        for _ in 0..1000 {
            let v = rng.next_int(10, 20);
            assert!((10..20).contains(&v));
            let d = rng.next_double();
            assert!((0.0..1.0).contains(&d));
        }
    }

    #[test]
    fn strings_are_alphanumeric() {
        let mut rng = RandomSource::from_seed(8);
        let s = rng.next_string(64);
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn percent_extremes() {
        let mut rng = RandomSource::from_seed(4);
        assert!(!rng.next_percent(0));
        assert!(rng.next_percent(100));
    }
}
