//! Deterministic Random Number Generator
//!
//! Xorshift128+ seeded through SplitMix64. The generator state lives in the
//! frame globals, so it is copied on rollback and folded into every checksum.

use serde::{Serialize, Deserialize};

use super::fixed::{Fixed, FIXED_ONE};
use super::stream::{BitStream, Serializable, StreamError};

/// Deterministic PRNG using Xorshift128+ algorithm.
///
/// # Determinism Guarantee
///
/// Given the same seed, this RNG will produce the exact same sequence
/// of random numbers on any platform (x86, ARM, WASM, GPU).
///
/// # Example
///
/// ```
/// use lockstep::core::rng::DeterministicRng;
///
/// let mut rng = DeterministicRng::new(42);
/// let value = rng.next_u64();
/// assert_eq!(value, 16629283624882167704); // Always the same!
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// Uses SplitMix64 to initialize the internal state, ensuring
    /// good distribution even from weak seeds.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Ensure state is never all zeros
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a random u32.
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    /// Integer in `[0, max)`, or 0 when `max` is 0.
    ///
    /// Plain modulo. The bias is below 2^-32 for any `u32` bound.
    #[inline]
    pub fn next_int(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        (self.next_u64() % max as u64) as u32
    }

    /// Integer in `[min, max]`.
    #[inline]
    pub fn next_int_range(&mut self, min: i32, max: i32) -> i32 {
        if min >= max {
            return min;
        }
        let range = (max - min + 1) as u32;
        min + self.next_int(range) as i32
    }

    /// Fixed in `[0, max)`.
    #[inline]
    pub fn next_fixed(&mut self, max: Fixed) -> Fixed {
        if max <= 0 {
            return 0;
        }
        // High word times max, over 2^32.
        let raw = (self.next_u64() >> 32) as i64;
        ((raw * max as i64) >> 32) as Fixed
    }

    /// Generate a random Fixed in range [min, max).
    #[inline]
    pub fn next_fixed_range(&mut self, min: Fixed, max: Fixed) -> Fixed {
        if min >= max {
            return min;
        }
        let range = max.wrapping_sub(min);
        min.wrapping_add(self.next_fixed(range))
    }

    /// True with `probability`, where `FIXED_ONE` is certain.
    #[inline]
    pub fn next_bool(&mut self, probability: Fixed) -> bool {
        self.next_fixed(FIXED_ONE) < probability
    }

    /// Derive an independent generator, advancing this one by one step.
    ///
    /// Systems that need a private stream (per entity, per slice of an array
    /// task) fork on the main thread so the parent sequence stays in step
    /// across peers.
    pub fn fork(&mut self) -> Self {
        Self::new(self.next_u64())
    }
}

impl Serializable for DeterministicRng {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        stream.serialize_u64(&mut self.state[0])?;
        stream.serialize_u64(&mut self.state[1])?;
        if stream.is_reading() && self.state == [0, 0] {
            return Err(StreamError::Invalid("all-zero rng state".into()));
        }
        Ok(())
    }
}

/// SplitMix64 for seed initialization.
/// Produces well-distributed values from sequential seeds.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixed::to_fixed;

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = DeterministicRng::new(77);
        let mut b = DeterministicRng::new(77);
        let left: Vec<u64> = (0..500).map(|_| a.next_u64()).collect();
        let right: Vec<u64> = (0..500).map(|_| b.next_u64()).collect();
        assert_eq!(left, right);
        assert_ne!(DeterministicRng::new(78).next_u64(), left[0]);
    }

    #[test]
    fn test_rng_known_values() {
        // Verify specific output for regression testing
        let mut rng = DeterministicRng::new(42);
        let val1 = rng.next_u64();
        let val2 = rng.next_u64();
        let val3 = rng.next_u64();

        // These values must never change!
        // If they do, recorded replays and checksum files will break.
        assert_eq!(val1, 16629283624882167704);
        assert_eq!(val2, 1420492921613871959);
        assert_eq!(val3, 9768315062676884790);
    }

    #[test]
    fn test_bounded_draws() {
        let mut rng = DeterministicRng::new(1234);
        let max = to_fixed(2.5);
        for _ in 0..1000 {
            assert!(rng.next_int(7) < 7);
            assert!((-3..=3).contains(&rng.next_int_range(-3, 3)));
            assert!((0..max).contains(&rng.next_fixed(max)));
        }
        assert_eq!(rng.next_int(0), 0);
        assert_eq!(rng.next_int_range(5, 5), 5);
        assert!(!rng.next_bool(0));
        assert!(rng.next_bool(FIXED_ONE + 1));
    }

    #[test]
    fn test_stream_round_trip() {
        let mut rng = DeterministicRng::new(31337);
        rng.next_u64();

        let mut writer = BitStream::writer();
        Serializable::serialize(&mut rng, &mut writer).unwrap();

        let mut restored = DeterministicRng::default();
        let mut reader = BitStream::reader(writer.into_bytes());
        Serializable::serialize(&mut restored, &mut reader).unwrap();

        assert_eq!(restored, rng);
        assert_eq!(restored.next_u64(), rng.next_u64());
    }

    #[test]
    fn test_zero_state_rejected() {
        let mut reader = BitStream::reader(vec![0; 16]);
        let mut rng = DeterministicRng::default();
        assert!(Serializable::serialize(&mut rng, &mut reader).is_err());
    }

    #[test]
    fn test_fork_is_deterministic() {
        let mut a = DeterministicRng::new(8);
        let mut b = DeterministicRng::new(8);
        let mut fa = a.fork();
        let mut fb = b.fork();
        assert_eq!(fa.next_u64(), fb.next_u64());
        assert_eq!(a.next_u64(), b.next_u64());
    }
}
