//! Random number generator used for mutation
//!
//! `RomuDuoJr` (<https://www.romu-random.org>) for the mutation stream. Its two state words
//! are drawn from a `Lehmer64` generator seeded either with a caller provided seed, for
//! reproducible fuzzing, or with `rdtsc`.

/// Multiplier of the `RomuDuoJr` x state
const ROMU_MULTIPLIER: u64 = 15_241_094_284_759_029_579;

/// Multiplier of the `Lehmer64` state
const LEHMER_MULTIPLIER: u128 = 0xda94_2042_e4dd_58b5;

/// Outputs discarded after seeding
const WARMUP_ROUNDS: usize = 92;

/// `RomuDuoJr` pseudo random number generator
#[derive(Debug, Clone)]
pub struct Rng {
    /// x state
    xstate: u64,

    /// y state
    ystate: u64,
}

impl Rng {
    /// Create an [`Rng`] whose state is derived from `rdtsc`
    #[must_use]
    pub fn from_rdtsc() -> Self {
        // SAFETY: `rdtsc` is available on every x86_64 processor
        let tsc = unsafe { core::arch::x86_64::_rdtsc() };
        Self::from_lehmer(Lehmer64::new(u128::from(tsc)))
    }

    /// Create an [`Rng`] producing the same stream for the same `seed`
    #[must_use]
    pub fn from_seed(seed: u64) -> Self {
        Self::from_lehmer(Lehmer64::new(u128::from(seed)))
    }

    /// Draw the state from `lehmer`
    fn from_lehmer(mut lehmer: Lehmer64) -> Self {
        let mut rng = Self {
            xstate: lehmer.next(),
            ystate: lehmer.next() | 1,
        };

        for _ in 0..WARMUP_ROUNDS {
            rng.next();
        }

        rng
    }

    /// Get the next random number
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u64 {
        let xp = self.xstate;
        self.xstate = ROMU_MULTIPLIER.wrapping_mul(self.ystate);
        self.ystate = self.ystate.wrapping_sub(xp).rotate_left(27);
        xp
    }

    /// Random number in `0..bound`. `bound` must not be zero.
    pub fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }
}

impl rand::RngCore for Rng {
    #[allow(clippy::cast_possible_truncation)]
    fn next_u32(&mut self) -> u32 {
        self.next() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.next()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        rand_core::impls::fill_bytes_via_next(self, dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// `Lehmer64` generator, only used to seed [`Rng`]
struct Lehmer64 {
    /// Internal state, always odd
    value: u128,
}

impl Lehmer64 {
    /// Spread `seed` over the 128-bit state. The state must never be zero.
    fn new(seed: u128) -> Self {
        let mut lehmer = Self {
            value: (seed << 64) | (!seed & u128::from(u64::MAX)) | 1,
        };

        for _ in 0..123 {
            lehmer.next();
        }

        lehmer
    }

    /// Get the next random number
    #[allow(clippy::cast_possible_truncation)]
    fn next(&mut self) -> u64 {
        self.value = self.value.wrapping_mul(LEHMER_MULTIPLIER);
        (self.value >> 64) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng as _;

    #[test]
    fn seeded_streams_repeat() {
        let mut first = Rng::from_seed(0x1337);
        let mut second = Rng::from_seed(0x1337);
        let mut other = Rng::from_seed(0x1338);

        let a: Vec<u64> = (0..32).map(|_| first.next()).collect();
        let b: Vec<u64> = (0..32).map(|_| second.next()).collect();
        let c: Vec<u64> = (0..32).map(|_| other.next()).collect();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn zero_seed_is_usable() {
        let mut rng = Rng::from_seed(0);
        assert!((0..16).map(|_| rng.next()).any(|val| val != 0));

        for _ in 0..100 {
            assert!(rng.below(7) < 7);
            assert!(rng.gen_range(3..5) >= 3);
        }
    }
}
