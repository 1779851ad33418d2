// Minimal PRNG (no external crates).
//
// This is NOT cryptographically secure.
// It is used for mutation noise, dataset shuffling, edge growth sampling,
// and reproducible evaluation.

/// Mix a base seed with a (generation, individual) pair into an independent
/// stream seed. splitmix64 finalizer over a keyed state; distinct slots get
/// distinct, uncorrelated streams.
pub fn mix_seed(seed: u64, generation: u64, individual: u64) -> u64 {
    let mut z = seed
        ^ generation.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ individual.wrapping_mul(0xD1B5_4A32_D192_ED03);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // Avoid a zero state.
        let seed = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
        Self { state: seed }
    }

    /// Independent stream for one (generation, individual) slot.
    pub fn for_slot(seed: u64, generation: u64, individual: u64) -> Self {
        Self::new(mix_seed(seed, generation, individual))
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        // Marsaglia / Vigna family. Simple, fast, decent for simulation noise.
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    #[inline]
    pub fn next_f32_01(&mut self) -> f32 {
        // Convert to [0,1).
        let x = self.next_u32();
        (x as f32) / (u32::MAX as f32 + 1.0)
    }

    #[inline]
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32_01()
    }

    #[inline]
    pub fn gen_range_usize(&mut self, low: usize, high: usize) -> usize {
        if high <= low {
            return low;
        }
        let span = (high - low) as u32;
        let v = self.next_u32() % span;
        low + v as usize
    }

    /// Gaussian sample with mean 0 and the given standard deviation.
    /// Box-Muller on two uniforms; `std <= 0` draws nothing and returns 0.
    pub fn gen_gaussian_f32(&mut self, std: f32) -> f32 {
        if std <= 0.0 {
            return 0.0;
        }
        let u1 = self.next_f32_01().max(1e-7);
        let u2 = self.next_f32_01();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * core::f32::consts::PI * u2;
        std * r * theta.cos()
    }

    /// In-place Fisher-Yates shuffle.
    pub fn shuffle<T>(&mut self, xs: &mut [T]) {
        for i in (1..xs.len()).rev() {
            let j = self.gen_range_usize(0, i + 1);
            xs.swap(i, j);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = Prng::new(42);
        let mut b = Prng::new(42);
        for _ in 0..32 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn slot_streams_are_distinct() {
        let mut a = Prng::for_slot(7, 0, 0);
        let mut b = Prng::for_slot(7, 0, 1);
        let mut c = Prng::for_slot(7, 1, 0);
        let (x, y, z) = (a.next_u64(), b.next_u64(), c.next_u64());
        assert_ne!(x, y);
        assert_ne!(x, z);
        assert_ne!(y, z);
    }

    #[test]
    fn gaussian_zero_std_is_silent() {
        let mut rng = Prng::new(9);
        let mut before = rng.clone();
        assert_eq!(rng.gen_gaussian_f32(0.0), 0.0);
        // The stream must not advance when a class is disabled.
        assert_eq!(rng.next_u64(), before.next_u64());
    }

    #[test]
    fn range_bounds_hold() {
        let mut rng = Prng::new(3);
        for _ in 0..1000 {
            let v = rng.gen_range_f32(-0.5, 0.5);
            assert!((-0.5..0.5).contains(&v));
            let u = rng.gen_range_usize(2, 9);
            assert!((2..9).contains(&u));
        }
    }
}
