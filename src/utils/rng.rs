//! Deterministic random source for weight initialization.
//!
//! A seeded xorshift generator keeps weight initialization reproducible across
//! runs and across backends.

/// Xorshift PRNG.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    /// Create a new RNG with explicit seed (if zero, use a fixed value).
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { 0x9e3779b97f4a7c15 } else { seed };
        Self { state }
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 32) as u32
    }

    /// Uniform sample in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }

    /// Uniform sample in [low, high).
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32()
    }

    /// Fan-in scaled initial weight, uniform in [-sqrt(3/fan_in), sqrt(3/fan_in)).
    pub fn generate_weight(&mut self, fan_in: usize) -> f32 {
        let range = (12.0f32 / fan_in.max(1) as f32).sqrt();
        range * (self.next_f32() - 0.5)
    }

    /// Fills `data` with uniform samples in [low, high).
    pub fn fill_uniform(&mut self, data: &mut [f32], low: f32, high: f32) {
        for value in data.iter_mut() {
            *value = self.gen_range_f32(low, high);
        }
    }
}
