//! sram.rs — SRAM power-up state model
//!
//! An SRAM cell settles to a device-characteristic value at power-up, with
//! a small population of cells that flip between cycles. The model is a
//! seeded base pattern (stable per device identity) plus per-cycle
//! Bernoulli bit noise, which is exactly the structure PUF studies measure.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// Draws power-up images for one device.
pub struct PowerUpModel {
    seed: u64,
    size: usize,
    flip_prob: f64,
    cycles: u64,
}

impl PowerUpModel {
    /// `flip_prob` is the per-bit flip probability between cycles,
    /// clamped to `[0, 1]`. Zero gives a fully stable device.
    pub fn new(seed: u64, size: usize, flip_prob: f64) -> Self {
        Self {
            seed,
            size,
            flip_prob: flip_prob.clamp(0.0, 1.0),
            cycles: 0,
        }
    }

    /// The device-characteristic pattern with no cycle noise applied.
    pub fn base_pattern(&self) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut image = vec![0u8; self.size];
        rng.fill_bytes(&mut image);
        image
    }

    /// One power cycle: the base pattern with fresh bit noise.
    pub fn sample(&mut self) -> Vec<u8> {
        let mut image = self.base_pattern();
        self.cycles += 1;
        if self.flip_prob > 0.0 {
            // Noise stream keyed by (device seed, cycle counter) so reruns
            // of a simulation are reproducible.
            let mut noise = StdRng::seed_from_u64(self.seed ^ self.cycles.wrapping_mul(0x9E37_79B9_7F4A_7C15));
            for byte in image.iter_mut() {
                for bit in 0..8 {
                    if noise.gen_bool(self.flip_prob) {
                        *byte ^= 1 << bit;
                    }
                }
            }
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_device_repeats_exactly() {
        let mut model = PowerUpModel::new(42, 1024, 0.0);
        let a = model.sample();
        let b = model.sample();
        assert_eq!(a, b);
        assert_eq!(a, model.base_pattern());
    }

    #[test]
    fn different_seeds_differ() {
        let a = PowerUpModel::new(1, 1024, 0.0).base_pattern();
        let b = PowerUpModel::new(2, 1024, 0.0).base_pattern();
        assert_ne!(a, b);
    }

    #[test]
    fn noisy_device_flips_some_bits() {
        let mut model = PowerUpModel::new(7, 4096, 0.05);
        let base = model.base_pattern();
        let sampled = model.sample();
        let flipped: u32 = base
            .iter()
            .zip(&sampled)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        // 4096 * 8 bits at p = 0.05 — expect on the order of 1600 flips.
        assert!(flipped > 0, "no bits flipped at p=0.05");
        assert!((flipped as usize) < 4096 * 8 / 4, "far too many flips");
    }
}
