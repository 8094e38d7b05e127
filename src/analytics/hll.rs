//! HyperLogLog sketch for counting unique page sessions per variant.
//!
//! Precision p=14: 16,384 registers, ~0.8% error. Small cardinalities fall
//! back to linear counting, which is close to exact for a handful of sessions.

use sha2::{Digest, Sha256};

const PRECISION: u32 = 14;
const NUM_REGISTERS: usize = 1 << PRECISION;

/// Bias correction for m=16384.
const ALPHA: f64 = 0.7213 / (1.0 + 1.079 / 16384.0);

#[derive(Clone)]
pub struct HllSketch {
    registers: Vec<u8>,
}

impl HllSketch {
    pub fn new() -> Self {
        Self {
            registers: vec![0u8; NUM_REGISTERS],
        }
    }

    /// Record one session identifier. Repeats do not change the estimate.
    pub fn insert(&mut self, session: &str) {
        let hash = session_hash(session);
        let index = (hash >> (64 - PRECISION)) as usize;
        let remaining = (hash << PRECISION) | (1 << (PRECISION - 1));
        let rho = remaining.leading_zeros() as u8 + 1;
        if rho > self.registers[index] {
            self.registers[index] = rho;
        }
    }

    /// Estimated number of distinct sessions.
    pub fn estimate(&self) -> u64 {
        let m = NUM_REGISTERS as f64;
        let sum: f64 = self
            .registers
            .iter()
            .map(|&r| 2.0_f64.powi(-(r as i32)))
            .sum();
        let raw = ALPHA * m * m / sum;

        if raw <= 2.5 * m {
            let zeros = self.registers.iter().filter(|&&r| r == 0).count() as f64;
            if zeros > 0.0 {
                return (m * (m / zeros).ln()).round() as u64;
            }
        }
        raw.round() as u64
    }
}

impl Default for HllSketch {
    fn default() -> Self {
        Self::new()
    }
}

fn session_hash(session: &str) -> u64 {
    let digest = Sha256::digest(session.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sketch_of(prefix: &str, range: std::ops::Range<u32>) -> HllSketch {
        let mut sketch = HllSketch::new();
        for i in range {
            sketch.insert(&format!("{}_{}", prefix, i));
        }
        sketch
    }

    #[test]
    fn empty_sketch_estimates_zero() {
        let sketch = HllSketch::new();
        assert_eq!(sketch.estimate(), 0);
    }

    #[test]
    fn small_counts_are_exact() {
        let mut sketch = HllSketch::new();
        sketch.insert("session-a");
        sketch.insert("session-b");
        sketch.insert("session-a");
        sketch.insert("session-c");
        assert_eq!(sketch.estimate(), 3);
    }

    #[test]
    fn estimate_within_three_percent_at_10k() {
        let estimate = sketch_of("session", 0..10_000).estimate();
        let error = (estimate as f64 - 10_000.0).abs() / 10_000.0;
        assert!(error < 0.03, "estimate {} off by {}%", estimate, error * 100.0);
    }

    #[test]
    fn repeated_sessions_do_not_inflate_the_estimate() {
        let mut sketch = sketch_of("session", 0..5000);
        for i in 0..5000 {
            sketch.insert(&format!("session_{}", i));
        }
        let error = (sketch.estimate() as f64 - 5000.0).abs() / 5000.0;
        assert!(error < 0.03, "estimate {}", sketch.estimate());
    }
}
