//! HyperLogLog cardinality sketch
//!
//! Backs PFADD/PFCOUNT in the in-process fast store, matching the dense
//! Redis sketch: 2^14 registers, ~0.81% standard error, fixed footprint.
//! Elements can be added and sketches merged; nothing can be removed, and
//! merging yields the union's estimate.

use xxhash_rust::xxh64::xxh64;

const PRECISION: u32 = 14;
const REGISTERS: usize = 1 << PRECISION;

#[derive(Debug, Clone)]
pub struct CardinalitySketch {
    registers: Vec<u8>,
}

impl Default for CardinalitySketch {
    fn default() -> Self {
        Self::new()
    }
}

impl CardinalitySketch {
    pub fn new() -> Self {
        Self {
            registers: vec![0u8; REGISTERS],
        }
    }

    pub fn add(&mut self, element: &str) {
        let hash = xxh64(element.as_bytes(), 0);
        let index = (hash >> (64 - PRECISION)) as usize;
        let remainder = hash << PRECISION;
        // Rank of the first set bit in the remaining 50 bits
        let rank = if remainder == 0 {
            (64 - PRECISION + 1) as u8
        } else {
            remainder.leading_zeros() as u8 + 1
        };
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    pub fn merge(&mut self, other: &CardinalitySketch) {
        for (a, b) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *b > *a {
                *a = *b;
            }
        }
    }

    pub fn count(&self) -> u64 {
        let m = REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);

        let mut sum = 0.0;
        let mut zeros = 0usize;
        for &r in &self.registers {
            sum += 2f64.powi(-i32::from(r));
            if r == 0 {
                zeros += 1;
            }
        }

        let raw = alpha * m * m / sum;

        // Linear counting for the small range
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            m * (m / zeros as f64).ln()
        } else {
            raw
        };

        estimate.round() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&r| r == 0)
    }
}
