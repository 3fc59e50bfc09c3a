//! Fixed-point encoding of real values into BFV plaintext slots.
//!
//! A value `x` is stored as `round(x * 2^scale_bits)` reduced modulo the
//! plaintext modulus `t`, negative values wrapping around. Decoding interprets
//! slots in the centered range `(-t/2, t/2]` and divides by
//! `2^(scale_bits * exponent)`, where the exponent counts how many scaled
//! factors were multiplied together.

use crate::{Error, Result};

/// Fixed-point codec bound to one plaintext modulus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedPoint {
    modulus: u64,
    scale_bits: u32,
}

impl FixedPoint {
    /// Create a codec for the plaintext modulus `modulus`.
    pub fn new(modulus: u64, scale_bits: u32) -> Self {
        Self {
            modulus,
            scale_bits,
        }
    }

    /// The plaintext modulus.
    pub fn modulus(&self) -> u64 {
        self.modulus
    }

    /// The scaling factor `2^scale_bits`.
    pub fn scale(&self) -> f64 {
        (self.scale_bits as f64).exp2()
    }

    /// Largest magnitude a fresh value may take.
    pub fn max_magnitude(&self) -> f64 {
        (self.modulus / 2) as f64 / self.scale()
    }

    /// Largest magnitude a product of two scaled factors may take before it
    /// wraps around the plaintext modulus.
    pub fn max_product_magnitude(&self) -> f64 {
        (self.modulus / 2) as f64 / (self.scale() * self.scale())
    }

    /// Encode real values into plaintext slot values.
    pub fn encode(&self, values: &[f64]) -> Result<Vec<u64>> {
        let scale = self.scale();
        let half = (self.modulus / 2) as i128;
        values
            .iter()
            .map(|&x| {
                if !x.is_finite() {
                    return Err(Error::InvalidInput(format!("{x} is not a finite value")));
                }
                let scaled = (x * scale).round() as i128;
                if scaled.abs() > half {
                    return Err(Error::InvalidInput(format!(
                        "{x} exceeds the encodable magnitude {}",
                        self.max_magnitude()
                    )));
                }
                Ok(scaled.rem_euclid(self.modulus as i128) as u64)
            })
            .collect()
    }

    /// Decode slot values carrying `exponent` scaled factors.
    pub fn decode(&self, slots: &[u64], exponent: u32) -> Result<Vec<f64>> {
        let bits = self
            .scale_bits
            .checked_mul(exponent)
            .ok_or_else(|| Error::malformed(format!("scale exponent {exponent}")))?;
        let divisor = (bits as f64).exp2();
        let half = self.modulus / 2;
        Ok(slots
            .iter()
            .map(|&v| {
                let v = v % self.modulus;
                let centered = if v > half {
                    v as i128 - self.modulus as i128
                } else {
                    v as i128
                };
                centered as f64 / divisor
            })
            .collect())
    }
}
