//! Chromosome codec: maps fixed-width bit segments to bounded real parameters.
//!
//! Each parameter owns one contiguous segment of `bits_per_parameter` bits.
//! A segment is read most-significant bit first as an unsigned integer `v`
//! and mapped linearly onto `[lower, upper]` via `lower + v / (2^w - 1) * span`.

use crate::schema::{Chromosome, ParameterSpace};

/// Widest supported segment.
pub const MAX_BITS_PER_PARAMETER: u32 = 32;

/// Invalid encoding setup or input.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodingError {
    #[error("Bits per parameter must be within 1..={max}, got {0}", max = MAX_BITS_PER_PARAMETER)]
    InvalidBitWidth(u32),
    #[error("Parameter space is empty")]
    EmptySpace,
    #[error("Invalid bounds for {name}: [{lower}, {upper}] is not an ordered finite range")]
    InvalidBounds { name: String, lower: f64, upper: f64 },
    #[error("Value {value} is outside the bounds of parameter {name}")]
    ValueOutOfBounds { name: String, value: f64 },
    #[error("Expected {expected} parameter values, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Validate a parameter space and segment width, returning the chromosome length.
pub fn encode_bounds(
    space: &ParameterSpace,
    bits_per_parameter: u32,
) -> Result<usize, EncodingError> {
    if !(1..=MAX_BITS_PER_PARAMETER).contains(&bits_per_parameter) {
        return Err(EncodingError::InvalidBitWidth(bits_per_parameter));
    }
    if space.is_empty() {
        return Err(EncodingError::EmptySpace);
    }
    for param in space {
        // A finite span rules out bounds like [-1e308, 1e308] whose width overflows.
        let valid = param.lower < param.upper && param.span().is_finite();
        if !valid {
            return Err(EncodingError::InvalidBounds {
                name: param.name.clone(),
                lower: param.lower,
                upper: param.upper,
            });
        }
    }
    Ok(space.len() * bits_per_parameter as usize)
}

/// Encoder/decoder for one parameter space.
#[derive(Debug, Clone)]
pub struct ChromosomeCodec {
    space: ParameterSpace,
    bits_per_parameter: u32,
    max_value: u64,
}

impl ChromosomeCodec {
    /// Create a codec, failing on an invalid width or bounds.
    pub fn new(space: ParameterSpace, bits_per_parameter: u32) -> Result<Self, EncodingError> {
        encode_bounds(&space, bits_per_parameter)?;
        Ok(Self {
            space,
            bits_per_parameter,
            max_value: (1u64 << bits_per_parameter) - 1,
        })
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    pub fn bits_per_parameter(&self) -> u32 {
        self.bits_per_parameter
    }

    /// Total chromosome length in bits.
    pub fn chromosome_length(&self) -> usize {
        self.space.len() * self.bits_per_parameter as usize
    }

    /// Distance between adjacent representable values of parameter `index`.
    pub fn resolution(&self, index: usize) -> f64 {
        self.space[index].span() / self.max_value as f64
    }

    /// Decode a chromosome into its parameter vector.
    ///
    /// # Panics
    ///
    /// Panics if the chromosome length does not match the codec or a decoded
    /// value falls outside its bounds. Both are internal invariant violations.
    pub fn decode(&self, chromosome: &Chromosome) -> Vec<f64> {
        assert_eq!(
            chromosome.len(),
            self.chromosome_length(),
            "chromosome length does not match codec layout"
        );

        let width = self.bits_per_parameter as usize;
        chromosome
            .bits()
            .chunks(width)
            .zip(&self.space)
            .map(|(segment, param)| {
                let v = segment
                    .iter()
                    .fold(0u64, |acc, &bit| (acc << 1) | u64::from(bit));
                let value = if v == self.max_value {
                    param.upper
                } else {
                    param.lower + (v as f64 / self.max_value as f64) * param.span()
                };
                assert!(
                    param.contains(value),
                    "decoded value {} outside [{}, {}] for {}",
                    value,
                    param.lower,
                    param.upper,
                    param.name
                );
                value
            })
            .collect()
    }

    /// Encode a parameter vector, rounding each value to the nearest step.
    pub fn encode_nearest(&self, values: &[f64]) -> Result<Chromosome, EncodingError> {
        if values.len() != self.space.len() {
            return Err(EncodingError::LengthMismatch {
                expected: self.space.len(),
                actual: values.len(),
            });
        }

        let width = self.bits_per_parameter as usize;
        let mut bits = Vec::with_capacity(self.chromosome_length());
        for (&value, param) in values.iter().zip(&self.space) {
            if !param.contains(value) {
                return Err(EncodingError::ValueOutOfBounds {
                    name: param.name.clone(),
                    value,
                });
            }
            let scaled = (value - param.lower) / param.span() * self.max_value as f64;
            let v = (scaled.round() as u64).min(self.max_value);
            bits.extend((0..width).rev().map(|shift| (v >> shift) & 1 == 1));
        }
        Ok(Chromosome::from_bits(bits))
    }
}
