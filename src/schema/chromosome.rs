//! Bit-string chromosome representation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Fixed-length bit sequence encoding one candidate parameter vector.
///
/// Serialized as a string of `0`/`1` characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Chromosome {
    bits: Vec<bool>,
}

impl Chromosome {
    /// Create from raw bits.
    pub fn from_bits(bits: Vec<bool>) -> Self {
        Self { bits }
    }

    /// All-zero chromosome of the given length.
    pub fn zeros(len: usize) -> Self {
        Self {
            bits: vec![false; len],
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    /// Invert the bit at `index`.
    pub fn flip(&mut self, index: usize) {
        self.bits[index] = !self.bits[index];
    }

    /// Number of positions where `self` and `other` differ.
    pub fn hamming_distance(&self, other: &Chromosome) -> usize {
        self.bits
            .iter()
            .zip(&other.bits)
            .filter(|(a, b)| a != b)
            .count()
            + self.len().abs_diff(other.len())
    }
}

impl std::ops::Index<usize> for Chromosome {
    type Output = bool;

    fn index(&self, index: usize) -> &bool {
        &self.bits[index]
    }
}

impl fmt::Display for Chromosome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &bit in &self.bits {
            f.write_str(if bit { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// Error parsing a chromosome from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid chromosome character {found:?} at position {position}")]
pub struct ParseChromosomeError {
    pub position: usize,
    pub found: char,
}

impl FromStr for Chromosome {
    type Err = ParseChromosomeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bits = s
            .chars()
            .enumerate()
            .map(|(position, c)| match c {
                '0' => Ok(false),
                '1' => Ok(true),
                found => Err(ParseChromosomeError { position, found }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { bits })
    }
}

impl From<Chromosome> for String {
    fn from(chromosome: Chromosome) -> Self {
        chromosome.to_string()
    }
}

impl TryFrom<String> for Chromosome {
    type Error = ParseChromosomeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let chromosome: Chromosome = "10110".parse().unwrap();
        assert_eq!(chromosome.len(), 5);
        assert!(chromosome[0]);
        assert!(!chromosome[1]);
        assert_eq!(chromosome.to_string(), "10110");
    }

    #[test]
    fn test_parse_rejects_non_bits() {
        let err = "10a1".parse::<Chromosome>().unwrap_err();
        assert_eq!(err.position, 2);
        assert_eq!(err.found, 'a');
    }

    #[test]
    fn test_serde_as_bit_string() {
        let chromosome: Chromosome = "0011".parse().unwrap();
        let json = serde_json::to_string(&chromosome).unwrap();
        assert_eq!(json, "\"0011\"");
        let parsed: Chromosome = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, chromosome);
    }

    #[test]
    fn test_flip_and_distance() {
        let a: Chromosome = "0000".parse().unwrap();
        let mut b = a.clone();
        b.flip(1);
        b.flip(3);
        assert_eq!(b.to_string(), "0101");
        assert_eq!(a.hamming_distance(&b), 2);
    }
}
