//! Immutable bitstream views.
//!
//! A [`BitBuffer`] holds one bitstream as a sequence of `0`/`1` values, one
//! per byte. It is built once by the caller and only ever borrowed by tests.

use thiserror::Error;

/// Rejected input when building a [`BitBuffer`] from individual bits.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitError {
    #[error("bit {index} has value {value}, expected 0 or 1")]
    NotABit { index: usize, value: u8 },

    /// `index` is the byte offset of `found` in the input text.
    #[error("character {found:?} at offset {index}, expected '0' or '1'")]
    NotADigit { index: usize, found: char },
}

/// One bitstream under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitBuffer {
    bits: Vec<u8>,
}

impl BitBuffer {
    /// Wrap a vector of `0`/`1` values.
    pub fn from_bits(bits: Vec<u8>) -> Result<Self, BitError> {
        if let Some((index, &value)) = bits.iter().enumerate().find(|&(_, &b)| b > 1) {
            return Err(BitError::NotABit { index, value });
        }
        Ok(Self { bits })
    }

    /// Unpack a byte slice into individual bits (MSB first per byte).
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut bits = Vec::with_capacity(data.len() * 8);
        for &byte in data {
            for shift in (0..8).rev() {
                bits.push((byte >> shift) & 1);
            }
        }
        Self { bits }
    }

    /// Parse an ASCII string of `'0'` and `'1'`, ignoring whitespace.
    pub fn from_ascii(text: &str) -> Result<Self, BitError> {
        let mut bits = Vec::with_capacity(text.len());
        for (index, found) in text.char_indices() {
            match found {
                '0' => bits.push(0),
                '1' => bits.push(1),
                c if c.is_ascii_whitespace() => {}
                _ => return Err(BitError::NotADigit { index, found }),
            }
        }
        Ok(Self { bits })
    }

    /// Number of bits.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bits
    }

    /// Integer value of the `block`-th (0-based) non-overlapping `l`-bit block, MSB first.
    ///
    /// # Panics
    /// Panics if the block extends past the end of the buffer.
    #[inline]
    pub fn block_value(&self, block: usize, l: usize) -> usize {
        let start = block * l;
        self.bits[start..start + l]
            .iter()
            .fold(0usize, |acc, &b| (acc << 1) | b as usize)
    }
}

impl AsRef<[u8]> for BitBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bits
    }
}
