//! Block completeness bitfield
//!
//! Bit `i` describes block `i`; packed most-significant bit first and padded
//! with zero bits to a byte boundary on the wire.

use std::collections::BTreeMap;

/// Per-block completeness map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<bool>,
}

impl Bitfield {
    /// All-false bitfield over `len` blocks
    pub fn new(len: usize) -> Self {
        Self { bits: vec![false; len] }
    }

    /// Unpack wire bytes, keeping only the first `num_blocks` bits
    ///
    /// Missing trailing bytes read as zero.
    pub fn from_bytes(data: &[u8], num_blocks: usize) -> Self {
        let bits = (0..num_blocks)
            .map(|i| {
                data.get(i / 8)
                    .map(|byte| byte & (0x80 >> (i % 8)) != 0)
                    .unwrap_or(false)
            })
            .collect();
        Self { bits }
    }

    /// Build from an index map; indices at or beyond `len` are ignored
    pub fn from_map(map: &BTreeMap<u32, bool>, len: usize) -> Self {
        let mut field = Self::new(len);
        for (&index, &present) in map {
            field.set(index as usize, present);
        }
        field
    }

    /// Pack MSB-first, zero-padded to whole bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.bits.len().div_ceil(8)];
        for (i, _) in self.bits.iter().enumerate().filter(|(_, b)| **b) {
            out[i / 8] |= 0x80 >> (i % 8);
        }
        out
    }

    /// Completeness of block `index`; false when out of range
    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    /// Set block `index`; returns false when out of range
    pub fn set(&mut self, index: usize, value: bool) -> bool {
        match self.bits.get_mut(index) {
            Some(bit) => {
                *bit = value;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Number of set bits
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    pub fn any(&self) -> bool {
        self.bits.iter().any(|b| *b)
    }

    /// Indices of set bits
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter().enumerate().filter(|(_, b)| **b).map(|(i, _)| i)
    }
}

impl From<Vec<bool>> for Bitfield {
    fn from(bits: Vec<bool>) -> Self {
        Self { bits }
    }
}
