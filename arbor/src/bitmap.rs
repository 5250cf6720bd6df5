//! A growable bit vector, used as the page allocation map of a container.

use crate::error::{Result, StoreError};

const WORD_BITS: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitVector {
    words: Vec<u64>,
    logical_size: usize,
}

impl BitVector {
    pub fn new(logical_size: usize) -> Self {
        Self {
            words: vec![0; logical_size.div_ceil(WORD_BITS)],
            logical_size,
        }
    }

    /// Number of addressable bits. Bits past it read as clear.
    pub fn logical_size(&self) -> usize {
        self.logical_size
    }

    pub fn get(&self, index: usize) -> bool {
        if index >= self.logical_size {
            return false;
        }
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Sets a bit, growing the vector if needed.
    pub fn set(&mut self, index: usize) {
        self.extend_to(index + 1);
        self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.logical_size {
            self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        }
    }

    pub fn extend_to(&mut self, logical_size: usize) {
        if logical_size <= self.logical_size {
            return;
        }
        self.words.resize(logical_size.div_ceil(WORD_BITS), 0);
        self.logical_size = logical_size;
    }

    /// First clear bit at or after `from`. May be past the logical size.
    pub fn next_clear_bit(&self, from: usize) -> usize {
        let mut index = from;
        while index < self.logical_size {
            let word = self.words[index / WORD_BITS] >> (index % WORD_BITS);
            if word == u64::MAX >> (index % WORD_BITS) {
                index = (index / WORD_BITS + 1) * WORD_BITS;
                continue;
            }
            if word & 1 == 0 {
                return index;
            }
            index += 1;
        }
        index.max(from)
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Length-prefixed, little-endian bit order within each byte.
    pub fn to_bytes(&self) -> Vec<u8> {
        let byte_len = self.logical_size.div_ceil(8);
        let mut out = Vec::with_capacity(4 + byte_len);
        out.extend_from_slice(&(self.logical_size as u32).to_be_bytes());
        for i in 0..byte_len {
            let word = self.words[i / 8];
            out.push((word >> ((i % 8) * 8)) as u8);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(StoreError::InvalidArgument(
                "bit vector header truncated".to_string(),
            ));
        }
        let logical_size = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let byte_len = logical_size.div_ceil(8);
        let body = &bytes[4..];
        if body.len() < byte_len {
            return Err(StoreError::InvalidArgument(format!(
                "bit vector of {logical_size} bits needs {byte_len} bytes, got {}",
                body.len()
            )));
        }
        let mut vector = BitVector::new(logical_size);
        for (i, byte) in body[..byte_len].iter().enumerate() {
            vector.words[i / 8] |= (*byte as u64) << ((i % 8) * 8);
        }
        Ok(vector)
    }

    /// Bytes `to_bytes` produces for a vector of `logical_size` bits.
    pub fn encoded_len(logical_size: usize) -> usize {
        4 + logical_size.div_ceil(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_clear_bit_skips_full_words() {
        let mut bits = BitVector::new(200);
        for i in 0..130 {
            bits.set(i);
        }
        bits.clear(70);
        assert_eq!(bits.next_clear_bit(0), 70);
        assert_eq!(bits.next_clear_bit(71), 130);
        bits.set(70);
        assert_eq!(bits.next_clear_bit(0), 130);
    }

    #[test]
    fn next_clear_bit_past_logical_size() {
        let mut bits = BitVector::new(0);
        assert_eq!(bits.next_clear_bit(0), 0);
        bits.set(0);
        bits.set(1);
        assert_eq!(bits.logical_size(), 2);
        assert_eq!(bits.next_clear_bit(0), 2);
        assert_eq!(bits.next_clear_bit(5), 5);
    }

    #[test]
    fn bytes_preserve_bits_and_size() {
        let mut bits = BitVector::new(77);
        for i in [0, 3, 8, 63, 64, 76] {
            bits.set(i);
        }
        let restored = BitVector::from_bytes(&bits.to_bytes()).unwrap();
        assert_eq!(restored, bits);
        assert_eq!(restored.count_ones(), 6);
        assert_eq!(bits.to_bytes().len(), BitVector::encoded_len(77));
        assert!(!restored.get(200));
    }
}
