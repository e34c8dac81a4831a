// Copyright (c) 2020 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, bail, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::UtilError;

/// Number of bits held by one bitmap word.
pub const BITS_PER_WORD: usize = 64;

/// Returns the (word index, bit shift) pair of the bit `nr`.
#[inline]
pub fn word_and_shift(nr: usize) -> (usize, usize) {
    (nr / BITS_PER_WORD, nr % BITS_PER_WORD)
}

/// Number of words needed to hold `nbits` bits.
#[inline]
pub fn words_for_bits(nbits: usize) -> usize {
    (nbits + BITS_PER_WORD - 1) / BITS_PER_WORD
}

/// Mask of the bits in `[shift, shift + count)` of one word.
#[inline]
fn word_mask(shift: usize, count: usize) -> u64 {
    if count >= BITS_PER_WORD {
        u64::MAX << shift
    } else {
        ((1u64 << count) - 1) << shift
    }
}

/// This struct is used to offer a bitmap whose bits can be set and cleared
/// concurrently from different threads.
///
/// Every single-bit operation is one atomic read-modify-write on the word
/// holding the bit. Range operations are atomic per word only.
pub struct Bitmap {
    /// The data to restore bit information.
    data: Vec<AtomicU64>,
    /// Number of valid bits.
    nbits: usize,
}

impl Bitmap {
    /// Initialize a Bitmap structure with `nbits` cleared bits.
    ///
    /// # Arguments
    ///
    /// * `nbits` - The number of bits the bitmap tracks.
    pub fn new(nbits: usize) -> Self {
        let mut data = Vec::with_capacity(words_for_bits(nbits));
        data.resize_with(words_for_bits(nbits), || AtomicU64::new(0));
        Bitmap { data, nbits }
    }

    /// Initialize a Bitmap structure with all `nbits` bits set.
    pub fn new_filled(nbits: usize) -> Self {
        let bitmap = Bitmap::new(nbits);
        bitmap.fill();
        bitmap
    }

    /// Return the number of valid bits.
    pub fn len(&self) -> usize {
        self.nbits
    }

    pub fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    /// Return the number of words of bitmap.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn check_bit(&self, nr: usize) -> Result<()> {
        if nr >= self.nbits {
            return Err(anyhow!(UtilError::OutOfBound(
                nr as u64,
                self.nbits as u64
            )));
        }
        Ok(())
    }

    fn check_range(&self, start: usize, count: usize) -> Result<()> {
        match start.checked_add(count) {
            Some(end) if end <= self.nbits => Ok(()),
            _ => Err(anyhow!(UtilError::OutOfBound(
                start.saturating_add(count) as u64,
                self.nbits as u64
            ))),
        }
    }

    /// Set the bit of bitmap.
    ///
    /// # Arguments
    ///
    /// * `nr` - the bit index.
    pub fn set(&self, nr: usize) -> Result<()> {
        self.check_bit(nr)?;
        let (idx, shift) = word_and_shift(nr);
        self.data[idx].fetch_or(1 << shift, Ordering::SeqCst);
        Ok(())
    }

    /// Clear the bit of bitmap.
    pub fn clear(&self, nr: usize) -> Result<()> {
        self.check_bit(nr)?;
        let (idx, shift) = word_and_shift(nr);
        self.data[idx].fetch_and(!(1 << shift), Ordering::SeqCst);
        Ok(())
    }

    /// Query bitmap if contains input bit or not.
    pub fn contain(&self, nr: usize) -> Result<bool> {
        self.check_bit(nr)?;
        let (idx, shift) = word_and_shift(nr);
        Ok(self.data[idx].load(Ordering::SeqCst) & (1 << shift) != 0)
    }

    /// Clear the bit and return whether it was set before.
    pub fn test_and_clear(&self, nr: usize) -> Result<bool> {
        self.check_bit(nr)?;
        let (idx, shift) = word_and_shift(nr);
        let old = self.data[idx].fetch_and(!(1 << shift), Ordering::SeqCst);
        Ok(old & (1 << shift) != 0)
    }

    /// Set the bit and return whether it was set before.
    pub fn test_and_set(&self, nr: usize) -> Result<bool> {
        self.check_bit(nr)?;
        let (idx, shift) = word_and_shift(nr);
        let old = self.data[idx].fetch_or(1 << shift, Ordering::SeqCst);
        Ok(old & (1 << shift) != 0)
    }

    /// Set `count` bits starting from `start`.
    pub fn set_range(&self, start: usize, count: usize) -> Result<()> {
        self.check_range(start, count)?;
        self.for_each_word(start, count, |word, mask| {
            word.fetch_or(mask, Ordering::SeqCst);
        });
        Ok(())
    }

    /// Clear `count` bits starting from `start`, return the number of bits
    /// which were set before clearing.
    pub fn clear_range(&self, start: usize, count: usize) -> Result<u64> {
        self.check_range(start, count)?;
        let mut cleared = 0;
        self.for_each_word(start, count, |word, mask| {
            let old = word.fetch_and(!mask, Ordering::SeqCst);
            cleared += u64::from((old & mask).count_ones());
        });
        Ok(cleared)
    }

    fn for_each_word<F: FnMut(&AtomicU64, u64)>(&self, start: usize, count: usize, mut f: F) {
        let mut nr = start;
        let end = start + count;
        while nr < end {
            let (idx, shift) = word_and_shift(nr);
            let bits = std::cmp::min(BITS_PER_WORD - shift, end - nr);
            f(&self.data[idx], word_mask(shift, bits));
            nr += bits;
        }
    }

    /// Find the first set bit at or after `start`, return `len()` if there
    /// is none.
    pub fn find_next_bit(&self, start: usize) -> usize {
        self.find_next(start, false)
    }

    /// Find the first cleared bit at or after `start`, return `len()` if
    /// there is none.
    pub fn find_next_zero_bit(&self, start: usize) -> usize {
        self.find_next(start, true)
    }

    fn find_next(&self, start: usize, invert: bool) -> usize {
        if start >= self.nbits {
            return self.nbits;
        }
        let (mut idx, shift) = word_and_shift(start);
        let load = |i: usize| {
            let w = self.data[i].load(Ordering::SeqCst);
            if invert {
                !w
            } else {
                w
            }
        };
        let mut word = load(idx) & (u64::MAX << shift);
        loop {
            if word != 0 {
                let nr = idx * BITS_PER_WORD + word.trailing_zeros() as usize;
                return std::cmp::min(nr, self.nbits);
            }
            idx += 1;
            if idx >= self.data.len() {
                return self.nbits;
            }
            word = load(idx);
        }
    }

    /// Count the set bits of bitmap.
    pub fn count_ones(&self) -> u64 {
        self.data
            .iter()
            .map(|w| u64::from(w.load(Ordering::SeqCst).count_ones()))
            .sum()
    }

    /// Set all valid bits.
    pub fn fill(&self) {
        if self.nbits != 0 {
            self.for_each_word(0, self.nbits, |word, mask| {
                word.fetch_or(mask, Ordering::SeqCst);
            });
        }
    }

    /// Clear all bits.
    pub fn clear_all(&self) {
        for word in self.data.iter() {
            word.store(0, Ordering::SeqCst);
        }
    }

    /// Invert all valid bits.
    pub fn complement(&self) {
        if self.nbits != 0 {
            self.for_each_word(0, self.nbits, |word, mask| {
                word.fetch_xor(mask, Ordering::SeqCst);
            });
        }
    }

    /// OR the `words` into bitmap starting from the first word, return the
    /// number of bits that were newly set.
    pub fn merge_words(&self, words: &[u64]) -> Result<u64> {
        if words.len() > self.data.len() {
            bail!(UtilError::OutOfBound(
                (words.len() * BITS_PER_WORD) as u64,
                self.nbits as u64
            ));
        }
        let mut added = 0;
        for (idx, src) in words.iter().enumerate() {
            let mut bits = *src;
            if idx == self.data.len() - 1 && self.nbits % BITS_PER_WORD != 0 {
                bits &= word_mask(0, self.nbits % BITS_PER_WORD);
            }
            if bits == 0 {
                continue;
            }
            let old = self.data[idx].fetch_or(bits, Ordering::SeqCst);
            added += u64::from((bits & !old).count_ones());
        }
        Ok(added)
    }

    /// Fetch all words and clear them, one atomic swap per word.
    pub fn take_words(&self) -> Vec<u64> {
        self.data
            .iter()
            .map(|w| w.swap(0, Ordering::SeqCst))
            .collect()
    }

    /// Dump the bitmap as little endian words.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; self.data.len() * 8];
        for (idx, word) in self.data.iter().enumerate() {
            LittleEndian::write_u64(&mut buf[idx * 8..], word.load(Ordering::SeqCst));
        }
        buf
    }

    /// Replace the bitmap content with little endian words.
    pub fn load_le_bytes(&self, buf: &[u8]) -> Result<()> {
        if buf.len() != self.data.len() * 8 {
            bail!(UtilError::OutOfBound(buf.len() as u64, (self.data.len() * 8) as u64));
        }
        for (idx, word) in self.data.iter().enumerate() {
            word.store(LittleEndian::read_u64(&buf[idx * 8..]), Ordering::SeqCst);
        }
        if self.nbits % BITS_PER_WORD != 0 {
            let last = self.data.len() - 1;
            self.data[last].fetch_and(word_mask(0, self.nbits % BITS_PER_WORD), Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_basic() {
        let bitmap = Bitmap::new(130);
        assert_eq!(bitmap.size(), 3);
        assert!(bitmap.set(129).is_ok());
        assert!(bitmap.set(130).is_err());
        assert!(bitmap.contain(129).unwrap());
        assert!(!bitmap.contain(128).unwrap());

        assert!(bitmap.test_and_clear(129).unwrap());
        assert!(!bitmap.test_and_clear(129).unwrap());
        assert_eq!(bitmap.count_ones(), 0);
    }

    #[test]
    fn test_bitmap_range() {
        let bitmap = Bitmap::new(200);
        bitmap.set_range(60, 70).unwrap();
        assert_eq!(bitmap.count_ones(), 70);
        assert_eq!(bitmap.find_next_bit(0), 60);
        assert_eq!(bitmap.find_next_zero_bit(60), 130);

        assert_eq!(bitmap.clear_range(100, 50).unwrap(), 30);
        assert_eq!(bitmap.count_ones(), 40);
        assert_eq!(bitmap.find_next_bit(100), 200);
        assert!(bitmap.clear_range(190, 11).is_err());
    }

    #[test]
    fn test_bitmap_fill_and_complement() {
        let bitmap = Bitmap::new_filled(70);
        assert_eq!(bitmap.count_ones(), 70);
        bitmap.clear(3).unwrap();
        bitmap.complement();
        assert_eq!(bitmap.count_ones(), 1);
        assert_eq!(bitmap.find_next_bit(0), 3);
        assert_eq!(bitmap.find_next_bit(4), 70);
    }

    #[test]
    fn test_bitmap_merge_and_dump() {
        let bitmap = Bitmap::new(72);
        bitmap.set(0).unwrap();
        // Bits beyond the valid range are dropped.
        let added = bitmap.merge_words(&[0b11, u64::MAX]).unwrap();
        assert_eq!(added, 1 + 8);
        assert_eq!(bitmap.count_ones(), 10);

        let dump = bitmap.to_le_bytes();
        assert_eq!(dump.len(), 16);
        let other = Bitmap::new(72);
        other.load_le_bytes(&dump).unwrap();
        assert_eq!(other.count_ones(), 10);
        assert!(other.load_le_bytes(&dump[..8]).is_err());

        let words = other.take_words();
        assert_eq!(words, vec![0b11, 0xff]);
        assert_eq!(other.count_ones(), 0);
    }
}
