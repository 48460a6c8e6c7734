// Copyright 2026 Oxide Computer Company
//! Offset-derived verification pattern
//!
//! Every 8-byte word of a block holds its own absolute byte offset in the
//! target, in native byte order.  A block read back from the wrong place, a
//! torn write, or a flipped bit all show up as words that disagree with the
//! offset they were read from.
use std::fmt;

use devtest_common::WORD_SIZE;

const WORD: usize = WORD_SIZE as usize;

/// One word that did not read back as written
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Mismatch {
    /// Absolute byte offset of the word in the target
    pub offset: u64,
    pub expected: u64,
    pub found: u64,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block at {:#x}: expected {:#x}, got {:#x}",
            self.offset, self.expected, self.found
        )
    }
}

/// Writes the pattern for a block starting at `offset` into `buf`.
///
/// # Panics
/// `buf` must hold a whole number of words.
pub fn fill(buf: &mut [u8], offset: u64) {
    assert_eq!(buf.len() % WORD, 0);
    for (i, word) in buf.chunks_exact_mut(WORD).enumerate() {
        let value = offset + (i * WORD) as u64;
        word.copy_from_slice(&value.to_ne_bytes());
    }
}

/// Compares `buf` word by word against the pattern for a block starting at
/// `offset`.  The whole block is always scanned; every disagreeing word is
/// returned, in ascending offset order.
///
/// # Panics
/// `buf` must hold a whole number of words.
pub fn verify(buf: &[u8], offset: u64) -> Vec<Mismatch> {
    assert_eq!(buf.len() % WORD, 0);
    let mut out = Vec::new();
    for (i, word) in buf.chunks_exact(WORD).enumerate() {
        let expected = offset + (i * WORD) as u64;
        let mut raw = [0u8; WORD];
        raw.copy_from_slice(word);
        let found = u64::from_ne_bytes(raw);
        if found != expected {
            out.push(Mismatch {
                offset: expected,
                expected,
                found,
            });
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use test_strategy::proptest;

    fn word_at(buf: &[u8], i: usize) -> u64 {
        let mut raw = [0u8; WORD];
        raw.copy_from_slice(&buf[i * WORD..][..WORD]);
        u64::from_ne_bytes(raw)
    }

    #[test]
    fn fill_block_at_0x10000() {
        let mut buf = vec![0u8; 4096];
        fill(&mut buf, 0x10000);
        assert_eq!(word_at(&buf, 0), 0x10000);
        assert_eq!(word_at(&buf, 1), 0x10008);
        assert_eq!(word_at(&buf, 2), 0x10010);
        assert_eq!(word_at(&buf, 511), 0x10ff8);
        for i in 0..512 {
            assert_eq!(word_at(&buf, i), 0x10000 + 8 * i as u64);
        }
        assert!(verify(&buf, 0x10000).is_empty());
    }

    #[test]
    fn verify_wrong_offset_flags_every_word() {
        let mut buf = vec![0u8; 64];
        fill(&mut buf, 0x2000);
        let bad = verify(&buf, 0x3000);
        assert_eq!(bad.len(), 8);
        assert_eq!(
            bad[0],
            Mismatch {
                offset: 0x3000,
                expected: 0x3000,
                found: 0x2000
            }
        );
    }

    #[test]
    fn verify_zeroed_block() {
        // An unwritten block at offset 0 matches only in its first word.
        let buf = vec![0u8; 4096];
        let bad = verify(&buf, 0);
        assert_eq!(bad.len(), 511);
        assert_eq!(bad[0].offset, 8);
    }

    #[test]
    fn mismatch_display() {
        let m = Mismatch {
            offset: 0x10008,
            expected: 0x10008,
            found: 0xdead,
        };
        assert_eq!(
            m.to_string(),
            "block at 0x10008: expected 0x10008, got 0xdead"
        );
    }

    #[proptest]
    fn filled_block_verifies_clean(
        #[strategy(0..1u64 << 40)] block: u64,
        #[strategy(1..=64usize)] words: usize,
    ) {
        let offset = block * WORD_SIZE;
        let mut buf = vec![0u8; words * WORD];
        fill(&mut buf, offset);
        prop_assert!(verify(&buf, offset).is_empty());
    }

    #[proptest]
    fn single_corrupt_word_is_reported_once(
        #[strategy(0..1u64 << 30)] block: u64,
        #[strategy(1..=512usize)] words: usize,
        #[strategy(0..#words)] victim: usize,
        #[strategy(1..=u64::MAX)] flip: u64,
    ) {
        let offset = block * 4096;
        let mut buf = vec![0u8; words * WORD];
        fill(&mut buf, offset);

        let p = victim * WORD;
        let old = word_at(&buf, victim);
        buf[p..p + WORD].copy_from_slice(&(old ^ flip).to_ne_bytes());

        let bad = verify(&buf, offset);
        prop_assert_eq!(bad.len(), 1);
        prop_assert_eq!(bad[0].offset, offset + p as u64);
        prop_assert_eq!(bad[0].expected, old);
        prop_assert_eq!(bad[0].found, old ^ flip);
    }
}
