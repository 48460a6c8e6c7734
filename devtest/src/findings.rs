// Copyright 2026 Oxide Computer Company
use slog::{error, Logger};

use crate::pattern::Mismatch;

/// How many mismatches are kept in memory for the summary.  The count is
/// always exact and every one of them is logged.
pub const RETAINED_FINDINGS: usize = 1024;

/// Corruption found while verifying.  Never an error: a run with findings
/// still covers the whole extent.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Findings {
    words: u64,
    blocks: u64,
    retained: Vec<Mismatch>,
}

impl Findings {
    pub fn new() -> Findings {
        Findings::default()
    }

    /// Records what `check` found in one block, logging each mismatch.
    pub fn record(&mut self, mismatches: &[Mismatch], log: &Logger) {
        if mismatches.is_empty() {
            return;
        }
        self.blocks += 1;
        for m in mismatches {
            error!(
                log,
                "data mismatch";
                "offset" => format!("{:#x}", m.offset),
                "expected" => format!("{:#x}", m.expected),
                "found" => format!("{:#x}", m.found),
            );
            self.words += 1;
            if self.retained.len() < RETAINED_FINDINGS {
                self.retained.push(*m);
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.words == 0
    }

    /// Mismatched words
    pub fn count(&self) -> u64 {
        self.words
    }

    /// Blocks with at least one mismatched word
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// The first mismatches seen, in the order they were recorded
    pub fn retained(&self) -> &[Mismatch] {
        &self.retained
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::csl;

    fn m(offset: u64) -> Mismatch {
        Mismatch {
            offset,
            expected: offset,
            found: !offset,
        }
    }

    #[test]
    fn clean_blocks_leave_no_trace() {
        let mut f = Findings::new();
        f.record(&[], &csl());
        f.record(&[], &csl());
        assert!(f.is_clean());
        assert_eq!(f.count(), 0);
        assert_eq!(f.blocks(), 0);
    }

    #[test]
    fn counts_words_and_blocks() {
        let log = csl();
        let mut f = Findings::new();
        f.record(&[m(0x1000), m(0x1008)], &log);
        f.record(&[], &log);
        f.record(&[m(0x5000)], &log);
        assert!(!f.is_clean());
        assert_eq!(f.count(), 3);
        assert_eq!(f.blocks(), 2);
        assert_eq!(f.retained(), &[m(0x1000), m(0x1008), m(0x5000)]);
    }

    #[test]
    fn retention_is_capped_but_count_is_exact() {
        let log = csl();
        let mut f = Findings::new();
        let block: Vec<Mismatch> = (0..512).map(|i| m(i * 8)).collect();
        for _ in 0..3 {
            f.record(&block, &log);
        }
        assert_eq!(f.count(), 3 * 512);
        assert_eq!(f.blocks(), 3);
        assert_eq!(f.retained().len(), RETAINED_FINDINGS);
        assert_eq!(f.retained()[512], m(0));
    }
}
