// Copyright 2026 Oxide Computer Company
use super::*;

/*
 * The verification pattern is a sequence of native-endian u64 words, each
 * holding its own absolute byte offset in the target.  Every block must hold
 * a whole number of words, and every buffer must satisfy O_DIRECT alignment.
 */
pub const WORD_SIZE: u64 = std::mem::size_of::<u64>() as u64;
pub const BLOCK_ALIGN: u64 = 4096;

pub const DEFAULT_BLOCK_SIZE: u64 = 4096;
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Shape of one run: how big each I/O is, how many may be in the kernel at
/// once, how many buffers exist, and how much of the target gets covered.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Geometry {
    /**
     * Size of each I/O request in bytes.
     */
    block_size: u64,

    /**
     * Upper bound on operations submitted to the kernel but not yet reaped.
     */
    queue_depth: usize,

    /**
     * Bytes of buffer memory; fixes how many block operations exist.
     */
    buffer_budget: u64,

    /**
     * Bytes of the target that get written and verified, a whole number of
     * blocks.
     */
    extent: u64,
}

impl Geometry {
    /// Validates the requested shape against a target of `target_len` bytes.
    ///
    /// A missing `buffer_budget` defaults to one buffer per queue slot.
    pub fn new(
        block_size: u64,
        queue_depth: usize,
        buffer_budget: Option<u64>,
        target_len: u64,
    ) -> Result<Self, DevtestError> {
        if block_size == 0 {
            devtest_bail!(InvalidConfig, "block size must be non-zero");
        }
        if block_size % WORD_SIZE != 0 {
            return Err(DevtestError::BlockSizeUnaligned(block_size, WORD_SIZE));
        }
        if block_size % BLOCK_ALIGN != 0 {
            return Err(DevtestError::BlockSizeUnaligned(
                block_size,
                BLOCK_ALIGN,
            ));
        }
        if queue_depth == 0 {
            devtest_bail!(InvalidConfig, "queue depth must be at least 1");
        }

        let needed = block_size
            .checked_mul(queue_depth as u64)
            .ok_or_else(|| {
                DevtestError::InvalidConfig(format!(
                    "block size {} * queue depth {} overflows",
                    block_size, queue_depth
                ))
            })?;
        let buffer_budget = buffer_budget.unwrap_or(needed);
        if buffer_budget < needed {
            return Err(DevtestError::BufferBudgetTooSmall {
                budget: buffer_budget,
                needed,
            });
        }

        let extent = target_len / block_size * block_size;
        if extent == 0 {
            return Err(DevtestError::TargetTooSmall {
                len: target_len,
                block_size,
            });
        }
        if extent < buffer_budget {
            return Err(DevtestError::BufferBudgetTooLarge {
                budget: buffer_budget,
                extent,
            });
        }

        Ok(Geometry {
            block_size,
            queue_depth,
            buffer_budget,
            extent,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    pub fn buffer_budget(&self) -> u64 {
        self.buffer_budget
    }

    pub fn extent(&self) -> u64 {
        self.extent
    }

    pub fn block_count(&self) -> u64 {
        self.extent / self.block_size
    }

    /// Number of block operations that exist at once.  A budget that is not
    /// a whole number of blocks is rounded down.
    pub fn op_count(&self) -> usize {
        (self.buffer_budget / self.block_size) as usize
    }
}
