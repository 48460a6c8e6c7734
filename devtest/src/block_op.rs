// Copyright 2026 Oxide Computer Company
//! Block operations: one aligned buffer bound to one pending read or write.
//!
//! The lifecycle is carried in the type.  Each transition consumes the
//! operation in its source state and hands back the same allocation tagged
//! with the successor state:
//!
//! ```text
//!   BlockOp<Blank> --offset--> BlockOp<Prepped> --fill--> BlockOp<Filled>
//!        ^                                                      |
//!        |                                     acquire_submission_handle
//!        |                                                      v
//!        +----------------------check------------------- BlockOp<Submitted>
//! ```
//!
//! Calling a transition from the wrong state does not compile:
//!
//! ```compile_fail
//! use devtest::block_op::{BlockOp, Kind};
//! let f = std::fs::File::open("/dev/null").unwrap();
//! let op = BlockOp::new(&f, Kind::Write, 4096);
//! // A blank operation has no target offset to derive a pattern from.
//! let op = op.fill();
//! ```
//!
//! ```compile_fail
//! use devtest::block_op::{BlockOp, Kind};
//! let f = std::fs::File::open("/dev/null").unwrap();
//! let op = BlockOp::new(&f, Kind::Read, 4096).offset(0).fill();
//! // Nothing has been read yet.
//! let verified = op.check();
//! ```
//!
//! ```compile_fail
//! use devtest::block_op::{BlockOp, Kind};
//! let f = std::fs::File::open("/dev/null").unwrap();
//! let op = BlockOp::new(&f, Kind::Write, 4096).offset(0);
//! // Already aimed somewhere; only a checked operation can be retargeted.
//! let op = op.offset(4096);
//! ```
//!
//! ```compile_fail
//! use devtest::block_op::{BlockOp, Kind};
//! let f = std::fs::File::open("/dev/null").unwrap();
//! let op = BlockOp::new(&f, Kind::Write, 4096).offset(0);
//! // The pattern has not been laid down yet.
//! let (op, handle) = op.acquire_submission_handle();
//! ```
//!
//! An operation can be handed to the kernel only once per trip around the
//! lifecycle, since acquiring the handle consumes the filled operation:
//!
//! ```compile_fail
//! use devtest::block_op::{BlockOp, Kind};
//! let f = std::fs::File::open("/dev/null").unwrap();
//! let op = BlockOp::new(&f, Kind::Write, 4096).offset(0).fill();
//! let (submitted, first) = op.acquire_submission_handle();
//! let (again, second) = op.acquire_submission_handle();
//! ```
//!
//! A submission handle gives no way back to the operation's memory, so it
//! cannot be used to look at an operation that has been checked and freed:
//!
//! ```compile_fail
//! use devtest::block_op::{BlockOp, Kind};
//! let f = std::fs::File::open("/dev/null").unwrap();
//! let op = BlockOp::new(&f, Kind::Write, 4096).offset(0).fill();
//! let (op, handle) = op.acquire_submission_handle();
//! drop(op.check());
//! let key = handle.key();
//! ```
//!
//! An operation is not `Clone`, so the only way to share one between threads
//! is to move it.  Dropping an operation anywhere but `Blank` is a fatal
//! invariant violation.
use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use devtest_common::{BLOCK_ALIGN, WORD_SIZE};

use crate::buffer::AlignedBuf;
use crate::pattern::{self, Mismatch};
use crate::sys;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Read,
    Write,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Blank,
    Prepped,
    Filled,
    Submitted,
}

mod sealed {
    pub trait Sealed {}
}

/// Type-level lifecycle state of a [`BlockOp`]
pub trait OpState: sealed::Sealed + Send + 'static {
    const STATE: State;
}

macro_rules! op_state {
    ($name:ident) => {
        #[derive(Debug)]
        pub enum $name {}
        impl sealed::Sealed for $name {}
        impl OpState for $name {
            const STATE: State = State::$name;
        }
    };
}

op_state!(Blank);
op_state!(Prepped);
op_state!(Filled);
op_state!(Submitted);

/*
 * Everything the kernel can see lives here.  It is boxed so that the iocb has
 * a stable address while it sits in the kernel queue, and that address doubles
 * as the key that the completion record carries back to us in aio_data.
 */
struct Slot {
    iocb: sys::iocb,
    buf: AlignedBuf,
    kind: Kind,
}

pub struct BlockOp<S: OpState> {
    // None only once a transition has moved the slot into its successor.
    slot: Option<Box<Slot>>,
    _state: PhantomData<S>,
}

/// The pointer handed to `io_submit` for one operation.
///
/// It is only meaningful while the [`BlockOp<Submitted>`] it came from is
/// alive and has not been checked; see [`AioContext::submit`].  Nothing
/// outside the crate can read through it.
///
/// [`AioContext::submit`]: crate::context::AioContext::submit
#[derive(Debug)]
#[repr(transparent)]
pub struct SubmissionHandle(*mut sys::iocb);

impl SubmissionHandle {
    pub(crate) fn as_ptr(&self) -> *mut sys::iocb {
        self.0
    }
}

/// A block operation back in `Blank` after `check`, plus whatever the check
/// found wrong with its contents.
#[derive(Debug)]
pub struct Verified {
    pub op: BlockOp<Blank>,
    pub mismatches: Vec<Mismatch>,
}

impl Verified {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

impl<S: OpState> BlockOp<S> {
    fn slot(&self) -> &Slot {
        self.slot
            .as_deref()
            .unwrap_or_else(|| unreachable!("block op used after move"))
    }

    fn slot_mut(&mut self) -> &mut Slot {
        self.slot
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("block op used after move"))
    }

    fn into_state<T: OpState>(mut self) -> BlockOp<T> {
        BlockOp {
            slot: self.slot.take(),
            _state: PhantomData,
        }
    }

    pub fn state(&self) -> State {
        S::STATE
    }

    pub fn kind(&self) -> Kind {
        self.slot().kind
    }

    /// Size of the buffer, and of every I/O this operation performs
    pub fn len(&self) -> usize {
        self.slot().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte offset in the target this operation reads or writes
    pub fn target_offset(&self) -> u64 {
        self.slot().iocb.aio_offset as u64
    }

    /// Key the kernel completion record uses to find this operation
    pub fn key(&self) -> u64 {
        self.slot().iocb.aio_data
    }

    pub fn buffer(&self) -> &[u8] {
        &self.slot().buf
    }
}

impl BlockOp<Blank> {
    /// Allocates an aligned buffer of `size` bytes for I/O against `target`.
    ///
    /// The operation records the raw descriptor, so `target` must stay open
    /// for as long as the operation is submitted.
    ///
    /// # Panics
    /// `size` must be a non-zero multiple of the pattern word size.
    pub fn new<F: AsFd>(target: &F, kind: Kind, size: usize) -> BlockOp<Blank> {
        assert!(size > 0 && size as u64 % WORD_SIZE == 0, "bad size {size}");

        let mut buf = AlignedBuf::new(size, BLOCK_ALIGN as usize);
        let iocb = sys::iocb {
            aio_lio_opcode: match kind {
                Kind::Read => sys::IOCB_CMD_PREAD,
                Kind::Write => sys::IOCB_CMD_PWRITE,
            },
            aio_fildes: target.as_fd().as_raw_fd() as u32,
            aio_buf: buf.as_mut_ptr() as u64,
            aio_nbytes: size as u64,
            ..Default::default()
        };

        let mut slot = Box::new(Slot { iocb, buf, kind });
        slot.iocb.aio_data = &*slot as *const Slot as u64;
        BlockOp {
            slot: Some(slot),
            _state: PhantomData,
        }
    }

    /// Points this operation at byte `offset` of the target.
    pub fn offset(mut self, offset: u64) -> BlockOp<Prepped> {
        assert!(offset <= i64::MAX as u64, "offset {offset:#x} out of range");
        let slot = self.slot_mut();
        slot.iocb.aio_offset = offset as i64;
        slot.iocb.aio_flags = 0;
        slot.iocb.aio_resfd = 0;
        self.into_state()
    }
}

impl BlockOp<Prepped> {
    /// Writes the verification pattern for a WRITE; a READ buffer is left
    /// untouched since the kernel is about to overwrite it.
    pub fn fill(mut self) -> BlockOp<Filled> {
        let slot = self.slot_mut();
        if slot.kind == Kind::Write {
            let offset = slot.iocb.aio_offset as u64;
            pattern::fill(&mut slot.buf, offset);
        }
        self.into_state()
    }
}

impl BlockOp<Filled> {
    /// Asks the kernel to signal `efd` (an eventfd) when this operation
    /// completes.
    pub fn notify_via(&mut self, efd: BorrowedFd<'_>) {
        let iocb = &mut self.slot_mut().iocb;
        iocb.aio_flags |= sys::IOCB_FLAG_RESFD;
        iocb.aio_resfd = efd.as_raw_fd() as u32;
    }

    /// Marks the operation in flight and returns what `io_submit` needs.
    pub fn acquire_submission_handle(
        mut self,
    ) -> (BlockOp<Submitted>, SubmissionHandle) {
        let handle = SubmissionHandle(&mut self.slot_mut().iocb);
        (self.into_state(), handle)
    }
}

impl BlockOp<Submitted> {
    /// Byte count a successful completion must report
    pub fn expected_res(&self) -> i64 {
        self.slot().iocb.aio_nbytes as i64
    }

    /// Verifies a READ buffer against the pattern for its offset and returns
    /// the operation to `Blank`.  For a WRITE this is a no-op transition.
    ///
    /// Mismatches are findings, not failures: the whole buffer is always
    /// scanned and the operation is always recycled.
    pub fn check(self) -> Verified {
        let slot = self.slot();
        let mismatches = match slot.kind {
            Kind::Read => {
                pattern::verify(&slot.buf, slot.iocb.aio_offset as u64)
            }
            Kind::Write => Vec::new(),
        };
        Verified {
            op: self.into_state(),
            mismatches,
        }
    }

    #[cfg(test)]
    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.slot_mut().buf
    }
}

impl<S: OpState> std::fmt::Debug for BlockOp<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.slot.as_deref() {
            Some(slot) => f
                .debug_struct("BlockOp")
                .field("state", &S::STATE)
                .field("kind", &slot.kind)
                .field("offset", &slot.iocb.aio_offset)
                .field("len", &slot.buf.len())
                .finish(),
            None => f.write_str("BlockOp(moved)"),
        }
    }
}

impl<S: OpState> Drop for BlockOp<S> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        if S::STATE == State::Blank {
            return;
        }

        let offset = slot.iocb.aio_offset;
        if S::STATE == State::Submitted {
            // The kernel may still own the buffer; it must never be freed.
            std::mem::forget(slot);
        } else {
            drop(slot);
        }
        if !std::thread::panicking() {
            panic!(
                "block op at offset {:#x} destroyed in state {:?}",
                offset,
                S::STATE
            );
        }
    }
}
