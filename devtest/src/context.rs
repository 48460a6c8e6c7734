// Copyright 2026 Oxide Computer Company
//! Kernel asynchronous I/O queue.
//!
//! A thin wrapper over `io_setup`/`io_submit`/`io_getevents`/`io_destroy`
//! that keeps count of how many operations the kernel holds.  It never looks
//! at the data an operation carries.
use libc::{c_long, c_uint};
use nix::errno::Errno;
use slog::{debug, warn, Logger};

use crate::block_op::SubmissionHandle;
use crate::sys;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AioError {
    #[error("io_setup for {capacity} events failed: {errno}")]
    Setup { capacity: usize, errno: Errno },

    #[error("io_submit failed after {accepted} accepted: {errno}")]
    Submit { accepted: usize, errno: Errno },

    #[error("io_submit accepted none of {requested} ({accepted} before)")]
    NoProgress { accepted: usize, requested: usize },

    #[error("io_getevents failed: {0}")]
    GetEvents(Errno),

    #[error("io_destroy failed: {0}")]
    Destroy(Errno),

    #[error("completion eventfd: {0}")]
    Notify(Errno),

    #[error(
        "{requested} more would exceed capacity {capacity} ({pending} pending)"
    )]
    QueueFull {
        requested: usize,
        pending: usize,
        capacity: usize,
    },

    #[error("cannot reap min {min} max {max} with {pending} pending")]
    InvalidReap {
        min: usize,
        max: usize,
        pending: usize,
    },

    #[error("{0} operations still outstanding at close")]
    Outstanding(usize),
}

/// One finished kernel operation
#[derive(Copy, Clone, Debug, Default)]
#[repr(transparent)]
pub struct Completion(sys::io_event);

impl Completion {
    /// The key of the block operation this completion belongs to
    pub fn key(&self) -> u64 {
        self.0.data
    }

    /// Bytes transferred, or a negated errno
    pub fn res(&self) -> i64 {
        self.0.res
    }

    pub fn res2(&self) -> i64 {
        self.0.res2
    }
}

pub struct AioContext {
    ctx: sys::aio_context_t,
    capacity: usize,
    pending: usize,
    events: Vec<Completion>,
    // Set once the kernel queue must not be destroyed by Drop.
    released: bool,
    log: Logger,
}

impl std::fmt::Debug for AioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AioContext")
            .field("ctx", &self.ctx)
            .field("capacity", &self.capacity)
            .field("pending", &self.pending)
            .finish()
    }
}

impl AioContext {
    /// Sets up a kernel queue that can hold `capacity` operations at once.
    pub fn open(capacity: usize, log: Logger) -> Result<AioContext, AioError> {
        let mut ctx: sys::aio_context_t = 0;
        let setup_err = |errno| AioError::Setup { capacity, errno };
        if capacity == 0 {
            return Err(setup_err(Errno::EINVAL));
        }
        let nr = c_uint::try_from(capacity)
            .map_err(|_| setup_err(Errno::EINVAL))?;

        // SAFETY: ctx is a valid out pointer and starts at zero as required.
        let r = unsafe { sys::io_setup(nr, &mut ctx) };
        if r < 0 {
            return Err(setup_err(Errno::last()));
        }
        debug!(log, "aio context up"; "capacity" => capacity);

        Ok(AioContext {
            ctx,
            capacity,
            pending: 0,
            events: vec![Completion::default(); capacity],
            released: false,
            log,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Operations submitted and not yet reaped
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Room left before the kernel queue is full
    pub fn available(&self) -> usize {
        self.capacity - self.pending
    }

    /// Hands every operation in `batch` to the kernel.
    ///
    /// A short submission is retried with whatever the kernel did not take.
    /// On error, the first `accepted` handles of `batch` are in the kernel
    /// and count as pending; the rest are not.
    ///
    /// # Safety
    /// Each handle must come from a [`BlockOp<Submitted>`] that stays alive
    /// and unchecked until its completion has been reaped, and the target
    /// descriptor it names must stay open until then.
    ///
    /// [`BlockOp<Submitted>`]: crate::block_op::BlockOp
    pub unsafe fn submit(
        &mut self,
        batch: &[SubmissionHandle],
    ) -> Result<(), AioError> {
        if batch.is_empty() {
            return Ok(());
        }
        if batch.len() > self.available() {
            return Err(AioError::QueueFull {
                requested: batch.len(),
                pending: self.pending,
                capacity: self.capacity,
            });
        }

        let mut accepted = 0;
        while accepted < batch.len() {
            let rest = &batch[accepted..];
            // SubmissionHandle is a transparent *mut iocb, so the slice is
            // exactly the iocb pointer array the kernel wants.
            let r = sys::io_submit(
                self.ctx,
                rest.len() as c_long,
                rest.as_ptr() as *mut *mut sys::iocb,
            );
            if r < 0 {
                match Errno::last() {
                    Errno::EINTR => continue,
                    errno => return Err(AioError::Submit { accepted, errno }),
                }
            }
            if r == 0 {
                return Err(AioError::NoProgress {
                    accepted,
                    requested: rest.len(),
                });
            }

            let took = r as usize;
            self.pending += took;
            accepted += took;
            if accepted < batch.len() {
                warn!(
                    self.log,
                    "short submit";
                    "accepted" => took,
                    "requested" => rest.len(),
                );
            }
        }
        Ok(())
    }

    /// Waits for at least `min` and at most `max` completions.
    ///
    /// `max` must be non-zero and no more than what is pending.
    pub fn reap(
        &mut self,
        min: usize,
        max: usize,
    ) -> Result<&[Completion], AioError> {
        if max == 0 || min > max || max > self.pending {
            return Err(AioError::InvalidReap {
                min,
                max,
                pending: self.pending,
            });
        }

        let got = loop {
            // SAFETY: events has room for capacity >= max records, and
            // Completion is a transparent io_event.
            let r = unsafe {
                sys::io_getevents(
                    self.ctx,
                    min as c_long,
                    max as c_long,
                    self.events.as_mut_ptr() as *mut sys::io_event,
                    std::ptr::null_mut(),
                )
            };
            if r < 0 {
                match Errno::last() {
                    Errno::EINTR => continue,
                    errno => return Err(AioError::GetEvents(errno)),
                }
            }
            break r as usize;
        };

        self.pending -= got;
        Ok(&self.events[..got])
    }

    /// Tears down the kernel queue.  Every submitted operation must have
    /// been reaped; otherwise the queue is abandoned, not destroyed, and
    /// `Outstanding` is returned.
    pub fn close(mut self) -> Result<(), AioError> {
        self.released = true;
        if self.pending > 0 {
            return Err(AioError::Outstanding(self.pending));
        }
        // SAFETY: ctx came from io_setup and nothing is in flight.
        let r = unsafe { sys::io_destroy(self.ctx) };
        if r < 0 {
            return Err(AioError::Destroy(Errno::last()));
        }
        debug!(self.log, "aio context closed");
        Ok(())
    }
}

impl Drop for AioContext {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.pending > 0 {
            let pending = self.pending;
            warn!(self.log, "abandoning aio context"; "pending" => pending);
            return;
        }
        // SAFETY: as in close().
        if unsafe { sys::io_destroy(self.ctx) } < 0 {
            warn!(self.log, "io_destroy failed: {}", Errno::last());
        }
    }
}
