// Copyright 2026 Oxide Computer Company
//! The I/O thread.
//!
//! The reactor owns one [`AioContext`] and nothing else touches it.  Filled
//! operations come in on a channel, go to the kernel, and leave on another
//! channel once their completion has been reaped.  The kernel bumps an
//! eventfd for every completion, so a single `poll(2)` covers both "there is
//! new work" and "something finished".
//!
//! Admission control: the inbound channel is only polled while the kernel
//! queue has room.  Once it is full the reactor waits for completions alone,
//! and it never blocks on submission while completions are waiting.
use std::collections::HashMap;
use std::os::fd::AsFd;
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use slog::{crit, debug, info, o, Logger};

use crate::block_op::{BlockOp, Filled, Submitted};
use crate::channel::{Receiver, Sender};
use crate::context::{AioContext, AioError, Completion};

/// Kernel queue usage over one phase
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IoStats {
    pub submitted: u64,
    pub completed: u64,
    /// Most operations ever in the kernel at once
    pub max_pending: usize,
}

pub struct Reactor {
    handle: JoinHandle<IoStats>,
}

impl Reactor {
    /// Sets up the kernel queue and the completion eventfd, then starts the
    /// I/O thread.  The reactor runs until `inbound` is closed and every
    /// operation it submitted has been forwarded to `outbound`; it then drops
    /// `outbound`, which is how downstream learns the phase is over.
    pub fn spawn(
        capacity: usize,
        inbound: Receiver<BlockOp<Filled>>,
        outbound: Sender<BlockOp<Submitted>>,
        log: &Logger,
    ) -> Result<Reactor, AioError> {
        let log = log.new(o!("component" => "reactor"));
        let ctx = AioContext::open(capacity, log.clone())?;
        let efd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC)
            .map_err(AioError::Notify)?;

        let inner = Inner {
            ctx,
            efd,
            inbound,
            outbound,
            inflight: HashMap::with_capacity(capacity),
            stats: IoStats::default(),
            log,
        };
        let handle = thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || inner.run())
            .map_err(|e| {
                AioError::Notify(Errno::from_raw(
                    e.raw_os_error().unwrap_or(libc::EAGAIN),
                ))
            })?;
        Ok(Reactor { handle })
    }

    /// Waits for the I/O thread.  A fatal error on that thread is re-raised
    /// here.
    pub fn join(self) -> IoStats {
        match self.handle.join() {
            Ok(stats) => stats,
            Err(e) => std::panic::resume_unwind(e),
        }
    }
}

struct Inner {
    ctx: AioContext,
    efd: EventFd,
    inbound: Receiver<BlockOp<Filled>>,
    outbound: Sender<BlockOp<Submitted>>,
    /*
     * Everything the kernel holds, by completion key.  Keeping the
     * operations here (and not on some other thread) is what guarantees their
     * buffers outlive the kernel's use of them.
     */
    inflight: HashMap<u64, BlockOp<Submitted>>,
    stats: IoStats,
    log: Logger,
}

impl Inner {
    fn run(mut self) -> IoStats {
        let mut inbound_open = true;

        while inbound_open || self.ctx.pending() > 0 {
            let want_work = inbound_open && self.ctx.available() > 0;
            let (work_ready, done_ready) = self.wait(want_work);

            if work_ready {
                match self.inbound.recv() {
                    Some(op) => self.submit(op),
                    None => {
                        debug!(self.log, "inbound closed";
                            "pending" => self.ctx.pending());
                        inbound_open = false;
                    }
                }
            }
            if done_ready {
                self.reap();
            }
        }

        // Dropping outbound on the way out closes the channel downstream.
        let Inner {
            ctx, stats, log, ..
        } = self;
        if let Err(e) = ctx.close() {
            crit!(log, "closing aio context: {}", e);
            panic!("reactor: closing aio context: {e}");
        }
        info!(
            log,
            "reactor done";
            "submitted" => stats.submitted,
            "completed" => stats.completed,
            "max_pending" => stats.max_pending,
        );
        stats
    }

    /*
     * Block until the inbound channel (when we are taking work) or the
     * completion eventfd is readable.  Returns (work, completions).
     */
    fn wait(&self, want_work: bool) -> (bool, bool) {
        let mut fds = Vec::with_capacity(2);
        fds.push(PollFd::new(self.efd.as_fd(), PollFlags::POLLIN));
        if want_work {
            fds.push(PollFd::new(self.inbound.as_fd(), PollFlags::POLLIN));
        }

        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => self.fatal(format!("poll: {e}")),
            }
        }

        let ready = |fd: &PollFd| {
            fd.revents()
                .is_some_and(|r| r.intersects(PollFlags::POLLIN))
        };
        let done_ready = ready(&fds[0]);
        let work_ready = want_work && ready(&fds[1]);
        (work_ready, done_ready)
    }

    fn submit(&mut self, mut op: BlockOp<Filled>) {
        op.notify_via(self.efd.as_fd());
        let (op, handle) = op.acquire_submission_handle();
        let key = op.key();
        self.inflight.insert(key, op);

        // SAFETY: the operation now lives in inflight until its completion
        // is reaped, and the target is held open by the phase driver.
        let batch = std::slice::from_ref(&handle);
        if let Err(e) = unsafe { self.ctx.submit(batch) } {
            self.fatal(format!("submit: {e}"));
        }

        self.stats.submitted += 1;
        self.stats.max_pending =
            self.stats.max_pending.max(self.ctx.pending());
    }

    fn reap(&mut self) {
        let ready = loop {
            match self.efd.read() {
                Ok(n) => break n as usize,
                Err(Errno::EINTR) => continue,
                Err(e) => self.fatal(format!("completion eventfd read: {e}")),
            }
        };
        if ready == 0 || ready > self.ctx.pending() {
            self.fatal(format!(
                "eventfd reports {} completions with {} pending",
                ready,
                self.ctx.pending()
            ));
        }

        let done: Vec<Completion> = match self.ctx.reap(ready, ready) {
            Ok(done) => done.to_vec(),
            Err(e) => self.fatal(format!("reap: {e}")),
        };
        for c in done {
            let Some(op) = self.inflight.remove(&c.key()) else {
                let key = c.key();
                self.fatal(format!("completion for unknown key {key:#x}"))
            };
            if c.res() != op.expected_res() || c.res2() != 0 {
                let msg = format!(
                    "{:?} at {:#x}: res {} (wanted {}) res2 {}",
                    op.kind(),
                    op.target_offset(),
                    c.res(),
                    op.expected_res(),
                    c.res2()
                );
                // Dropping it here would panic with a less useful message.
                std::mem::forget(op);
                self.fatal(msg);
            }
            self.stats.completed += 1;
            if let Err(closed) = self.outbound.send(op) {
                std::mem::forget(closed.into_inner());
                self.fatal("outbound channel closed".to_string());
            }
        }
    }

    fn fatal(&self, msg: String) -> ! {
        crit!(self.log, "{}", msg; "pending" => self.ctx.pending());
        panic!("reactor: {msg}");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block_op::Kind;
    use crate::channel::bounded;
    use crate::test_util::{csl, scratch_target};

    fn run_ops(
        capacity: usize,
        offsets: &[u64],
        kind: Kind,
    ) -> (IoStats, Vec<u64>) {
        let (_dir, target) = scratch_target(16 * 4096);
        let n = offsets.len().max(1);
        let (in_tx, in_rx) = bounded(n).unwrap();
        let (out_tx, out_rx) = bounded(n).unwrap();
        let reactor = Reactor::spawn(capacity, in_rx, out_tx, &csl()).unwrap();

        for o in offsets {
            let op = BlockOp::new(&target, kind, 4096).offset(*o).fill();
            in_tx.send(op).unwrap();
        }
        drop(in_tx);

        let mut done = Vec::new();
        while let Some(op) = out_rx.recv() {
            done.push(op.target_offset());
            let _ = op.check();
        }
        let stats = reactor.join();
        done.sort_unstable();
        (stats, done)
    }

    #[test]
    fn queue_depth_one_serializes() {
        let (stats, done) = run_ops(1, &[0, 4096], Kind::Write);
        assert_eq!(done, vec![0, 4096]);
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.completed, 2);
        // The second submission waited for the first to be reaped.
        assert_eq!(stats.max_pending, 1);
    }

    #[test]
    fn pending_never_exceeds_capacity() {
        let offsets: Vec<u64> = (0..16).map(|i| i * 4096).collect();
        for capacity in [1, 2, 3, 8] {
            let (stats, done) = run_ops(capacity, &offsets, Kind::Write);
            assert_eq!(done, offsets);
            assert_eq!(stats.completed, 16);
            assert!(stats.max_pending <= capacity);
            assert!(stats.max_pending >= 1);
        }
    }

    #[test]
    fn reads_come_back_too() {
        let offsets: Vec<u64> = (0..4).map(|i| i * 8192).collect();
        let (stats, done) = run_ops(4, &offsets, Kind::Read);
        assert_eq!(done, offsets);
        assert_eq!(stats.completed, 4);
    }

    #[test]
    fn closed_empty_producer_shuts_down() {
        let (stats, done) = run_ops(4, &[], Kind::Write);
        assert!(done.is_empty());
        assert_eq!(stats, IoStats::default());
    }

    #[test]
    fn completed_writes_land_on_disk() {
        use std::os::unix::fs::FileExt;

        let (_dir, target) = scratch_target(4 * 4096);
        let (in_tx, in_rx) = bounded(4).unwrap();
        let (out_tx, out_rx) = bounded(4).unwrap();
        let reactor = Reactor::spawn(2, in_rx, out_tx, &csl()).unwrap();
        for i in 0..4u64 {
            let op = BlockOp::new(&target, Kind::Write, 4096)
                .offset(i * 4096)
                .fill();
            in_tx.send(op).unwrap();
        }
        drop(in_tx);
        while let Some(op) = out_rx.recv() {
            let _ = op.check();
        }
        reactor.join();

        let mut raw = [0u8; 8];
        for off in [0u64, 0x1ff8, 0x3ff8] {
            target.file().read_exact_at(&mut raw, off).unwrap();
            assert_eq!(u64::from_ne_bytes(raw), off);
        }
    }
}
