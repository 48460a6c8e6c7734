// Copyright 2026 Oxide Computer Company
//! The queued engine.
//!
//! No I/O thread and no completion eventfd: the driving thread owns the
//! kernel queue itself and reaps with `io_getevents`.  Fill and check work
//! runs on a worker pool fed from one shared work queue, with results coming
//! back on one shared done queue.
//!
//! For a write, operations go driver -> work -> fill pool -> done -> kernel,
//! and completions are recycled by the driver.  For a read, the driver
//! targets operations and submits them itself (there is nothing to fill),
//! and completions go driver -> work -> check pool -> done -> driver.
//!
//! Submission rule: take whatever is ready without blocking, but block for
//! more if nothing is in the kernel and nothing has been gathered yet.
use std::collections::{HashMap, VecDeque};

use anyhow::Result;
use slog::{crit, debug, info, o, Logger};

use crate::block_op::{BlockOp, Filled, Kind, Prepped, Submitted, Verified};
use crate::config::RunParams;
use crate::context::AioContext;
use crate::findings::Findings;
use crate::pipeline::{phase_label, Cursor, PhaseReport};
use crate::progress::Progress;
use crate::queue::{sync_queue, QueueReader, QueueWriter};
use crate::reactor::IoStats;
use crate::target::Target;
use crate::worker::WorkerPool;

pub fn queued_phase(
    target: &Target,
    kind: Kind,
    params: &RunParams,
    log: &Logger,
) -> Result<PhaseReport> {
    let g = &params.geometry;
    let mut phase = Phase {
        target,
        kind,
        block_size: g.block_size(),
        ops: g.op_count(),
        cursor: Cursor::new(params),
        progress: Progress::new(phase_label(kind), g.extent(), log),
        findings: Findings::new(),
        blocks: 0,
        live: 0,
        log: log.clone(),
    };
    let mut kq = KernelQueue::open(g.queue_depth(), log)?;

    match kind {
        Kind::Write => phase.write(&mut kq, params.workers)?,
        Kind::Read => phase.read(&mut kq, params.workers)?,
    }

    let io = kq.close();
    Ok(PhaseReport {
        kind,
        blocks: phase.blocks,
        throughput: phase.progress.finish(),
        io,
        findings: phase.findings,
    })
}

struct Phase<'a> {
    target: &'a Target,
    kind: Kind,
    block_size: u64,
    ops: usize,
    cursor: Cursor,
    progress: Progress,
    findings: Findings,
    blocks: u64,
    // Operations that exist and have not been retired.
    live: usize,
    log: Logger,
}

impl Phase<'_> {
    /*
     * Count a finished block and hand back its operation aimed at the next
     * uncovered offset, or None once the extent is covered and the
     * operation has been retired.
     */
    fn recycle(&mut self, v: Verified) -> Option<BlockOp<Prepped>> {
        self.findings.record(&v.mismatches, &self.log);
        self.progress.add(self.block_size);
        self.blocks += 1;
        match self.cursor.next() {
            Some(offset) => Some(v.op.offset(offset)),
            None => {
                self.live -= 1;
                None
            }
        }
    }

    fn fresh(&mut self) -> Vec<BlockOp<Prepped>> {
        let mut out = Vec::with_capacity(self.ops);
        while out.len() < self.ops {
            let Some(offset) = self.cursor.next() else {
                break;
            };
            let size = self.block_size as usize;
            let op = BlockOp::new(self.target, self.kind, size);
            out.push(op.offset(offset));
        }
        self.live += out.len();
        out
    }

    fn write(&mut self, kq: &mut KernelQueue, workers: usize) -> Result<()> {
        let (work_w, work_r) = sync_queue::<BlockOp<Prepped>>();
        let (done_w, done_r) = sync_queue::<BlockOp<Filled>>();
        let pool =
            WorkerPool::spawn("fill", workers, work_r, done_w, &self.log)?;

        for op in self.fresh() {
            push(&work_w, op, &self.log);
        }
        // Dropped once the last operation retires, which ends the pool.
        let mut work_w = Some(work_w);

        loop {
            let Some(batch) = gather(kq, &done_r) else {
                break;
            };
            kq.submit(batch);
            if kq.pending() == 0 {
                continue;
            }
            for op in kq.reap() {
                match self.recycle(op.check()) {
                    Some(op) => match work_w.as_ref() {
                        Some(w) => push(w, op, &self.log),
                        None => unreachable!("work queue closed early"),
                    },
                    None if self.live == 0 => work_w = None,
                    None => {}
                }
            }
        }

        pool.join();
        Ok(())
    }

    fn read(&mut self, kq: &mut KernelQueue, workers: usize) -> Result<()> {
        let (work_w, work_r) = sync_queue::<BlockOp<Submitted>>();
        let (done_w, done_r) = sync_queue::<Verified>();
        let pool =
            WorkerPool::spawn("check", workers, work_r, done_w, &self.log)?;

        // A read has nothing to fill, so ready operations never leave us.
        let mut ready: VecDeque<BlockOp<Filled>> =
            self.fresh().into_iter().map(|op| op.fill()).collect();
        let mut work_w = Some(work_w);

        'phase: loop {
            /*
             * Collect verified blocks.  Wait for one only when there is
             * nothing else to do.
             */
            loop {
                let idle = kq.pending() == 0 && ready.is_empty();
                let v = if idle {
                    match done_r.pop() {
                        Some(v) => v,
                        None => break 'phase,
                    }
                } else {
                    match done_r.try_pop() {
                        Some(v) => v,
                        None => break,
                    }
                };
                match self.recycle(v) {
                    Some(op) => ready.push_back(op.fill()),
                    None if self.live == 0 => work_w = None,
                    None => {}
                }
            }

            let n = ready.len().min(kq.available());
            kq.submit(ready.drain(..n).collect());
            if kq.pending() == 0 {
                continue;
            }
            for op in kq.reap() {
                match work_w.as_ref() {
                    Some(w) => push(w, op, &self.log),
                    None => unreachable!("work queue closed early"),
                }
            }
        }

        pool.join();
        Ok(())
    }
}

/*
 * Take ready operations for the next submission, up to what the kernel
 * queue has room for.  Blocks only when nothing is pending and nothing has
 * been gathered; returns None when the source is closed and drained at that
 * point, which is the end of the phase.
 */
fn gather(
    kq: &KernelQueue,
    source: &QueueReader<BlockOp<Filled>>,
) -> Option<Vec<BlockOp<Filled>>> {
    let room = kq.available();
    let mut batch = Vec::with_capacity(room);
    while batch.len() < room {
        if kq.pending() == 0 && batch.is_empty() {
            batch.push(source.pop()?);
        } else {
            match source.try_pop() {
                Some(op) => batch.push(op),
                None => break,
            }
        }
    }
    Some(batch)
}

fn push<T>(w: &QueueWriter<T>, item: T, log: &Logger) {
    if let Err(closed) = w.push(item) {
        std::mem::forget(closed.into_inner());
        crit!(log, "worker pool gone with operations outstanding");
        panic!("work queue has no readers");
    }
}

/*
 * The driving thread's kernel queue, with the operations it holds.
 */
struct KernelQueue {
    ctx: AioContext,
    inflight: HashMap<u64, BlockOp<Submitted>>,
    stats: IoStats,
    log: Logger,
}

impl KernelQueue {
    fn open(capacity: usize, log: &Logger) -> Result<KernelQueue> {
        let log = log.new(o!("component" => "kernel-queue"));
        let ctx = AioContext::open(capacity, log.clone())?;
        Ok(KernelQueue {
            ctx,
            inflight: HashMap::with_capacity(capacity),
            stats: IoStats::default(),
            log,
        })
    }

    fn pending(&self) -> usize {
        self.ctx.pending()
    }

    fn available(&self) -> usize {
        self.ctx.available()
    }

    fn submit(&mut self, batch: Vec<BlockOp<Filled>>) {
        if batch.is_empty() {
            return;
        }
        let mut handles = Vec::with_capacity(batch.len());
        for op in batch {
            let (op, handle) = op.acquire_submission_handle();
            self.inflight.insert(op.key(), op);
            handles.push(handle);
        }

        // SAFETY: every operation is held in inflight until reaped.
        if let Err(e) = unsafe { self.ctx.submit(&handles) } {
            self.fatal(format!("submit: {e}"));
        }
        self.stats.submitted += handles.len() as u64;
        self.stats.max_pending = self.stats.max_pending.max(self.pending());
    }

    /*
     * Wait for at least one completion and return the operations for
     * everything that was ready.
     */
    fn reap(&mut self) -> Vec<BlockOp<Submitted>> {
        let max = self.pending();
        let done = match self.ctx.reap(1, max) {
            Ok(done) => done.to_vec(),
            Err(e) => self.fatal(format!("reap: {e}")),
        };

        let mut out = Vec::with_capacity(done.len());
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
                std::mem::forget(op);
                self.fatal(msg);
            }
            out.push(op);
        }
        self.stats.completed += out.len() as u64;
        out
    }

    fn close(self) -> IoStats {
        debug!(self.log, "closing"; "inflight" => self.inflight.len());
        if let Err(e) = self.ctx.close() {
            crit!(self.log, "closing aio context: {}", e);
            panic!("kernel queue: closing aio context: {e}");
        }
        info!(
            self.log,
            "kernel queue done";
            "submitted" => self.stats.submitted,
            "completed" => self.stats.completed,
            "max_pending" => self.stats.max_pending,
        );
        self.stats
    }

    fn fatal(&self, msg: String) -> ! {
        crit!(self.log, "{}", msg; "pending" => self.pending());
        panic!("kernel queue: {msg}");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Engine;
    use crate::pipeline::{run, run_phase};
    use crate::test_util::{csl, run_params, scratch_target};
    use std::os::unix::fs::FileExt;

    #[test]
    fn queued_write_then_read_is_clean() {
        let (_dir, target) = scratch_target(48 * 4096);
        let p = run_params(4096, 4, 8, 2, Engine::Queued, &target);
        let report = run(&target, &p, &csl()).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.write.blocks, 48);
        assert_eq!(report.read.blocks, 48);
        assert_eq!(report.write.io.completed, 48);
        assert_eq!(report.read.io.completed, 48);
        assert!(report.write.io.max_pending <= 4);
        assert!(report.read.io.max_pending <= 4);
    }

    #[test]
    fn queued_read_finds_corruption() {
        let (_dir, target) = scratch_target(16 * 4096);
        let p = run_params(4096, 2, 4, 1, Engine::Queued, &target);
        let log = csl();
        run_phase(&target, Kind::Write, &p, &log).unwrap();

        target
            .file()
            .write_all_at(&0xfeedu64.to_ne_bytes(), 0xb010)
            .unwrap();

        let r = run_phase(&target, Kind::Read, &p, &log).unwrap();
        assert_eq!(r.findings.count(), 1);
        assert_eq!(r.findings.retained()[0].offset, 0xb010);
        assert_eq!(r.findings.retained()[0].found, 0xfeed);
        assert_eq!(r.blocks, 16);
    }

    #[test]
    fn queue_depth_one_never_overlaps() {
        let (_dir, target) = scratch_target(8 * 4096);
        let p = run_params(4096, 1, 3, 1, Engine::Queued, &target);
        let report = run(&target, &p, &csl()).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.write.io.max_pending, 1);
        assert_eq!(report.read.io.max_pending, 1);
    }

    #[test]
    fn engines_agree_on_disk_contents() {
        let (_dir, a) = scratch_target(16 * 8192);
        let (_dir2, b) = scratch_target(16 * 8192);
        let log = csl();
        let pa = run_params(8192, 2, 4, 2, Engine::Reactor, &a);
        let pb = run_params(8192, 2, 4, 2, Engine::Queued, &b);
        run_phase(&a, Kind::Write, &pa, &log).unwrap();
        run_phase(&b, Kind::Write, &pb, &log).unwrap();

        let mut ba = vec![0u8; 16 * 8192];
        let mut bb = vec![0u8; 16 * 8192];
        a.file().read_exact_at(&mut ba, 0).unwrap();
        b.file().read_exact_at(&mut bb, 0).unwrap();
        assert!(ba == bb);
    }

    #[test]
    fn gather_blocks_only_when_idle() {
        let mut kq = KernelQueue::open(4, &csl()).unwrap();
        let (w, r) = sync_queue::<BlockOp<Filled>>();
        drop(w);
        // Idle and the source is closed: the phase is over.
        assert!(gather(&kq, &r).is_none());

        let (w, r) = sync_queue::<BlockOp<Filled>>();
        let f = std::fs::File::open("/dev/null").unwrap();
        for i in 0..6u64 {
            let op = BlockOp::new(&f, Kind::Read, 4096).offset(i * 4096);
            w.push(op.fill()).unwrap();
        }
        // Bounded by what the kernel queue has room for.
        let batch = gather(&kq, &r).unwrap();
        assert_eq!(batch.len(), 4);
        let rest = gather(&kq, &r).unwrap();
        assert_eq!(rest.len(), 2);
        assert!(r.is_empty());

        for op in batch.into_iter().chain(rest) {
            let (op, _) = op.acquire_submission_handle();
            let _ = op.check();
        }
        kq.submit(Vec::new());
        assert_eq!(kq.close(), IoStats::default());
    }
}
