// Copyright 2026 Oxide Computer Company
//! Phase drivers for the reactor engine.
//!
//! One phase is a closed loop over a fixed set of block operations:
//!
//! ```text
//!   driver --prep--> fill pool --filled--> reactor --reaped--> check pool
//!     ^                                                            |
//!     +---------------------------verified-------------------------+
//! ```
//!
//! The driving thread hands out offsets in ascending order and recycles each
//! verified operation to the next uncovered block until the extent is done.
//! Every link can hold every operation, so no stage ever waits on another
//! stage that is itself waiting.
use anyhow::{anyhow, bail, Result};
use slog::{info, o, Logger};

use crate::block_op::{BlockOp, Filled, Kind, Prepped, Submitted, Verified};
use crate::channel::{self, Sender};
use crate::config::{Engine, RunParams};
use crate::engine;
use crate::findings::Findings;
use crate::progress::{Progress, Throughput};
use crate::reactor::{IoStats, Reactor};
use crate::target::Target;
use crate::worker::WorkerPool;

/// Outcome of one phase over the extent
#[derive(Debug)]
pub struct PhaseReport {
    pub kind: Kind,
    pub blocks: u64,
    pub throughput: Throughput,
    pub io: IoStats,
    pub findings: Findings,
}

/// Both phases of a run
#[derive(Debug)]
pub struct RunReport {
    pub write: PhaseReport,
    pub read: PhaseReport,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.write.findings.is_clean() && self.read.findings.is_clean()
    }
}

pub fn phase_label(kind: Kind) -> &'static str {
    match kind {
        Kind::Write => "write",
        Kind::Read => "read",
    }
}

/// Writes the pattern over the whole extent, then reads it all back and
/// verifies it, using the engine `params` selects.
pub fn run(
    target: &Target,
    params: &RunParams,
    log: &Logger,
) -> Result<RunReport> {
    let write = run_phase(target, Kind::Write, params, log)?;
    let read = run_phase(target, Kind::Read, params, log)?;
    Ok(RunReport { write, read })
}

pub fn run_phase(
    target: &Target,
    kind: Kind,
    params: &RunParams,
    log: &Logger,
) -> Result<PhaseReport> {
    let label = phase_label(kind);
    let log = log.new(o!(
        "phase" => label,
        "engine" => params.engine.to_string(),
    ));
    info!(
        log,
        "{} phase: {} blocks of {} bytes, {} buffers, queue depth {}",
        label,
        params.geometry.block_count(),
        params.geometry.block_size(),
        params.geometry.op_count(),
        params.geometry.queue_depth(),
    );

    let report = match params.engine {
        Engine::Reactor => reactor_phase(target, kind, params, &log)?,
        Engine::Queued => engine::queued_phase(target, kind, params, &log)?,
    };

    let g = &params.geometry;
    if report.blocks != g.block_count() {
        bail!(
            "{} phase covered {} of {} blocks",
            label,
            report.blocks,
            g.block_count()
        );
    }
    Ok(report)
}

/*
 * Hand out ascending offsets until the extent is covered.
 */
pub(crate) struct Cursor {
    next: u64,
    block_size: u64,
    extent: u64,
}

impl Cursor {
    pub(crate) fn new(params: &RunParams) -> Cursor {
        Cursor {
            next: 0,
            block_size: params.geometry.block_size(),
            extent: params.geometry.extent(),
        }
    }
}

impl Iterator for Cursor {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.next >= self.extent {
            return None;
        }
        let o = self.next;
        self.next += self.block_size;
        Some(o)
    }
}

fn forward(
    tx: &Sender<BlockOp<Prepped>>,
    op: BlockOp<Prepped>,
) -> Result<()> {
    tx.send(op).map_err(|closed| {
        // Nothing downstream can take it; the pool is gone.
        std::mem::forget(closed.into_inner());
        anyhow!("fill pool exited early")
    })
}

fn reactor_phase(
    target: &Target,
    kind: Kind,
    params: &RunParams,
    log: &Logger,
) -> Result<PhaseReport> {
    let g = &params.geometry;
    let block_size = g.block_size();
    let ops = g.op_count();

    let (prep_tx, prep_rx) = channel::bounded::<BlockOp<Prepped>>(ops)?;
    let (filled_tx, filled_rx) = channel::bounded::<BlockOp<Filled>>(ops)?;
    let (reaped_tx, reaped_rx) = channel::bounded::<BlockOp<Submitted>>(ops)?;
    let (verified_tx, verified_rx) = channel::bounded::<Verified>(ops)?;

    let workers = params.workers;
    let fill = WorkerPool::spawn("fill", workers, prep_rx, filled_tx, log)?;
    let reactor = Reactor::spawn(g.queue_depth(), filled_rx, reaped_tx, log)?;
    let check =
        WorkerPool::spawn("check", workers, reaped_rx, verified_tx, log)?;

    let mut progress = Progress::new(phase_label(kind), g.extent(), log);
    let mut findings = Findings::new();
    let mut cursor = Cursor::new(params);
    let mut blocks = 0;

    let mut live = 0;
    for offset in cursor.by_ref().take(ops) {
        let op = BlockOp::new(target, kind, block_size as usize);
        forward(&prep_tx, op.offset(offset))?;
        live += 1;
    }

    // Dropped once the last operation retires, which starts the shutdown.
    let mut prep_tx = Some(prep_tx);
    while let Some(v) = verified_rx.recv() {
        findings.record(&v.mismatches, log);
        progress.add(block_size);
        blocks += 1;

        match (cursor.next(), prep_tx.as_ref()) {
            (Some(offset), Some(tx)) => forward(tx, v.op.offset(offset))?,
            _ => {
                drop(v.op);
                live -= 1;
                if live == 0 {
                    prep_tx = None;
                }
            }
        }
    }

    fill.join();
    let io = reactor.join();
    check.join();

    Ok(PhaseReport {
        kind,
        blocks,
        throughput: progress.finish(),
        io,
        findings,
    })
}
