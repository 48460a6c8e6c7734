// Copyright 2026 Oxide Computer Company
//! Threads that do the CPU side of a block operation off the I/O thread.
//!
//! A worker pulls one item from its source, applies the one transition that
//! item's state allows, and passes the result on.  Which transition runs is
//! decided by the item's type, so a fill pool and a check pool are the same
//! code over different element types.
use std::thread::{self, JoinHandle};

use slog::{crit, debug, o, Logger};

use crate::block_op::{BlockOp, Filled, Prepped, Submitted, Verified};
use crate::transport::{Sink, Source};

/// The CPU-bound step a worker performs on an item
pub trait Transition: Send + 'static {
    type Output: Send + 'static;

    fn advance(self) -> Self::Output;
}

impl Transition for BlockOp<Prepped> {
    type Output = BlockOp<Filled>;

    fn advance(self) -> BlockOp<Filled> {
        self.fill()
    }
}

impl Transition for BlockOp<Submitted> {
    type Output = Verified;

    fn advance(self) -> Verified {
        self.check()
    }
}

/// A fixed set of interchangeable worker threads sharing one source and one
/// sink.  The sink closes once every worker has seen end-of-stream.
pub struct WorkerPool {
    name: &'static str,
    handles: Vec<JoinHandle<usize>>,
    log: Logger,
}

impl WorkerPool {
    /// Starts `count` workers.  Each gets a clone of `source` and `sink`;
    /// the originals are dropped here, so the pool holds the only handles.
    pub fn spawn<T, S, K>(
        name: &'static str,
        count: usize,
        source: S,
        sink: K,
        log: &Logger,
    ) -> std::io::Result<WorkerPool>
    where
        T: Transition,
        S: Source<T> + Clone + 'static,
        K: Sink<T::Output> + Clone + 'static,
    {
        assert!(count > 0, "worker pool needs at least one thread");
        let log = log.new(o!("pool" => name));
        let mut handles = Vec::with_capacity(count);
        for id in 0..count {
            let source = source.clone();
            let sink = sink.clone();
            let log = log.new(o!("worker" => id));
            let h = thread::Builder::new()
                .name(format!("{name}-{id}"))
                .spawn(move || run(source, sink, log))?;
            handles.push(h);
        }
        Ok(WorkerPool { name, handles, log })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every worker and returns how many items they moved in
    /// total.  A worker that panicked takes the caller down with it.
    pub fn join(self) -> usize {
        let mut total = 0;
        for h in self.handles {
            match h.join() {
                Ok(n) => total += n,
                Err(e) => std::panic::resume_unwind(e),
            }
        }
        debug!(self.log, "{} pool done", self.name; "items" => total);
        total
    }
}

fn run<T, S, K>(source: S, sink: K, log: Logger) -> usize
where
    T: Transition,
    S: Source<T>,
    K: Sink<T::Output>,
{
    let mut moved = 0;
    while let Some(item) = source.recv() {
        if let Err(closed) = sink.send(item.advance()) {
            // Our output is an owned operation with nowhere to go.
            std::mem::forget(closed.into_inner());
            crit!(log, "downstream closed with work in hand");
            panic!("worker sink closed under it");
        }
        moved += 1;
    }
    debug!(log, "end of stream"; "items" => moved);
    moved
    // source and sink drop here; the last worker out closes the sink
}
