// Copyright 2026 Oxide Computer Company
//! Write a verifiable pattern over a block device or file with Linux native
//! asynchronous I/O, then read it all back and check it.
//!
//! Every block operation owns one aligned buffer and moves through a typed
//! lifecycle (see [`block_op`]).  Operations travel between threads only
//! through ownership-transferring conduits, so no two threads ever see the
//! same buffer at once.

pub mod block_op;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod context;
pub mod engine;
pub mod findings;
pub mod pattern;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod reactor;
pub mod target;
pub mod transport;
pub mod worker;

mod sys;

pub use block_op::{BlockOp, Kind};
pub use config::{DevtestConfig, Engine, RunParams};
pub use findings::Findings;
pub use pattern::Mismatch;
pub use pipeline::{run, run_phase, PhaseReport, RunReport};
pub use target::Target;
