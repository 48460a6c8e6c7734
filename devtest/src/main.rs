// Copyright 2026 Oxide Computer Company
use std::path::PathBuf;

use anyhow::{bail, Result};
use byte_unit::{Byte, UnitType};
use clap::Parser;
use slog::{error, info, Logger};

use devtest::config::parse_size;
use devtest::{run, DevtestConfig, Engine, PhaseReport, RunParams, Target};
use devtest_common::{build_logger_with_level, read_toml, version_banner};

#[derive(Debug, Parser)]
#[clap(name = "devtest", term_width = 80)]
#[clap(
    about = "Write a pattern over a device, then read it back and verify it",
    long_about = None
)]
pub struct Opt {
    /// Block device or file to test.  Its contents are destroyed.
    #[clap(action)]
    target: PathBuf,

    /// Bytes per I/O, a multiple of 4096 [default: 4096]
    #[clap(short, long, value_parser = parse_size, action)]
    blocksize: Option<u64>,

    /// Requests kept in the kernel at once [default: 16]
    #[clap(short, long, action)]
    requests: Option<usize>,

    /// Buffer memory [default: blocksize * requests]
    #[clap(short, long, value_parser = parse_size, action)]
    memory: Option<u64>,

    /// Threads for pattern fill and verify, per pool [default: 1]
    #[clap(short, long, action)]
    workers: Option<usize>,

    /// TOML file with any of the above; flags win over the file
    #[clap(long, action)]
    config: Option<PathBuf>,

    /// Execution engine [default: reactor]
    #[clap(long, value_enum, action)]
    engine: Option<Engine>,

    /// Open the target without O_DIRECT (for tmpfs and the like)
    #[clap(long, action)]
    no_direct: bool,

    #[clap(long, default_value = "info", value_parser = parse_level)]
    log_level: slog::Level,
}

fn parse_level(s: &str) -> Result<slog::Level, String> {
    s.parse().map_err(|_| format!("unknown log level {:?}", s))
}

fn human(n: u64) -> String {
    format!(
        "{:.2}",
        Byte::from_u64(n).get_appropriate_unit(UnitType::Binary)
    )
}

fn show_config(log: &Logger, target: &Target, params: &RunParams) {
    let g = &params.geometry;
    info!(
        log,
        "target {:?}: {} ({} usable), direct I/O {}",
        target.path(),
        human(target.len()),
        human(g.extent()),
        if target.is_direct() { "on" } else { "off" },
    );
    info!(
        log,
        "block size {}, queue depth {}, buffers {} ({}), {} worker(s), \
         {} engine",
        human(g.block_size()),
        g.queue_depth(),
        g.op_count(),
        human(g.buffer_budget()),
        params.workers,
        params.engine,
    );
}

fn show_phase(log: &Logger, report: &PhaseReport) {
    info!(
        log,
        "{:?}: {} blocks, {}",
        report.kind,
        report.blocks,
        report.throughput;
        "max_pending" => report.io.max_pending,
    );
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    let log = build_logger_with_level(opt.log_level);
    info!(log, "{}", version_banner("devtest"));

    let cli = DevtestConfig {
        block_size: opt.blocksize,
        queue_depth: opt.requests,
        buffer_budget: opt.memory,
        workers: opt.workers,
        engine: opt.engine,
        direct: opt.no_direct.then_some(false),
    };
    let config = match &opt.config {
        Some(path) => read_toml::<_, DevtestConfig>(path)?.merge(cli),
        None => cli,
    };

    let target = Target::open(&opt.target, config.direct())?;
    let params = config.resolve(target.len())?;
    show_config(&log, &target, &params);

    let report = run(&target, &params, &log)?;
    show_phase(&log, &report.write);
    show_phase(&log, &report.read);

    let findings = &report.read.findings;
    if !findings.is_clean() {
        for m in findings.retained() {
            error!(log, "{}", m);
        }
        bail!(
            "{} corrupt words in {} of {} blocks",
            findings.count(),
            findings.blocks(),
            report.read.blocks
        );
    }
    info!(log, "all {} blocks verified", report.read.blocks);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Opt::command().debug_assert();
    }

    #[test]
    fn short_flags_and_units() {
        let opt = Opt::try_parse_from([
            "devtest", "-b", "8KiB", "-r", "32", "-m", "1MiB", "-w", "4",
            "--engine", "queued", "--no-direct", "/dev/null",
        ])
        .unwrap();
        assert_eq!(opt.blocksize, Some(8192));
        assert_eq!(opt.requests, Some(32));
        assert_eq!(opt.memory, Some(1 << 20));
        assert_eq!(opt.workers, Some(4));
        assert_eq!(opt.engine, Some(Engine::Queued));
        assert!(opt.no_direct);
        assert_eq!(opt.log_level, slog::Level::Info);
        assert_eq!(opt.target, PathBuf::from("/dev/null"));
    }

    #[test]
    fn bad_size_is_a_usage_error() {
        assert!(Opt::try_parse_from(["devtest", "-b", "big", "/dev/null"])
            .is_err());
        assert!(Opt::try_parse_from(["devtest"]).is_err());
    }
}
