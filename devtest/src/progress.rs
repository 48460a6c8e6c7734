// Copyright 2026 Oxide Computer Company
//! Throughput reporting for one phase.
use std::fmt;
use std::time::{Duration, Instant};

use slog::{info, Logger};

const MIB: f64 = (1u64 << 20) as f64;

pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Counts completed bytes and logs a line about once per interval.
pub struct Progress {
    label: &'static str,
    total: u64,
    done: u64,
    start: Instant,
    last: Instant,
    last_done: u64,
    interval: Duration,
    samples: Vec<f64>,
    log: Logger,
}

/// Bandwidth samples in MiB/s
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BandwidthSummary {
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
}

/// How a phase went, timing-wise
#[derive(Clone, Debug, PartialEq)]
pub struct Throughput {
    pub bytes: u64,
    pub elapsed: Duration,
    /// None when the phase finished inside one reporting interval
    pub samples: Option<BandwidthSummary>,
}

impl Throughput {
    /// Average MiB/s over the whole phase
    pub fn mib_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes as f64 / MIB / secs
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1} MiB in {:.3}s [ {:.1} MiB/s ]",
            self.bytes as f64 / MIB,
            self.elapsed.as_secs_f64(),
            self.mib_per_sec()
        )?;
        if let Some(s) = &self.samples {
            write!(
                f,
                " mean {:.1} stddev {:.1} min {:.1} max {:.1}",
                s.mean, s.stddev, s.min, s.max
            )?;
        }
        Ok(())
    }
}

impl Progress {
    pub fn new(label: &'static str, total: u64, log: &Logger) -> Progress {
        Progress::with_interval(label, total, REPORT_INTERVAL, log)
    }

    pub fn with_interval(
        label: &'static str,
        total: u64,
        interval: Duration,
        log: &Logger,
    ) -> Progress {
        let now = Instant::now();
        Progress {
            label,
            total,
            done: 0,
            start: now,
            last: now,
            last_done: 0,
            interval,
            samples: Vec::new(),
            log: log.clone(),
        }
    }

    pub fn done(&self) -> u64 {
        self.done
    }

    /// Counts `bytes` more as finished, reporting if an interval has passed.
    pub fn add(&mut self, bytes: u64) {
        self.done += bytes;
        let now = Instant::now();
        let since = now.duration_since(self.last);
        if since >= self.interval {
            self.report(now, since);
        }
    }

    fn report(&mut self, now: Instant, since: Duration) {
        let rate =
            (self.done - self.last_done) as f64 / MIB / since.as_secs_f64();
        self.samples.push(rate);
        info!(
            self.log,
            "[{:>4}s] {} completed = {:.1} MiB / {:.1} MiB [ {:.1} MiB/s ]",
            now.duration_since(self.start).as_secs(),
            self.label,
            self.done as f64 / MIB,
            self.total as f64 / MIB,
            rate,
        );
        self.last = now;
        self.last_done = self.done;
    }

    /// Ends the phase and logs its summary.
    pub fn finish(self) -> Throughput {
        let elapsed = self.start.elapsed();
        let samples = summarize(&self.samples);
        let t = Throughput {
            bytes: self.done,
            elapsed,
            samples,
        };
        info!(self.log, "{} done: {}", self.label, t);
        t
    }
}

/*
 * Mean and spread of the per-interval rates.  A single sample has no spread.
 */
fn summarize(samples: &[f64]) -> Option<BandwidthSummary> {
    if samples.is_empty() {
        return None;
    }
    let mean = statistical::mean(samples);
    let stddev = if samples.len() > 1 {
        statistical::standard_deviation(samples, Some(mean))
    } else {
        0.0
    };
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| {
        a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
    });
    Some(BandwidthSummary {
        mean,
        stddev,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
    })
}
