// Copyright 2026 Oxide Computer Company
use std::fmt;

use byte_unit::Byte;
use devtest_common::{
    devtest_bail, DevtestError, Geometry, DEFAULT_BLOCK_SIZE,
    DEFAULT_QUEUE_DEPTH,
};
use serde::{Deserialize, Deserializer};

/// Which execution engine drives the kernel queue
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Dedicated I/O thread waiting on a completion eventfd
    #[default]
    Reactor,
    /// Driving thread owns the queue; workers share two blocking queues
    Queued,
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Engine::Reactor => write!(f, "reactor"),
            Engine::Queued => write!(f, "queued"),
        }
    }
}

/// Settings from a TOML file or the command line.  Everything is optional;
/// a field left unset anywhere takes its default.
#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DevtestConfig {
    #[serde(default, deserialize_with = "size_opt")]
    pub block_size: Option<u64>,
    pub queue_depth: Option<usize>,
    #[serde(default, deserialize_with = "size_opt")]
    pub buffer_budget: Option<u64>,
    pub workers: Option<usize>,
    pub engine: Option<Engine>,
    /// Open the target with O_DIRECT
    pub direct: Option<bool>,
}

/// A fully resolved and validated run
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RunParams {
    pub geometry: Geometry,
    pub workers: usize,
    pub engine: Engine,
}

pub const DEFAULT_WORKERS: usize = 1;

impl DevtestConfig {
    /// Fields set in `over` win over fields set in `self`.
    pub fn merge(self, over: DevtestConfig) -> DevtestConfig {
        DevtestConfig {
            block_size: over.block_size.or(self.block_size),
            queue_depth: over.queue_depth.or(self.queue_depth),
            buffer_budget: over.buffer_budget.or(self.buffer_budget),
            workers: over.workers.or(self.workers),
            engine: over.engine.or(self.engine),
            direct: over.direct.or(self.direct),
        }
    }

    pub fn direct(&self) -> bool {
        self.direct.unwrap_or(true)
    }

    /// Fills in defaults and checks the result against a target of
    /// `target_len` bytes.
    pub fn resolve(&self, target_len: u64) -> Result<RunParams, DevtestError> {
        let workers = self.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            devtest_bail!(InvalidConfig, "need at least one worker");
        }

        let block_size = self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE);
        if let Some(budget) = self.buffer_budget {
            if block_size != 0 && budget % block_size != 0 {
                devtest_bail!(
                    InvalidConfig,
                    "buffer budget {} is not a whole number of {} byte blocks",
                    budget,
                    block_size
                );
            }
        }

        let geometry = Geometry::new(
            block_size,
            self.queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH),
            self.buffer_budget,
            target_len,
        )?;
        Ok(RunParams {
            geometry,
            workers,
            engine: self.engine.unwrap_or_default(),
        })
    }
}

/// Parses a byte count such as `4096`, `128KiB` or `1MiB`.
pub fn parse_size(s: &str) -> Result<u64, String> {
    Byte::parse_str(s.trim(), true)
        .map(|b| b.as_u64())
        .map_err(|e| format!("bad size {:?}: {}", s, e))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSize {
    Bytes(u64),
    Text(String),
}

fn size_opt<'de, D>(d: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawSize>::deserialize(d)? {
        None => Ok(None),
        Some(RawSize::Bytes(n)) => Ok(Some(n)),
        Some(RawSize::Text(s)) => {
            parse_size(&s).map(Some).map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sizes_take_units() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("128KiB"), Ok(128 * 1024));
        assert_eq!(parse_size("2MiB"), Ok(2 << 20));
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn defaults_resolve() {
        let p = DevtestConfig::default().resolve(1 << 30).unwrap();
        assert_eq!(p.geometry.block_size(), 4096);
        assert_eq!(p.geometry.queue_depth(), 16);
        assert_eq!(p.geometry.buffer_budget(), 4096 * 16);
        assert_eq!(p.workers, 1);
        assert_eq!(p.engine, Engine::Reactor);
        assert!(DevtestConfig::default().direct());
    }

    #[test]
    fn toml_file_parses() {
        let c: DevtestConfig = toml::from_str(
            r#"
            block_size = "8KiB"
            queue_depth = 4
            buffer_budget = 65536
            workers = 2
            engine = "queued"
            direct = false
            "#,
        )
        .unwrap();
        assert_eq!(
            c,
            DevtestConfig {
                block_size: Some(8192),
                queue_depth: Some(4),
                buffer_budget: Some(65536),
                workers: Some(2),
                engine: Some(Engine::Queued),
                direct: Some(false),
            }
        );
        let p = c.resolve(1 << 20).unwrap();
        assert_eq!(p.geometry.op_count(), 8);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let r: Result<DevtestConfig, _> = toml::from_str("blocksize = 4096");
        assert!(r.is_err());
    }

    #[test]
    fn command_line_wins() {
        let file = DevtestConfig {
            block_size: Some(8192),
            workers: Some(4),
            direct: Some(false),
            ..Default::default()
        };
        let cli = DevtestConfig {
            workers: Some(2),
            engine: Some(Engine::Queued),
            ..Default::default()
        };
        let c = file.merge(cli);
        assert_eq!(c.block_size, Some(8192));
        assert_eq!(c.workers, Some(2));
        assert_eq!(c.engine, Some(Engine::Queued));
        assert!(!c.direct());
    }

    #[test]
    fn bad_settings_are_refused() {
        let zero_workers = DevtestConfig {
            workers: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            zero_workers.resolve(1 << 20),
            Err(DevtestError::InvalidConfig(_))
        ));

        let ragged_budget = DevtestConfig {
            buffer_budget: Some(4096 * 16 + 512),
            ..Default::default()
        };
        assert!(matches!(
            ragged_budget.resolve(1 << 20),
            Err(DevtestError::InvalidConfig(_))
        ));

        let huge_budget = DevtestConfig {
            buffer_budget: Some(4 << 20),
            ..Default::default()
        };
        assert!(matches!(
            huge_budget.resolve(1 << 20),
            Err(DevtestError::BufferBudgetTooLarge { .. })
        ));
    }
}
