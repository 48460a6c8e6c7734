// Copyright 2026 Oxide Computer Company
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use ErrorKind::NotFound;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use slog::{o, Drain, Logger};

#[derive(thiserror::Error, Debug, PartialEq, Clone)]
pub enum DevtestError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("block size {0} is not a multiple of {1}")]
    BlockSizeUnaligned(u64, u64),

    #[error("buffer budget {budget:#x} < block size * queue depth {needed:#x}")]
    BufferBudgetTooSmall { budget: u64, needed: u64 },

    #[error("too much memory [{budget:#x}] for extent size [{extent:#x}]")]
    BufferBudgetTooLarge { budget: u64, extent: u64 },

    #[error("target of {len} bytes holds no {block_size} byte block")]
    TargetTooSmall { len: u64, block_size: u64 },

    #[error("target {0:?} is empty")]
    TargetEmpty(String),

    #[error("config parse error: {0}")]
    ConfigParse(String),
}

#[macro_export]
macro_rules! devtest_bail {
    ($i:ident) => { return Err($crate::DevtestError::$i) };
    ($i:ident, $str:expr) => {
        return Err($crate::DevtestError::$i($str.to_string()))
    };
    ($i:ident, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::DevtestError::$i(format!($fmt, $($arg)*)))
    };
}

mod geometry;
pub use geometry::*;

/// Version string for banners, including the toolchain it was built with
pub fn version_banner(prog: &str) -> String {
    format!(
        "{} V{} (rustc {}, built {})",
        prog,
        env!("CARGO_PKG_VERSION"),
        option_env!("VERGEN_RUSTC_SEMVER").unwrap_or("unknown"),
        option_env!("VERGEN_BUILD_DATE").unwrap_or("unknown"),
    )
}

/// Terminal output when stderr is a tty, bunyan JSON otherwise.  Both go
/// through an async drain so the I/O threads never block on logging.
pub fn build_logger_with_level(level: slog::Level) -> Logger {
    if atty::is(atty::Stream::Stderr) {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let drain = slog_term::FullFormat::new(decorator)
            .build()
            .filter_level(level)
            .fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain, o!())
    } else {
        let drain = slog_bunyan::with_name("devtest", std::io::stderr())
            .build()
            .filter_level(level)
            .fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain, o!())
    }
}

pub fn read_toml_maybe<P, T>(file: P) -> Result<Option<T>>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    let mut f = match File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == NotFound => return Ok(None),
        Err(e) => bail!("open {:?}: {:?}", file, e),
    };
    let mut buf = String::new();
    f.read_to_string(&mut buf)
        .with_context(|| anyhow!("read {:?}", file))?;
    Ok(Some(toml::from_str(&buf).map_err(|e| {
        DevtestError::ConfigParse(format!("{:?}: {}", file, e))
    })?))
}

pub fn read_toml<P, T>(file: P) -> Result<T>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    read_toml_maybe(file)?
        .ok_or_else(|| anyhow!("open {:?}: file not found", file))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Sample {
        block_size: u64,
        workers: Option<usize>,
    }

    #[test]
    fn toml_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let got: Option<Sample> =
            read_toml_maybe(dir.path().join("nope.toml")).unwrap();
        assert!(got.is_none());
        assert!(read_toml::<_, Sample>(dir.path().join("nope.toml")).is_err());
    }

    #[test]
    fn toml_round_trip_from_disk() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "block_size = 8192").unwrap();
        f.flush().unwrap();

        let got: Sample = read_toml(f.path()).unwrap();
        assert_eq!(
            got,
            Sample {
                block_size: 8192,
                workers: None
            }
        );
    }

    #[test]
    fn toml_parse_error_is_reported() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "block_size = \"big\"").unwrap();
        f.flush().unwrap();

        let err = read_toml::<_, Sample>(f.path()).unwrap_err();
        let err = err.downcast::<DevtestError>().unwrap();
        assert!(matches!(err, DevtestError::ConfigParse(_)));
    }

    #[test]
    fn bail_macro_formats() {
        fn check(x: u64) -> Result<(), DevtestError> {
            if x == 0 {
                devtest_bail!(InvalidConfig, "x must be non-zero, got {}", x);
            }
            Ok(())
        }
        assert_eq!(
            check(0),
            Err(DevtestError::InvalidConfig(
                "x must be non-zero, got 0".to_string()
            ))
        );
        assert_eq!(check(1), Ok(()));
    }
}
