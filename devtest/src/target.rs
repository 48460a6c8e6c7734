// Copyright 2026 Oxide Computer Company
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use devtest_common::DevtestError;

/// The device or file under test.
///
/// Opened read-write and never created: pointing the tool at a path that
/// does not exist is a mistake, not a request for a scratch file.
#[derive(Debug)]
pub struct Target {
    path: PathBuf,
    file: File,
    len: u64,
    direct: bool,
}

impl Target {
    /// Opens `path`, with `O_DIRECT` when `direct` is set so that every
    /// read really goes to the media.
    pub fn open<P: AsRef<Path>>(path: P, direct: bool) -> Result<Target> {
        let path = path.as_ref();
        let mut flags = libc::O_CLOEXEC;
        if direct {
            flags |= libc::O_DIRECT;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(flags)
            .open(path)
            .with_context(|| format!("open {:?}", path))?;

        // Works for block devices, where metadata reports zero.
        let len = file
            .seek(SeekFrom::End(0))
            .with_context(|| format!("size of {:?}", path))?;
        if len == 0 {
            let name = path.display().to_string();
            return Err(DevtestError::TargetEmpty(name).into());
        }

        Ok(Target {
            path: path.to_path_buf(),
            file,
            len,
            direct,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }
}

impl AsFd for Target {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}
