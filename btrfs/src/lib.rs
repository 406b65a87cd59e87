//! Library for btrfs subvolume bits

// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.

use serde::{Deserialize, Serialize};
use std::io::{Error, ErrorKind};
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;
use tracing::debug;

#[macro_export]
macro_rules! env_or_default {
    ($env:expr, $default:expr) => {
        match option_env!($env) {
            Some(value) => value,
            None => $default,
        }
    };
}

pub const BTRFS_CMD: &str = env_or_default!("MACHPULL_BTRFS_CMD", "/usr/bin/btrfs");

#[derive(Error, Debug)]
pub enum BtrfsError {
    #[error("fail to spawn btrfs process: {0}")]
    SpawnError(std::io::Error),
    #[error("btrfs command fail with non-zero exit code: {0}, stderr: {1}")]
    Generic(ExitStatus, String),
}

impl BtrfsError {
    pub fn normalized(self) -> std::io::Error {
        match self {
            Self::SpawnError(error) => error,
            Self::Generic(_, m) => Error::new(ErrorKind::Other, m.as_str()),
        }
    }
}

type Result<T> = std::result::Result<T, BtrfsError>;

/// Subvolume functionality are implemented by running the btrfs command, this struct defines
/// certain behaviours when the commands execute
#[allow(dead_code)]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BtrfsHandle {
    /// The command binary, by default it is "btrfs" which will yield whichever btrfs binary
    /// visible in $PATH
    executable: String,
    /// If the stdout and stderr should be piped for commands that does not rely on stdout/stderr
    /// to function correctly
    inherit_stdout: bool,
    inherit_stderr: bool,
}

impl Default for BtrfsHandle {
    fn default() -> BtrfsHandle {
        BtrfsHandle {
            executable: BTRFS_CMD.to_string(),
            inherit_stdout: false,
            inherit_stderr: false,
        }
    }
}

impl BtrfsHandle {
    pub fn new(executable: &str, inherit_stdout: bool, inherit_stderr: bool) -> BtrfsHandle {
        BtrfsHandle {
            executable: executable.to_string(),
            inherit_stdout,
            inherit_stderr,
        }
    }

    fn use_command<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Command),
    {
        let mut command = Command::new(&self.executable);
        command.stdout(Stdio::null());
        f(&mut command);
        let output = command.output().map_err(BtrfsError::SpawnError)?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr =
                std::str::from_utf8(&output.stderr).expect("btrfs stderr output non utf8 bytes");
            Err(BtrfsError::Generic(output.status, stderr.to_string()))
        }
    }

    /// Create a fresh, writable subvolume at `path`
    pub fn create(&self, path: impl AsRef<Path>) -> Result<()> {
        self.use_command(|c| {
            c.arg("subvolume").arg("create").arg(path.as_ref());
        })
    }

    /// Create `dst` as a copy-on-write clone of the subvolume at `src`
    pub fn snapshot(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
        writable: bool,
    ) -> Result<()> {
        self.use_command(|c| {
            c.arg("subvolume").arg("snapshot");
            if !writable {
                c.arg("-r");
            }
            c.arg(src.as_ref()).arg(dst.as_ref());
        })
    }

    pub fn set_read_only(&self, path: impl AsRef<Path>, read_only: bool) -> Result<()> {
        self.use_command(|c| {
            c.arg("property")
                .arg("set")
                .arg("-ts")
                .arg(path.as_ref())
                .arg("ro")
                .arg(if read_only { "true" } else { "false" });
        })
    }

    pub fn delete(&self, path: impl AsRef<Path>) -> Result<()> {
        self.use_command(|c| {
            c.arg("subvolume").arg("delete").arg(path.as_ref());
        })
    }

    /// Best-effort removal of a possibly partially created subvolume. Nested subvolumes and
    /// read-only flags must not keep the cleanup from making progress, so errors from the
    /// individual steps are swallowed after a debug line.
    pub fn remove_dangerous(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        match std::fs::symlink_metadata(path) {
            Err(error) if error.kind() == ErrorKind::NotFound => return,
            _ => {}
        }

        if let Err(error) = self.set_read_only(path, false) {
            debug!("cannot clear read-only flag of {path:?}: {error}");
        }
        if self.delete(path).is_ok() {
            return;
        }

        // nested subvolumes keep a plain delete from working, take them out bottom-up first
        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                let child = entry.path();
                match entry.file_type() {
                    Ok(t) if t.is_dir() => self.remove_dangerous(&child),
                    _ => {
                        if let Err(error) = std::fs::remove_file(&child) {
                            debug!("cannot remove {child:?}: {error}");
                        }
                    }
                }
            }
        }

        if self.delete(path).is_err() {
            if let Err(error) = std::fs::remove_dir_all(path) {
                debug!("cannot remove {path:?}: {error}");
            }
        }
    }
}

/// Create every missing ancestor of `path` with the given mode, leaving `path` itself alone
pub fn mkdir_parents(path: impl AsRef<Path>, mode: u32) -> std::io::Result<()> {
    let Some(parent) = path.as_ref().parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mkdir_parents_creates_ancestors_only() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/c/subvol");
        mkdir_parents(&target, 0o700).unwrap();
        assert!(dir.path().join("a/b/c").is_dir());
        assert!(!target.exists());
    }

    #[test]
    fn test_mkdir_parents_tolerates_existing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("x/subvol");
        mkdir_parents(&target, 0o700).unwrap();
        mkdir_parents(&target, 0o700).unwrap();
        assert!(dir.path().join("x").is_dir());
    }

    #[test]
    fn test_remove_dangerous_missing_path_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let handle = BtrfsHandle::new("/nonexistent/btrfs", false, false);
        handle.remove_dangerous(dir.path().join("not-there"));
    }

    #[test]
    fn test_remove_dangerous_falls_back_to_plain_removal() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("temp");
        std::fs::create_dir_all(victim.join("nested")).unwrap();
        std::fs::write(victim.join("nested/file"), b"x").unwrap();
        // not a subvolume and no usable btrfs binary, the rm -rf path has to win
        let handle = BtrfsHandle::new("/nonexistent/btrfs", false, false);
        handle.remove_dangerous(&victim);
        assert!(!victim.exists());
    }
}
