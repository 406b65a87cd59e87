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

use crate::error::PullError;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, warn};

/// Deletion marker prefix inherited from the layering scheme
const WHITEOUT_PREFIX: &str = ".wh.";
/// Bookkeeping entries of the layering scheme itself, dropped outright
const WHITEOUT_META_PREFIX: &str = ".wh..wh.";

/// Spawn the tar extraction child for a layer. The child reads the tar stream from its
/// stdin, which the caller feeds from the layer transfer; gzip -dcf passes plain tar
/// through untouched, so compressed and uncompressed streams both work.
pub(crate) fn fork_tar(dest: &Path) -> std::io::Result<(TarChild, ChildStdin)> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg("gzip -dcf | tar --numeric-owner -xpf - -C \"$0\"")
        .arg(dest)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    let stdin = child.stdin.take().expect("tar child stdin is piped");
    debug!("spawned tar child for {dest:?}");
    Ok((TarChild { child }, stdin))
}

pub(crate) struct TarChild {
    child: Child,
}

impl TarChild {
    /// Reap the child once the sink has been dropped. A non-zero or signaled exit means
    /// the layer content cannot be trusted and fails the pull.
    pub async fn wait(mut self) -> Result<(), PullError> {
        let status = self.child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(PullError::Extraction(format!(
                "tar child exited with {status}"
            )))
        }
    }

    /// Kill and reap, for teardown paths where the transfer did not complete
    pub async fn terminate(mut self) {
        if let Err(error) = self.child.start_kill() {
            debug!("cannot kill tar child: {error}");
        }
        if let Err(error) = self.child.wait().await {
            warn!("cannot reap tar child: {error}");
        }
    }
}

/// Apply deletion markers left in the extracted tree: `.wh.<name>` removes `<name>`
/// inherited from the parent layer along with the marker itself, and `.wh..wh.*`
/// bookkeeping entries are dropped without touching anything else.
pub(crate) fn resolve_whiteouts(root: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        if name.starts_with(WHITEOUT_META_PREFIX) {
            remove_all(&path)?;
            continue;
        }
        if let Some(victim) = name.strip_prefix(WHITEOUT_PREFIX) {
            remove_all(&path)?;
            remove_all(&root.join(victim))?;
            continue;
        }
        if entry.file_type()?.is_dir() {
            resolve_whiteouts(&path)?;
        }
    }
    Ok(())
}

fn remove_all(path: &Path) -> std::io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(error),
    };
    if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_whiteout_removes_marker_and_victim() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("oldfile"), b"stale").unwrap();
        std::fs::write(dir.path().join(".wh.oldfile"), b"").unwrap();
        std::fs::write(dir.path().join("newfile"), b"fresh").unwrap();

        resolve_whiteouts(dir.path()).unwrap();

        assert!(!dir.path().join("oldfile").exists());
        assert!(!dir.path().join(".wh.oldfile").exists());
        assert!(dir.path().join("newfile").exists());
    }

    #[test]
    fn test_whiteout_removes_directory_victim() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("olddir/sub")).unwrap();
        std::fs::write(dir.path().join("olddir/sub/file"), b"x").unwrap();
        std::fs::write(dir.path().join(".wh.olddir"), b"").unwrap();

        resolve_whiteouts(dir.path()).unwrap();

        assert!(!dir.path().join("olddir").exists());
    }

    #[test]
    fn test_whiteout_in_nested_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(dir.path().join("etc/motd"), b"x").unwrap();
        std::fs::write(dir.path().join("etc/.wh.motd"), b"").unwrap();

        resolve_whiteouts(dir.path()).unwrap();

        assert!(dir.path().join("etc").exists());
        assert!(!dir.path().join("etc/motd").exists());
    }

    #[test]
    fn test_metadata_entries_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".wh..wh.plnk")).unwrap();
        std::fs::write(dir.path().join(".wh..wh.aufs"), b"").unwrap();
        std::fs::write(dir.path().join("kept"), b"x").unwrap();

        resolve_whiteouts(dir.path()).unwrap();

        assert!(!dir.path().join(".wh..wh.plnk").exists());
        assert!(!dir.path().join(".wh..wh.aufs").exists());
        assert!(dir.path().join("kept").exists());
    }

    #[test]
    fn test_missing_victim_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".wh.ghost"), b"").unwrap();
        resolve_whiteouts(dir.path()).unwrap();
        assert!(!dir.path().join(".wh.ghost").exists());
    }

    #[tokio::test]
    async fn test_fork_tar_extracts_a_stream() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("hello"), b"world").unwrap();
        let archive = std::process::Command::new("tar")
            .arg("-C")
            .arg(src.path())
            .args(["-czf", "-", "."])
            .output()
            .unwrap();
        assert!(archive.status.success());

        let dest = tempfile::tempdir().unwrap();
        let (tar, mut sink) = fork_tar(dest.path()).unwrap();
        sink.write_all(&archive.stdout).await.unwrap();
        sink.shutdown().await.unwrap();
        drop(sink);
        tar.wait().await.unwrap();

        assert_eq!(
            std::fs::read(dest.path().join("hello")).unwrap(),
            b"world"
        );
    }

    #[tokio::test]
    async fn test_fork_tar_truncated_stream_fails() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("hello"), vec![7u8; 1 << 16]).unwrap();
        let archive = std::process::Command::new("tar")
            .arg("-C")
            .arg(src.path())
            .args(["-czf", "-", "."])
            .output()
            .unwrap();
        assert!(archive.status.success());

        let dest = tempfile::tempdir().unwrap();
        let (tar, mut sink) = fork_tar(dest.path()).unwrap();
        sink.write_all(&archive.stdout[..archive.stdout.len() / 2])
            .await
            .unwrap();
        sink.shutdown().await.unwrap();
        drop(sink);
        assert!(matches!(
            tar.wait().await,
            Err(PullError::Extraction(_))
        ));
    }
}
