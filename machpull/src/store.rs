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
use btrfs::BtrfsHandle;
use dkr_util::ident::LayerId;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Sealed layers live under the image root as `.dkr-{id}` subvolumes
const LAYER_PREFIX: &str = ".dkr-";

/// Name-addressed store of sealed, read-only layer subvolumes under one image root
pub struct LayerStore {
    image_root: PathBuf,
    btrfs: BtrfsHandle,
}

impl LayerStore {
    pub fn new(image_root: impl Into<PathBuf>) -> LayerStore {
        LayerStore {
            image_root: image_root.into(),
            btrfs: BtrfsHandle::default(),
        }
    }

    pub fn image_root(&self) -> &Path {
        &self.image_root
    }

    pub fn btrfs(&self) -> &BtrfsHandle {
        &self.btrfs
    }

    pub fn final_path(&self, id: &LayerId) -> PathBuf {
        self.image_root.join(format!("{LAYER_PREFIX}{}", id.as_str()))
    }

    /// Probe the store for a sealed layer. Only a clean not-found turns into `false`,
    /// anything else the caller has to see.
    pub fn exists(&self, id: &LayerId) -> Result<bool, std::io::Error> {
        match std::fs::symlink_metadata(self.final_path(id)) {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Transient download target next to `final_path`, named with a random suffix so
    /// concurrent pulls never collide on the temp
    pub fn temp_path_for(final_path: &Path) -> PathBuf {
        let mut name = final_path.as_os_str().to_os_string();
        name.push(format!(".{}", uuid::Uuid::new_v4().simple()));
        PathBuf::from(name)
    }

    /// Mark `temp` read-only and move it into place. Losing the rename race against a
    /// concurrent pull of the same layer yields `Conflict` with `temp` already removed;
    /// the layer then exists in the store either way.
    pub fn seal(&self, temp: &Path, final_path: &Path) -> Result<(), PullError> {
        self.btrfs.set_read_only(temp, true)?;
        match std::fs::rename(temp, final_path) {
            Ok(()) => Ok(()),
            Err(error) => {
                if std::fs::symlink_metadata(final_path).is_ok() {
                    debug!("lost rename race for {final_path:?}, dropping {temp:?}");
                    self.btrfs.remove_dangerous(temp);
                    Err(PullError::Conflict(final_path.to_path_buf()))
                } else {
                    Err(error.into())
                }
            }
        }
    }

    /// Produce the user-visible working copy `local` under the image root as a writable
    /// snapshot of a sealed layer.
    pub fn materialize(
        &self,
        final_path: &Path,
        local: &str,
        force: bool,
    ) -> Result<PathBuf, PullError> {
        let target = self.image_root.join(local);
        match std::fs::symlink_metadata(&target) {
            Ok(_) if !force => return Err(PullError::Conflict(target)),
            Ok(_) => self.btrfs.remove_dangerous(&target),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
        self.btrfs.snapshot(final_path, &target, true)?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn sample_id() -> LayerId {
        LayerId::from_str(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn test_final_path_layout() {
        let store = LayerStore::new("/var/lib/machines");
        let path = store.final_path(&sample_id());
        assert_eq!(
            path,
            PathBuf::from(format!("/var/lib/machines/.dkr-{}", "ab".repeat(32)))
        );
    }

    #[test]
    fn test_temp_path_keeps_prefix_and_varies() {
        let store = LayerStore::new("/var/lib/machines");
        let final_path = store.final_path(&sample_id());
        let a = LayerStore::temp_path_for(&final_path);
        let b = LayerStore::temp_path_for(&final_path);
        assert!(a.to_string_lossy().starts_with(&*final_path.to_string_lossy()));
        assert_ne!(a, b);
        assert_eq!(a.parent(), final_path.parent());
    }

    #[test]
    fn test_exists_probe() {
        let root = tempfile::tempdir().unwrap();
        let store = LayerStore::new(root.path());
        let id = sample_id();
        assert!(!store.exists(&id).unwrap());
        std::fs::create_dir(store.final_path(&id)).unwrap();
        assert!(store.exists(&id).unwrap());
    }

    #[test]
    fn test_materialize_refuses_existing_without_force() {
        let root = tempfile::tempdir().unwrap();
        let store = LayerStore::new(root.path());
        let final_path = store.final_path(&sample_id());
        std::fs::create_dir(root.path().join("m1")).unwrap();
        let result = store.materialize(&final_path, "m1", false);
        assert!(matches!(result, Err(PullError::Conflict(_))));
    }
}
