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
use crate::extract::{fork_tar, resolve_whiteouts, TarChild};
use crate::notify::SupervisorNotify;
use crate::progress::{Phase, Reporter};
use crate::store::LayerStore;
use btrfs::{mkdir_parents, BtrfsHandle};
use dkr_util::ident::{machine_name_is_valid, repository_name_is_valid, tag_is_valid, LayerId};
use dkr_util::payload::{parse_ancestry, parse_id};
use dkr_util::v1::client::Index;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{error, info};

pub const DEFAULT_IMAGE_ROOT: &str = "/var/lib/machines";

/// One import session against a v1 index. A session performs at most one pull; a second
/// call fails `Busy` like the original job guard.
pub struct DkrImport {
    index: Index,
    store: LayerStore,
    progress_tx: watch::Sender<u32>,
    progress_rx: watch::Receiver<u32>,
    used: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct PullOutcome {
    /// The layer id the requested tag resolved to
    pub id: LayerId,
    /// Sealed subvolume of the assembled image
    pub image_path: PathBuf,
    /// The writable working copy, when one was requested
    pub local_path: Option<PathBuf>,
}

/// Everything that needs cleaning up when a pull dies mid-layer. Errors and
/// cancellation both funnel through here; the drop impl is the backstop for the
/// latter (the tar child itself is killed on drop by its process handle).
struct PullState {
    btrfs: BtrfsHandle,
    temp_path: Option<PathBuf>,
    tar: Option<TarChild>,
}

impl PullState {
    fn new(btrfs: BtrfsHandle) -> PullState {
        PullState {
            btrfs,
            temp_path: None,
            tar: None,
        }
    }

    async fn teardown(&mut self) {
        if let Some(tar) = self.tar.take() {
            tar.terminate().await;
        }
        if let Some(temp) = self.temp_path.take() {
            self.btrfs.remove_dangerous(&temp);
        }
    }
}

impl Drop for PullState {
    fn drop(&mut self) {
        if let Some(temp) = self.temp_path.take() {
            self.btrfs.remove_dangerous(&temp);
        }
    }
}

fn http_url_is_valid(url: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some()
}

fn normalize_index_url(url: &str) -> String {
    url.strip_suffix('/').unwrap_or(url).to_string()
}

fn ancestry_terminal_matches(ancestry: &[LayerId], id: &LayerId) -> bool {
    ancestry.last() == Some(id)
}

impl DkrImport {
    /// Create a session against `index_url`; the image root defaults to
    /// /var/lib/machines and a trailing slash on the index URL is stripped.
    pub fn new(index_url: &str, image_root: Option<&Path>) -> Result<DkrImport, PullError> {
        if !http_url_is_valid(index_url) {
            return Err(PullError::InvalidArgument("index url"));
        }
        let root = image_root
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGE_ROOT));
        let (progress_tx, progress_rx) = watch::channel(0);
        Ok(DkrImport {
            index: Index::new(normalize_index_url(index_url)),
            store: LayerStore::new(root),
            progress_tx,
            progress_rx,
            used: false,
        })
    }

    pub fn store(&self) -> &LayerStore {
        &self.store
    }

    /// Percent-complete channel, updated on every state change of the running pull
    pub fn subscribe_progress(&self) -> watch::Receiver<u32> {
        self.progress_rx.clone()
    }

    /// Import `name`:`tag` into the layer store and optionally materialize a working
    /// copy named `local`. Arguments are validated before any network activity.
    pub async fn pull(
        &mut self,
        name: &str,
        tag: Option<&str>,
        local: Option<&str>,
        force_local: bool,
    ) -> Result<PullOutcome, PullError> {
        if !repository_name_is_valid(name) {
            return Err(PullError::InvalidArgument("repository name"));
        }
        let tag = tag.unwrap_or("latest");
        if !tag_is_valid(tag) {
            return Err(PullError::InvalidArgument("tag"));
        }
        if let Some(local) = local {
            if !machine_name_is_valid(local) {
                return Err(PullError::InvalidArgument("local machine name"));
            }
        }
        if self.used {
            return Err(PullError::Busy);
        }
        self.used = true;

        let mut state = PullState::new(self.store.btrfs().clone());
        let result = self.run(name, tag, local, force_local, &mut state).await;
        if result.is_err() {
            state.teardown().await;
        }
        result
    }

    async fn run(
        &self,
        name: &str,
        tag: &str,
        local: Option<&str>,
        force_local: bool,
        state: &mut PullState,
    ) -> Result<PullOutcome, PullError> {
        let reporter = Mutex::new(Reporter::new(
            self.progress_tx.clone(),
            SupervisorNotify::from_env(),
        ));
        let mut session = self.index.new_session(name.to_string());

        // INDEX: the response headers direct us to the registry and mint the token
        reporter.lock().unwrap().enter(Phase::Searching);
        session
            .fetch_images(|p| reporter.lock().unwrap().update(|jobs| jobs.images = p))
            .await
            .map_err(|e| {
                error!("failed to retrieve images list (wrong index URL?)");
                PullError::from(e)
            })?;
        let registry = match session.registry() {
            Ok(registry) => registry.to_string(),
            Err(_) => {
                error!("didn't get registry information");
                return Err(PullError::Protocol(
                    "index response carried no registry endpoints".to_string(),
                ));
            }
        };
        info!("index lookup succeeded, directed to registry {registry}");

        // RESOLVE: tag to layer id
        reporter.lock().unwrap().enter(Phase::Resolving);
        let payload = session
            .fetch_tag(tag, |p| {
                reporter.lock().unwrap().update(|jobs| jobs.tags = p)
            })
            .await
            .map_err(|e| {
                error!("failed to retrieve tags list");
                PullError::from(e)
            })?;
        let id = parse_id(&payload).map_err(|e| {
            error!("failed to parse image id");
            PullError::from(e)
        })?;
        info!("tag lookup succeeded, resolved to layer {id}");

        // METADATA: ancestry and per-image json, concurrently; both must land before
        // any layer is touched
        reporter.lock().unwrap().enter(Phase::Metadata);
        let (ancestry_payload, json_payload) = tokio::try_join!(
            async {
                session
                    .fetch_ancestry(&id, |p| {
                        reporter.lock().unwrap().update(|jobs| jobs.ancestry = p)
                    })
                    .await
                    .map_err(|e| {
                        error!("failed to retrieve ancestry list");
                        e
                    })
            },
            async {
                session
                    .fetch_image_json(&id, |p| {
                        reporter.lock().unwrap().update(|jobs| jobs.json = p)
                    })
                    .await
                    .map_err(|e| {
                        error!("failed to retrieve json data");
                        e
                    })
            },
        )?;

        let ancestry = parse_ancestry(&ancestry_payload).map_err(|e| {
            error!("failed to parse ancestry list");
            PullError::from(e)
        })?;
        if !ancestry_terminal_matches(&ancestry, &id) {
            error!("ancestry doesn't end in main layer");
            return Err(PullError::Protocol(
                "ancestry does not end in the resolved image id".to_string(),
            ));
        }
        // content is opaque at this layer, we only insist it is well-formed
        serde_json::from_slice::<serde_json::Value>(&json_payload)
            .map_err(|e| PullError::Protocol(format!("image metadata is not valid json: {e}")))?;

        info!("ancestor lookup succeeded, requires layers:");
        for layer in &ancestry {
            info!("\t{layer}");
        }

        // DOWNLOAD: walk the chain base first, each layer snapshotted from its parent
        let n_ancestry = ancestry.len();
        reporter.lock().unwrap().update(|jobs| jobs.n_ancestry = n_ancestry);
        reporter.lock().unwrap().enter(Phase::Downloading);

        for (cursor, layer) in ancestry.iter().enumerate() {
            reporter.lock().unwrap().update(|jobs| {
                jobs.cursor = cursor;
                jobs.layer = 0;
            });

            if self.store.exists(layer)? {
                info!("layer {layer} already exists, skipping");
                continue;
            }

            info!("pulling layer {layer}...");
            let final_path = self.store.final_path(layer);
            let transfer = session.begin_layer(layer).await.map_err(|e| {
                error!("failed to retrieve layer data");
                PullError::from(e)
            })?;

            // open the disk target only now that body bytes are about to flow
            let temp_path = LayerStore::temp_path_for(&final_path);
            mkdir_parents(&temp_path, 0o700)?;
            if cursor > 0 {
                let base_path = self.store.final_path(&ancestry[cursor - 1]);
                self.store.btrfs().snapshot(&base_path, &temp_path, true)?;
            } else {
                self.store.btrfs().create(&temp_path)?;
            }
            state.temp_path = Some(temp_path.clone());

            let (tar, mut sink) = fork_tar(&temp_path)?;
            state.tar = Some(tar);

            transfer
                .copy_to(&mut sink, |p| {
                    reporter.lock().unwrap().update(|jobs| jobs.layer = p)
                })
                .await
                .map_err(|e| {
                    error!("failed to retrieve layer data");
                    PullError::from(e)
                })?;
            drop(sink);

            state
                .tar
                .take()
                .expect("layer extraction in progress")
                .wait()
                .await?;

            resolve_whiteouts(&temp_path)?;

            match self.store.seal(&temp_path, &final_path) {
                Ok(()) => info!("completed writing to layer {final_path:?}"),
                Err(PullError::Conflict(_)) => {
                    info!("layer {layer} appeared concurrently, keeping the existing copy")
                }
                Err(error) => return Err(error),
            }
            state.temp_path = None;
        }

        // FINALIZE: the chain is complete, produce the working copy if asked to
        reporter.lock().unwrap().enter(Phase::Copying);
        let image_path = self.store.final_path(&id);
        let local_path = match local {
            Some(local) => Some(self.store.materialize(&image_path, local, force_local)?),
            None => None,
        };

        Ok(PullOutcome {
            id,
            image_path,
            local_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_http_url_validation() {
        assert!(http_url_is_valid("https://index.example"));
        assert!(http_url_is_valid("http://index.example:8080/"));
        assert!(!http_url_is_valid("ftp://index.example"));
        assert!(!http_url_is_valid("index.example"));
        assert!(!http_url_is_valid(""));
    }

    #[test]
    fn test_index_url_normalization() {
        assert_eq!(
            normalize_index_url("https://index.example/"),
            "https://index.example"
        );
        assert_eq!(
            normalize_index_url("https://index.example"),
            "https://index.example"
        );
    }

    #[test]
    fn test_ancestry_terminal_check() {
        let a = LayerId::from_str(&"aa".repeat(32)).unwrap();
        let b = LayerId::from_str(&"bb".repeat(32)).unwrap();
        assert!(ancestry_terminal_matches(&[a.clone(), b.clone()], &b));
        assert!(!ancestry_terminal_matches(&[b.clone(), a.clone()], &b));
        assert!(!ancestry_terminal_matches(&[], &b));
    }

    #[tokio::test]
    async fn test_pull_validates_arguments_before_any_network() {
        let root = tempfile::tempdir().unwrap();
        let mut import =
            DkrImport::new("https://127.0.0.1:1", Some(root.path())).unwrap();
        let result = import.pull("UpperCase", None, None, false).await;
        assert!(matches!(result, Err(PullError::InvalidArgument(_))));
        let result = import.pull("name", Some("bad tag"), None, false).await;
        assert!(matches!(result, Err(PullError::InvalidArgument(_))));
        let result = import.pull("name", None, Some("bad.local"), false).await;
        assert!(matches!(result, Err(PullError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_session_is_single_use() {
        let root = tempfile::tempdir().unwrap();
        let mut import =
            DkrImport::new("https://127.0.0.1:1", Some(root.path())).unwrap();
        // nothing listens on port 1, the first pull dies in the index phase
        let first = import.pull("name", None, None, false).await;
        assert!(first.is_err());
        let second = import.pull("name", None, None, false).await;
        assert!(matches!(second, Err(PullError::Busy)));
    }

    #[test]
    fn test_new_rejects_bad_index_url() {
        assert!(matches!(
            DkrImport::new("not-a-url", None),
            Err(PullError::InvalidArgument(_))
        ));
    }
}
