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

use clap::Parser;
use machpull::DkrImport;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Index server used to resolve the repository
    #[clap(long = "index", default_value = "https://index.docker.io")]
    index_url: String,
    /// Directory the layer store lives under
    #[clap(long = "image-root")]
    image_root: Option<PathBuf>,
    /// Tag to resolve, defaults to "latest"
    #[clap(long)]
    tag: Option<String>,
    /// Name of the writable working copy to create once the pull completes
    #[clap(long)]
    local: Option<String>,
    /// Replace an existing working copy of the same name
    #[clap(long, action)]
    force: bool,
    /// Repository to pull, e.g. library/busybox
    name: String,
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    // the whole pull is cooperative on one thread, the metadata pair included
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async move {
        let mut import = DkrImport::new(&args.index_url, args.image_root.as_deref())?;

        let mut progress = import.subscribe_progress();
        tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                info!("import progress {}%", *progress.borrow());
            }
        });

        let outcome = import
            .pull(
                &args.name,
                args.tag.as_deref(),
                args.local.as_deref(),
                args.force,
            )
            .await?;

        info!("pulled {} to {:?}", outcome.id, outcome.image_path);
        if let Some(local) = &outcome.local_path {
            info!("working copy at {local:?}");
        }
        Ok(())
    })
}
