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

use crate::ident::{hostname_is_valid, LayerId};
use reqwest::header::HeaderMap;
use reqwest::{Client, ClientBuilder, RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Response header carrying the session token minted by the index
pub const HEADER_TOKEN: &str = "x-dkr-token";
/// Response header carrying the comma separated registry endpoint list
pub const HEADER_ENDPOINTS: &str = "x-dkr-endpoints";

/// Buffered responses carry small JSON documents, anything past this is a broken peer
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed response: {0}")]
    UnsuccessfulResponse(StatusCode),
    #[error("cannot send request: {0:?}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("cannot convert header value to string: {0:?}")]
    NonStringHttpHeader(#[from] reqwest::header::ToStrError),
    #[error("registry hostname is not valid: {0}")]
    InvalidEndpoint(String),
    #[error("no registry endpoints received from index")]
    MissingEndpoints,
    #[error("response body larger than {MAX_PAYLOAD_SIZE} bytes")]
    PayloadTooLarge,
    #[error("ioError: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct Index {
    pub(crate) client: Client,
    pub base_url: String,
}

impl Index {
    pub fn new(base_url: String) -> Index {
        let client = ClientBuilder::new().build().unwrap();
        Index { client, base_url }
    }

    pub fn new_session(&self, repository: String) -> Session {
        Session {
            index: self.clone(),
            repository,
            token: None,
            endpoints: Vec::new(),
        }
    }
}

/// State accumulated over one pull against an index and the registry it directs us to.
/// The token and endpoint list are captured from the images response and echoed on every
/// later request.
#[derive(Clone, Debug)]
pub struct Session {
    index: Index,
    repository: String,
    token: Option<String>,
    endpoints: Vec<String>,
}

impl Session {
    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// The registry all requests after the index phase are issued against
    pub fn registry(&self) -> Result<&str, ClientError> {
        self.endpoints
            .first()
            .map(|s| s.as_str())
            .ok_or(ClientError::MissingEndpoints)
    }

    fn decorate(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Accept", "application/json");
        match &self.token {
            Some(token) => request.header("Authorization", format!("Token {token}")),
            None => request.header("X-Dkr-Token", "true"),
        }
    }

    fn capture_headers(&mut self, headers: &HeaderMap) -> Result<(), ClientError> {
        if let Some(value) = headers.get(HEADER_TOKEN) {
            self.token = Some(value.to_str()?.trim().to_string());
        }
        if let Some(value) = headers.get(HEADER_ENDPOINTS) {
            let mut endpoints = Vec::new();
            for host in value.to_str()?.split(',') {
                let host = host.trim();
                if !hostname_is_valid(host) {
                    return Err(ClientError::InvalidEndpoint(host.to_string()));
                }
                endpoints.push(host.to_string());
            }
            self.endpoints = endpoints;
        }
        Ok(())
    }

    async fn read_limited(
        mut response: Response,
        mut on_progress: impl FnMut(u32),
    ) -> Result<Vec<u8>, ClientError> {
        let total = response.content_length();
        let mut buf = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if buf.len() + chunk.len() > MAX_PAYLOAD_SIZE {
                return Err(ClientError::PayloadTooLarge);
            }
            buf.extend_from_slice(&chunk);
            if let Some(total) = total {
                if total > 0 {
                    on_progress((buf.len() as u64 * 100 / total).min(100) as u32);
                }
            }
        }
        on_progress(100);
        Ok(buf)
    }

    async fn get_limited(
        &self,
        url: &str,
        on_progress: impl FnMut(u32),
    ) -> Result<Vec<u8>, ClientError> {
        debug!(url, "requesting");
        let response = self.decorate(self.index.client.get(url)).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::UnsuccessfulResponse(response.status()));
        }
        Self::read_limited(response, on_progress).await
    }

    /// GET {index}/v1/repositories/{name}/images. The interesting part of the response is
    /// its headers, which yield the registry endpoints and possibly a token; the body is
    /// drained but unused.
    pub async fn fetch_images(
        &mut self,
        on_progress: impl FnMut(u32),
    ) -> Result<(), ClientError> {
        let url = format!(
            "{}/v1/repositories/{}/images",
            self.index.base_url, self.repository
        );
        debug!(url, "requesting images");
        let response = self.decorate(self.index.client.get(&url)).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::UnsuccessfulResponse(response.status()));
        }
        let headers = response.headers().clone();
        self.capture_headers(&headers)?;
        Self::read_limited(response, on_progress).await?;
        Ok(())
    }

    /// Resolve `tag` to a layer id; the payload is the raw JSON body, decoding is the
    /// caller's business.
    pub async fn fetch_tag(
        &self,
        tag: &str,
        on_progress: impl FnMut(u32),
    ) -> Result<Vec<u8>, ClientError> {
        let registry = self.registry()?;
        let url = format!(
            "https://{registry}/v1/repositories/{}/tags/{tag}",
            self.repository
        );
        self.get_limited(&url, on_progress).await
    }

    pub async fn fetch_ancestry(
        &self,
        id: &LayerId,
        on_progress: impl FnMut(u32),
    ) -> Result<Vec<u8>, ClientError> {
        let registry = self.registry()?;
        let url = format!("https://{registry}/v1/images/{id}/ancestry");
        self.get_limited(&url, on_progress).await
    }

    pub async fn fetch_image_json(
        &self,
        id: &LayerId,
        on_progress: impl FnMut(u32),
    ) -> Result<Vec<u8>, ClientError> {
        let registry = self.registry()?;
        let url = format!("https://{registry}/v1/images/{id}/json");
        self.get_limited(&url, on_progress).await
    }

    /// Issue the layer request and hand back the open transfer once response headers are
    /// in. The caller prepares the disk target between this and [`LayerTransfer::copy_to`].
    pub async fn begin_layer(&self, layer: &LayerId) -> Result<LayerTransfer, ClientError> {
        let registry = self.registry()?;
        let url = format!("https://{registry}/v1/images/{layer}/layer");
        debug!(url, "requesting layer");
        let response = self.decorate(self.index.client.get(&url)).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::UnsuccessfulResponse(response.status()));
        }
        Ok(LayerTransfer { response })
    }
}

/// An accepted layer request whose tar stream has not been consumed yet
pub struct LayerTransfer {
    response: Response,
}

impl LayerTransfer {
    pub fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    /// Pump the body into `sink`, reporting percent-complete as bytes arrive. With an
    /// unknown content length the percent stays at zero until the final jump to 100.
    pub async fn copy_to<W>(
        mut self,
        sink: &mut W,
        mut on_progress: impl FnMut(u32),
    ) -> Result<u64, ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let total = self.response.content_length();
        let mut written: u64 = 0;
        while let Some(chunk) = self.response.chunk().await? {
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(total) = total {
                if total > 0 {
                    on_progress((written * 100 / total).min(100) as u32);
                }
            }
        }
        sink.flush().await?;
        on_progress(100);
        Ok(written)
    }
}
