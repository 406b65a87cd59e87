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

use dkr_util::payload::{PayloadError, LAYERS_MAX};
use dkr_util::v1::client::ClientError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PullError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("a pull was already started on this session")]
    Busy,
    #[error("ioError: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry protocol violation: {0}")]
    Protocol(String),
    #[error("ancestry lists more than {LAYERS_MAX} layers")]
    TooManyLayers,
    #[error("{0:?} already exists")]
    Conflict(PathBuf),
    #[error("tar extraction failed: {0}")]
    Extraction(String),
    #[error("network error: {0}")]
    Network(ClientError),
    #[error("snapshot operation failed: {0}")]
    Snapshot(#[from] btrfs::BtrfsError),
}

// A client error is the registry misbehaving (protocol), the transport giving up
// (network), or a local write into the extraction pipe failing (io); the pull outcome
// keeps the three apart.
impl From<ClientError> for PullError {
    fn from(error: ClientError) -> PullError {
        match error {
            ClientError::InvalidEndpoint(_)
            | ClientError::MissingEndpoints
            | ClientError::PayloadTooLarge
            | ClientError::NonStringHttpHeader(_) => PullError::Protocol(error.to_string()),
            ClientError::IoError(error) => PullError::Io(error),
            other => PullError::Network(other),
        }
    }
}

impl From<PayloadError> for PullError {
    fn from(error: PayloadError) -> PullError {
        match error {
            PayloadError::TooManyLayers => PullError::TooManyLayers,
            other => PullError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(matches!(
            PullError::from(ClientError::MissingEndpoints),
            PullError::Protocol(_)
        ));
        assert!(matches!(
            PullError::from(ClientError::PayloadTooLarge),
            PullError::Protocol(_)
        ));
        assert!(matches!(
            PullError::from(ClientError::UnsuccessfulResponse(
                reqwest::StatusCode::NOT_FOUND
            )),
            PullError::Network(_)
        ));
    }

    #[test]
    fn test_pipe_write_failure_is_io_not_network() {
        let broken = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "tar went away");
        assert!(matches!(
            PullError::from(ClientError::IoError(broken)),
            PullError::Io(_)
        ));
    }

    #[test]
    fn test_unprintable_header_is_protocol() {
        let to_str_error = reqwest::header::HeaderValue::from_bytes(&[0xff])
            .unwrap()
            .to_str()
            .unwrap_err();
        assert!(matches!(
            PullError::from(ClientError::NonStringHttpHeader(to_str_error)),
            PullError::Protocol(_)
        ));
    }

    #[test]
    fn test_payload_error_classification() {
        assert!(matches!(
            PullError::from(PayloadError::TooManyLayers),
            PullError::TooManyLayers
        ));
        assert!(matches!(
            PullError::from(PayloadError::EmptyAncestry),
            PullError::Protocol(_)
        ));
    }
}
