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

use crate::ident::{layer_id_is_valid, LayerId};
use serde::Deserialize;
use std::collections::HashSet;
use thiserror::Error;

/// Upper bound on the number of layers a single image may reference
pub const LAYERS_MAX: usize = 2048;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("empty payload")]
    Empty,
    #[error("payload contains an embedded NUL byte")]
    EmbeddedNul,
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not a valid layer id: {0}")]
    InvalidId(String),
    #[error("ancestry is empty")]
    EmptyAncestry,
    #[error("duplicate layer id in ancestry: {0}")]
    DuplicateId(String),
    #[error("ancestry lists more than {LAYERS_MAX} layers")]
    TooManyLayers,
}

fn check_raw(payload: &[u8]) -> Result<(), PayloadError> {
    if payload.is_empty() {
        return Err(PayloadError::Empty);
    }
    if payload.contains(&0) {
        return Err(PayloadError::EmbeddedNul);
    }
    Ok(())
}

/// Decode a payload consisting of exactly one quoted layer id. Anything else, including
/// trailing tokens after the string, is rejected.
pub fn parse_id(payload: &[u8]) -> Result<LayerId, PayloadError> {
    check_raw(payload)?;
    let mut deserializer = serde_json::Deserializer::from_slice(payload);
    let id = String::deserialize(&mut deserializer)?;
    deserializer.end()?;
    if !layer_id_is_valid(&id) {
        return Err(PayloadError::InvalidId(id));
    }
    Ok(id.parse().expect("validated layer id"))
}

/// Decode the ancestry payload, a non-empty array of unique layer ids as served by the
/// registry (newest first). The returned chain is reversed so that index 0 is the base
/// layer and the last element is the queried image itself.
pub fn parse_ancestry(payload: &[u8]) -> Result<Vec<LayerId>, PayloadError> {
    check_raw(payload)?;
    let mut deserializer = serde_json::Deserializer::from_slice(payload);
    let raw = Vec::<String>::deserialize(&mut deserializer)?;
    deserializer.end()?;

    if raw.is_empty() {
        return Err(PayloadError::EmptyAncestry);
    }
    if raw.len() > LAYERS_MAX {
        return Err(PayloadError::TooManyLayers);
    }

    let mut seen = HashSet::with_capacity(raw.len());
    let mut layers = Vec::with_capacity(raw.len());
    for id in raw {
        if !layer_id_is_valid(&id) {
            return Err(PayloadError::InvalidId(id));
        }
        if !seen.insert(id.clone()) {
            return Err(PayloadError::DuplicateId(id));
        }
        layers.push(id.parse().expect("validated layer id"));
    }

    layers.reverse();
    Ok(layers)
}
