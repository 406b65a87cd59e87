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

use pest::Parser;
use pest_derive::Parser;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Parser)]
#[grammar_inline = r#"
lower_alphanum = { ASCII_DIGIT | 'a'..'z' }
lower_hex = { ASCII_DIGIT | 'a'..'f' }
layer_id = { SOI ~ lower_hex{64} ~ EOI }
name_component = { (lower_alphanum | "-" | "_")+ }
repository = { SOI ~ name_component ~ ("/" ~ name_component)* ~ EOI }
tag_char = { ASCII_ALPHANUMERIC | "-" | "_" | "." }
tag = { SOI ~ tag_char{1,128} ~ EOI }
label = { ASCII_ALPHANUMERIC+ ~ ("-"+ ~ ASCII_ALPHANUMERIC+)* }
machine_name = { SOI ~ label ~ EOI }
hostname = { SOI ~ label ~ ("." ~ label)* ~ EOI }
"#]
struct IdentParser;

/// Layer identifiers are fixed-width lowercase hex
pub const LAYER_ID_LEN: usize = 64;

const REPOSITORY_NAME_MAX: usize = 256;
const MACHINE_NAME_MAX: usize = 64;
const HOSTNAME_MAX: usize = 255;
const HOSTNAME_LABEL_MAX: usize = 63;

pub fn layer_id_is_valid(id: &str) -> bool {
    IdentParser::parse(Rule::layer_id, id).is_ok()
}

/// Repository names are lowercase alphanumeric path components joined by "/"
pub fn repository_name_is_valid(name: &str) -> bool {
    name.len() <= REPOSITORY_NAME_MAX && IdentParser::parse(Rule::repository, name).is_ok()
}

pub fn tag_is_valid(tag: &str) -> bool {
    IdentParser::parse(Rule::tag, tag).is_ok()
}

/// Machine names are a single DNS-label-like component
pub fn machine_name_is_valid(name: &str) -> bool {
    name.len() <= MACHINE_NAME_MAX && IdentParser::parse(Rule::machine_name, name).is_ok()
}

/// RFC-1123 style hostname, a dot separated sequence of labels
pub fn hostname_is_valid(name: &str) -> bool {
    name.len() <= HOSTNAME_MAX
        && name.split('.').all(|label| label.len() <= HOSTNAME_LABEL_MAX)
        && IdentParser::parse(Rule::hostname, name).is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct LayerId(String);

impl LayerId {
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

impl AsRef<str> for LayerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        self.0.fmt(fmt)
    }
}

impl FromStr for LayerId {
    type Err = std::io::Error;
    fn from_str(s: &str) -> Result<LayerId, Self::Err> {
        if layer_id_is_valid(s) {
            Ok(LayerId(s.to_string()))
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "not a valid layer id",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_id() -> String {
        "0123456789abcdef".repeat(4)
    }

    #[test]
    fn test_layer_id_accepts_lowercase_hex() {
        assert!(layer_id_is_valid(&sample_id()));
        assert!(sample_id().parse::<LayerId>().is_ok());
    }

    #[test]
    fn test_layer_id_rejects_wrong_width() {
        assert!(!layer_id_is_valid(&sample_id()[..63]));
        assert!(!layer_id_is_valid(&format!("{}0", sample_id())));
        assert!(!layer_id_is_valid(""));
    }

    #[test]
    fn test_layer_id_rejects_uppercase_and_nonhex() {
        assert!(!layer_id_is_valid(&sample_id().to_uppercase()));
        assert!(!layer_id_is_valid(&"g".repeat(64)));
    }

    #[test]
    fn test_repository_names() {
        assert!(repository_name_is_valid("busybox"));
        assert!(repository_name_is_valid("library/busy-box_2"));
        assert!(repository_name_is_valid("a/b/c"));
        assert!(!repository_name_is_valid("Library/busybox"));
        assert!(!repository_name_is_valid("/busybox"));
        assert!(!repository_name_is_valid("busybox/"));
        assert!(!repository_name_is_valid(""));
        assert!(!repository_name_is_valid(&"a".repeat(257)));
    }

    #[test]
    fn test_tags() {
        assert!(tag_is_valid("latest"));
        assert!(tag_is_valid("v1.2.3_rc-1"));
        assert!(!tag_is_valid(""));
        assert!(!tag_is_valid("a tag"));
        assert!(!tag_is_valid(&"t".repeat(129)));
    }

    #[test]
    fn test_machine_names() {
        assert!(machine_name_is_valid("m1"));
        assert!(machine_name_is_valid("build-host42"));
        assert!(!machine_name_is_valid("-leading"));
        assert!(!machine_name_is_valid("trailing-"));
        assert!(!machine_name_is_valid("has.dot"));
        assert!(!machine_name_is_valid(&"m".repeat(65)));
    }

    #[test]
    fn test_hostnames() {
        assert!(hostname_is_valid("registry-1.example.com"));
        assert!(hostname_is_valid("localhost"));
        assert!(!hostname_is_valid("under_score.example"));
        assert!(!hostname_is_valid(".example"));
        assert!(!hostname_is_valid("example."));
        assert!(!hostname_is_valid("bad-.example"));
        assert!(!hostname_is_valid(&format!("{}.example", "a".repeat(64))));
    }
}
