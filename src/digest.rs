// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use thiserror::Error;

pub const DIGEST_SHA256_PREFIX: &str = "sha256:";
pub const DIGEST_SHA512_PREFIX: &str = "sha512:";

pub type DigestResult<T> = std::result::Result<T, DigestError>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DigestError {
    #[error("digest {0:?} has no algorithm prefix")]
    MissingAlgorithm(String),

    #[error("unsupported digest algorithm in {0:?}")]
    UnsupportedAlgorithm(String),

    #[error("digest {0:?} has an invalid hex encoding")]
    InvalidEncoding(String),
}

/// A content digest in the canonical `<algorithm>:<hex>` form.
///
/// Only the algorithms used by the registry content model are accepted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest {
    repr: String,
}

impl ContentDigest {
    /// Computes the sha256 digest of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            repr: format!("{}{:x}", DIGEST_SHA256_PREFIX, sha2::Sha256::digest(bytes)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.repr
    }

    /// The hex part of the digest, without the algorithm prefix.
    pub fn encoded(&self) -> &str {
        // Validated at construction, the separator is always present.
        &self.repr[self.repr.find(':').map(|i| i + 1).unwrap_or(0)..]
    }

    fn validate(s: &str) -> DigestResult<()> {
        let Some((_, hex)) = s.split_once(':') else {
            return Err(DigestError::MissingAlgorithm(s.to_string()));
        };

        let expected_len = if s.starts_with(DIGEST_SHA256_PREFIX) {
            64
        } else if s.starts_with(DIGEST_SHA512_PREFIX) {
            128
        } else {
            return Err(DigestError::UnsupportedAlgorithm(s.to_string()));
        };

        if hex.len() != expected_len
            || !hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(DigestError::InvalidEncoding(s.to_string()));
        }

        Ok(())
    }
}

impl FromStr for ContentDigest {
    type Err = DigestError;

    fn from_str(s: &str) -> DigestResult<Self> {
        Self::validate(s)?;
        Ok(Self {
            repr: s.to_string(),
        })
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = DigestError;

    fn try_from(s: String) -> DigestResult<Self> {
        Self::validate(&s)?;
        Ok(Self { repr: s })
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.repr
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr)
    }
}
