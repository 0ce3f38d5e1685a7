// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The signing payload: a JSON document wrapping the target artifact
//! descriptor.

use serde::{Deserialize, Serialize};

use super::{EnvelopeError, EnvelopeResult};
use crate::oci::Descriptor;

/// Media type of the payload carried by every signature envelope.
pub const MEDIA_TYPE_PAYLOAD_V1: &str = "application/vnd.cncf.notary.payload.v1+json";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "targetArtifact")]
    pub target_artifact: Descriptor,
}

impl Payload {
    pub fn new(target_artifact: Descriptor) -> Self {
        Self { target_artifact }
    }

    /// Canonical compact JSON encoding. Descriptor annotations are sorted
    /// maps, so the encoding is deterministic.
    pub fn to_bytes(&self) -> EnvelopeResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    /// Parses payload bytes; fails unless the bytes are valid JSON with a
    /// `targetArtifact` object.
    pub fn from_bytes(bytes: &[u8]) -> EnvelopeResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            EnvelopeError::Malformed(format!("payload is not a valid target artifact: {e}"))
        })
    }
}
