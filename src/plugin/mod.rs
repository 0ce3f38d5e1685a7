// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The signing plugin contract: commands, capabilities, and the transport
//! abstraction used to reach a plugin. Plugins are external processes in
//! production; tests use in-process runners.

pub mod process;
pub mod proto;

use async_trait::async_trait;
use strum_macros::{Display, EnumString};
use thiserror::Error;

pub use process::PluginProcessRunner;
pub use proto::{
    DescribeKeyRequest, DescribeKeyResponse, GenerateEnvelopeRequest, GenerateEnvelopeResponse,
    GenerateSignatureRequest, GenerateSignatureResponse, GetMetadataRequest, PluginMetadata,
    Request, Response,
};

/// The plugin protocol contract version this implementation speaks.
pub const CONTRACT_VERSION: &str = "1";

pub type PluginResult<T> = std::result::Result<T, PluginError>;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("plugin protocol error on {command}: {message}")]
    Protocol { command: Command, message: String },

    #[error("plugin returned a {got} response to the {command} command")]
    UnexpectedResponse { command: Command, got: &'static str },

    #[error("plugin {name:?} declares no signing capability")]
    CapabilityMissing { name: String },

    #[error("plugin metadata is invalid: {0}")]
    InvalidMetadata(String),

    #[error("plugin key mismatch: requested {requested:?}, plugin answered for {responded:?}")]
    KeyMismatch { requested: String, responded: String },

    #[error("plugin signing algorithm not supported: {0}")]
    AlgorithmUnsupported(String),

    #[error("failed to invoke plugin {path:?}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin {path:?} exited with {status}: {stderr}")]
    Failed {
        path: String,
        status: String,
        stderr: String,
    },
}

/// Plugin commands. The command discriminates the request and the expected
/// response shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
pub enum Command {
    #[strum(serialize = "get-plugin-metadata")]
    GetMetadata,
    #[strum(serialize = "describe-key")]
    DescribeKey,
    #[strum(serialize = "generate-signature")]
    GenerateSignature,
    #[strum(serialize = "generate-envelope")]
    GenerateEnvelope,
}

/// Signing capabilities a plugin may declare. Unknown capabilities are
/// preserved verbatim so verification-oriented plugins stay loadable.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Capability {
    SignatureGenerator,
    EnvelopeGenerator,
    Other(String),
}

impl From<String> for Capability {
    fn from(s: String) -> Self {
        match s.as_str() {
            "SIGNATURE_GENERATOR.RAW" => Capability::SignatureGenerator,
            "SIGNATURE_GENERATOR.ENVELOPE" => Capability::EnvelopeGenerator,
            _ => Capability::Other(s),
        }
    }
}

impl From<Capability> for String {
    fn from(c: Capability) -> Self {
        match c {
            Capability::SignatureGenerator => "SIGNATURE_GENERATOR.RAW".to_string(),
            Capability::EnvelopeGenerator => "SIGNATURE_GENERATOR.ENVELOPE".to_string(),
            Capability::Other(s) => s,
        }
    }
}

/// Transport-agnostic plugin invocation.
///
/// A runner is scoped to a single plugin; no state is shared across
/// invocations.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, request: &Request) -> PluginResult<Response>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn command_names() {
        assert_eq!(Command::GetMetadata.to_string(), "get-plugin-metadata");
        assert_eq!(
            Command::from_str("generate-envelope").unwrap(),
            Command::GenerateEnvelope
        );
        assert!(Command::from_str("sign-all-the-things").is_err());
    }

    #[test]
    fn capability_serde() {
        let caps: Vec<Capability> =
            serde_json::from_str(r#"["SIGNATURE_GENERATOR.RAW", "SIGNATURE_VERIFIER.REVOCATION"]"#)
                .unwrap();
        assert_eq!(caps[0], Capability::SignatureGenerator);
        assert!(matches!(caps[1], Capability::Other(_)));
    }
}
