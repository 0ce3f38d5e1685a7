// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Typed request/response messages of the plugin protocol. Every message is
//! JSON on the wire; binary fields are standard base64.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Capability, Command, PluginError, PluginResult};
use crate::crypto::{HashAlgorithm, KeySpec, SignatureAlgorithm};

/// Serde adapter for `Vec<u8>` fields carried as standard base64 strings.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Same adapter for a list of binary fields (certificate chains).
mod base64_bytes_vec {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        items: &[Vec<u8>],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(items.iter().map(|b| STANDARD.encode(b)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        let items = Vec::<String>::deserialize(deserializer)?;
        items
            .into_iter()
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMetadataRequest {
    pub contract_version: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugin_config: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeKeyRequest {
    pub contract_version: String,

    pub key_id: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugin_config: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateSignatureRequest {
    pub contract_version: String,

    pub key_id: String,

    pub key_spec: KeySpec,

    pub hash_algorithm: HashAlgorithm,

    /// The exact bytes to sign.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugin_config: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateEnvelopeRequest {
    pub contract_version: String,

    pub key_id: String,

    pub payload_type: String,

    pub signature_envelope_type: String,

    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_duration_in_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugin_config: BTreeMap<String, String>,
}

/// A plugin request, discriminated by its command.
#[derive(Clone, Debug)]
pub enum Request {
    GetMetadata(GetMetadataRequest),
    DescribeKey(DescribeKeyRequest),
    GenerateSignature(GenerateSignatureRequest),
    GenerateEnvelope(GenerateEnvelopeRequest),
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::GetMetadata(_) => Command::GetMetadata,
            Request::DescribeKey(_) => Command::DescribeKey,
            Request::GenerateSignature(_) => Command::GenerateSignature,
            Request::GenerateEnvelope(_) => Command::GenerateEnvelope,
        }
    }

    pub fn to_json(&self) -> PluginResult<Vec<u8>> {
        let result = match self {
            Request::GetMetadata(r) => serde_json::to_vec(r),
            Request::DescribeKey(r) => serde_json::to_vec(r),
            Request::GenerateSignature(r) => serde_json::to_vec(r),
            Request::GenerateEnvelope(r) => serde_json::to_vec(r),
        };
        result.map_err(|e| PluginError::Protocol {
            command: self.command(),
            message: format!("failed to encode request: {e}"),
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub version: String,

    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub supported_contract_versions: Vec<String>,

    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl PluginMetadata {
    /// A usable signing plugin names itself, reports a version and a
    /// supported contract version, and declares at least one signing
    /// capability.
    pub fn validate(&self) -> PluginResult<()> {
        if self.name.is_empty() || self.version.is_empty() {
            return Err(PluginError::InvalidMetadata(
                "plugin metadata must include a name and version".to_string(),
            ));
        }
        if !self
            .supported_contract_versions
            .iter()
            .any(|v| v == super::CONTRACT_VERSION)
        {
            return Err(PluginError::InvalidMetadata(format!(
                "plugin {:?} does not support contract version {:?}",
                self.name,
                super::CONTRACT_VERSION
            )));
        }
        if !self.capabilities.iter().any(|c| {
            matches!(
                c,
                Capability::SignatureGenerator | Capability::EnvelopeGenerator
            )
        }) {
            return Err(PluginError::CapabilityMissing {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeKeyResponse {
    pub key_id: String,

    pub key_spec: KeySpec,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateSignatureResponse {
    pub key_id: String,

    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,

    pub signing_algorithm: SignatureAlgorithm,

    /// DER certificates, leaf first.
    #[serde(with = "base64_bytes_vec")]
    pub certificate_chain: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateEnvelopeResponse {
    #[serde(with = "base64_bytes")]
    pub signature_envelope: Vec<u8>,

    pub signature_envelope_type: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// A plugin response. The variant must match the issued command; anything
/// else is a contract violation surfaced by the accessors below.
#[derive(Clone, Debug)]
pub enum Response {
    Metadata(PluginMetadata),
    DescribeKey(DescribeKeyResponse),
    GenerateSignature(GenerateSignatureResponse),
    GenerateEnvelope(GenerateEnvelopeResponse),
}

impl Response {
    fn kind(&self) -> &'static str {
        match self {
            Response::Metadata(_) => "get-plugin-metadata",
            Response::DescribeKey(_) => "describe-key",
            Response::GenerateSignature(_) => "generate-signature",
            Response::GenerateEnvelope(_) => "generate-envelope",
        }
    }

    /// Decodes the response JSON for `command` into the matching variant.
    pub fn from_json(command: Command, bytes: &[u8]) -> PluginResult<Self> {
        let map_err = |e: serde_json::Error| PluginError::Protocol {
            command,
            message: format!("failed to decode response: {e}"),
        };
        match command {
            Command::GetMetadata => serde_json::from_slice(bytes)
                .map(Response::Metadata)
                .map_err(map_err),
            Command::DescribeKey => serde_json::from_slice(bytes)
                .map(Response::DescribeKey)
                .map_err(map_err),
            Command::GenerateSignature => serde_json::from_slice(bytes)
                .map(Response::GenerateSignature)
                .map_err(map_err),
            Command::GenerateEnvelope => serde_json::from_slice(bytes)
                .map(Response::GenerateEnvelope)
                .map_err(map_err),
        }
    }

    pub fn into_metadata(self) -> PluginResult<PluginMetadata> {
        match self {
            Response::Metadata(m) => Ok(m),
            other => Err(PluginError::UnexpectedResponse {
                command: Command::GetMetadata,
                got: other.kind(),
            }),
        }
    }

    pub fn into_describe_key(self) -> PluginResult<DescribeKeyResponse> {
        match self {
            Response::DescribeKey(r) => Ok(r),
            other => Err(PluginError::UnexpectedResponse {
                command: Command::DescribeKey,
                got: other.kind(),
            }),
        }
    }

    pub fn into_generate_signature(self) -> PluginResult<GenerateSignatureResponse> {
        match self {
            Response::GenerateSignature(r) => Ok(r),
            other => Err(PluginError::UnexpectedResponse {
                command: Command::GenerateSignature,
                got: other.kind(),
            }),
        }
    }

    pub fn into_generate_envelope(self) -> PluginResult<GenerateEnvelopeResponse> {
        match self {
            Response::GenerateEnvelope(r) => Ok(r),
            other => Err(PluginError::UnexpectedResponse {
                command: Command::GenerateEnvelope,
                got: other.kind(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_request_wire_format() {
        let request = GenerateSignatureRequest {
            contract_version: super::super::CONTRACT_VERSION.to_string(),
            key_id: "mine".to_string(),
            key_spec: KeySpec::Ec256,
            hash_algorithm: HashAlgorithm::Sha256,
            payload: b"signing input".to_vec(),
            plugin_config: BTreeMap::new(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["contractVersion"], "1");
        assert_eq!(value["keySpec"], "EC-256");
        assert_eq!(value["hashAlgorithm"], "SHA-256");
        assert_eq!(value["payload"], "c2lnbmluZyBpbnB1dA==");
    }

    #[test]
    fn metadata_validation() {
        let mut metadata = PluginMetadata {
            name: "com.example.signer".to_string(),
            description: String::new(),
            version: "1.2.0".to_string(),
            url: String::new(),
            supported_contract_versions: vec!["1".to_string()],
            capabilities: vec![Capability::SignatureGenerator],
        };
        metadata.validate().unwrap();

        metadata.capabilities = vec![Capability::Other("SIGNATURE_VERIFIER".to_string())];
        assert!(matches!(
            metadata.validate(),
            Err(PluginError::CapabilityMissing { .. })
        ));

        metadata.capabilities = vec![Capability::EnvelopeGenerator];
        metadata.supported_contract_versions = vec!["2".to_string()];
        assert!(matches!(
            metadata.validate(),
            Err(PluginError::InvalidMetadata(_))
        ));

        metadata.name = String::new();
        assert!(matches!(
            metadata.validate(),
            Err(PluginError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn response_discriminant_is_enforced() {
        let metadata_json = br#"{"name":"p","version":"1","supportedContractVersions":["1"],"capabilities":["SIGNATURE_GENERATOR.RAW"]}"#;
        let response = Response::from_json(Command::GetMetadata, metadata_json).unwrap();
        assert!(matches!(
            response.clone().into_describe_key(),
            Err(PluginError::UnexpectedResponse { .. })
        ));
        assert!(response.into_metadata().is_ok());
    }

    #[test]
    fn certificate_chain_base64_round_trip() {
        let response = GenerateSignatureResponse {
            key_id: "k".to_string(),
            signature: vec![1, 2, 3],
            signing_algorithm: SignatureAlgorithm::EcdsaSha256,
            certificate_chain: vec![vec![0xde, 0xad], vec![0xbe, 0xef]],
        };
        let json = serde_json::to_vec(&response).unwrap();
        let parsed: GenerateSignatureResponse = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed.certificate_chain, response.certificate_chain);
        assert_eq!(parsed.signature, response.signature);
    }
}
