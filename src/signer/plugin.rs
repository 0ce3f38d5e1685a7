// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Plugin-delegating signer: raw signature generation and full envelope
//! generation, both per the plugin contract.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use log::debug;

use super::{check_self_consistency, SignRequest, Signer, SignerError, SignerOutput, SignerResult};
use crate::crypto;
use crate::crypto::certificate::Certificate;
use crate::envelope::{
    EnvelopeBuilder, Payload, SigningScheme, UnsignedAttributes, MEDIA_TYPE_PAYLOAD_V1,
};
use crate::oci::Descriptor;
use crate::plugin::{
    Capability, DescribeKeyRequest, DescribeKeyResponse, GenerateEnvelopeRequest,
    GenerateSignatureRequest, GetMetadataRequest, PluginError, Request, Runner, CONTRACT_VERSION,
};

/// Signs by delegating key access (and optionally envelope construction) to
/// an external plugin.
pub struct PluginSigner {
    runner: Box<dyn Runner>,
    key_id: String,
    plugin_config: BTreeMap<String, String>,
}

impl PluginSigner {
    pub fn new(runner: Box<dyn Runner>, key_id: impl Into<String>) -> Self {
        Self {
            runner,
            key_id: key_id.into(),
            plugin_config: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, plugin_config: BTreeMap<String, String>) -> Self {
        self.plugin_config = plugin_config;
        self
    }

    /// Base configuration overlaid with per-request entries; the request
    /// wins on conflicting keys.
    fn merged_config(&self, request: &SignRequest) -> BTreeMap<String, String> {
        let mut merged = self.plugin_config.clone();
        merged.extend(
            request
                .plugin_config
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        merged
    }

    async fn describe_key(
        &self,
        config: &BTreeMap<String, String>,
    ) -> SignerResult<DescribeKeyResponse> {
        let response = self
            .runner
            .run(&Request::DescribeKey(DescribeKeyRequest {
                contract_version: CONTRACT_VERSION.to_string(),
                key_id: self.key_id.clone(),
                plugin_config: config.clone(),
            }))
            .await?;
        Ok(response.into_describe_key()?)
    }

    /// The signature-generator path: the plugin signs the envelope's
    /// signing input, everything else happens here.
    async fn generate_signature(
        &self,
        desc: &Descriptor,
        request: &SignRequest,
    ) -> SignerResult<SignerOutput> {
        let config = self.merged_config(request);

        let key = self.describe_key(&config).await?;
        if key.key_id != self.key_id {
            return Err(PluginError::KeyMismatch {
                requested: self.key_id.clone(),
                responded: key.key_id,
            }
            .into());
        }

        let algorithm = key
            .key_spec
            .signature_algorithm()
            .map_err(|e| PluginError::AlgorithmUnsupported(e.to_string()))?;

        let payload = Payload::new(desc.clone()).to_bytes()?;
        let signing_time = Utc::now();
        let builder = EnvelopeBuilder::new(
            request.signature_media_type,
            payload,
            algorithm,
            SigningScheme::NotaryX509,
            signing_time,
            request.expiry_from(signing_time),
        )?;
        let signing_input = builder.signing_input();

        let response = self
            .runner
            .run(&Request::GenerateSignature(GenerateSignatureRequest {
                contract_version: CONTRACT_VERSION.to_string(),
                key_id: self.key_id.clone(),
                key_spec: key.key_spec,
                hash_algorithm: algorithm.hash_algorithm(),
                payload: signing_input.clone(),
                plugin_config: config,
            }))
            .await?
            .into_generate_signature()?;

        if response.key_id != self.key_id {
            return Err(PluginError::KeyMismatch {
                requested: self.key_id.clone(),
                responded: response.key_id,
            }
            .into());
        }
        if response.signing_algorithm != algorithm {
            return Err(PluginError::AlgorithmUnsupported(format!(
                "plugin signed with {:?}, the key spec mandates {:?}",
                response.signing_algorithm, algorithm
            ))
            .into());
        }
        if response.certificate_chain.is_empty() {
            return Err(SignerError::EmptyCertificateChain);
        }

        let chain = response
            .certificate_chain
            .into_iter()
            .map(Certificate::from_der)
            .collect::<Result<Vec<_>, _>>()?;

        // The plugin's signature is re-verified locally before anything is
        // assembled around it.
        crypto::verify_signature(algorithm, &chain[0], &signing_input, &response.signature)
            .map_err(SignerError::SignatureVerificationFailed)?;
        if !chain[0].has_code_signing_eku()? {
            return Err(SignerError::CertificateNotForCodeSigning);
        }

        let unsigned = UnsignedAttributes {
            signing_agent: request.signing_agent.clone(),
            timestamp_token: None,
        };
        let raw = builder.assemble(&response.signature, &chain, &unsigned)?;

        let content = check_self_consistency(request.signature_media_type, &raw, desc)?;
        Ok(SignerOutput {
            envelope: raw,
            signer_info: content.signer_info,
            annotations: BTreeMap::new(),
        })
    }

    /// The envelope-generator path: the plugin builds the whole envelope;
    /// its output is validated for internal consistency before use.
    async fn generate_envelope(
        &self,
        desc: &Descriptor,
        request: &SignRequest,
    ) -> SignerResult<SignerOutput> {
        let config = self.merged_config(request);
        let payload = Payload::new(desc.clone()).to_bytes()?;

        let response = self
            .runner
            .run(&Request::GenerateEnvelope(GenerateEnvelopeRequest {
                contract_version: CONTRACT_VERSION.to_string(),
                key_id: self.key_id.clone(),
                payload_type: MEDIA_TYPE_PAYLOAD_V1.to_string(),
                signature_envelope_type: request.signature_media_type.to_string(),
                payload,
                expiry_duration_in_seconds: request
                    .expiry_duration
                    .map(|d| d.num_seconds().max(0) as u64),
                plugin_config: config,
            }))
            .await?
            .into_generate_envelope()?;

        if response.signature_envelope_type != request.signature_media_type.to_string() {
            return Err(PluginError::Protocol {
                command: crate::plugin::Command::GenerateEnvelope,
                message: format!(
                    "plugin returned envelope type {:?}, requested {:?}",
                    response.signature_envelope_type, request.signature_media_type
                ),
            }
            .into());
        }

        let content = check_self_consistency(
            request.signature_media_type,
            &response.signature_envelope,
            desc,
        )?;
        Ok(SignerOutput {
            envelope: response.signature_envelope,
            signer_info: content.signer_info,
            annotations: response.annotations,
        })
    }
}

#[async_trait]
impl Signer for PluginSigner {
    async fn sign(&self, desc: &Descriptor, request: &SignRequest) -> SignerResult<SignerOutput> {
        let metadata = self
            .runner
            .run(&Request::GetMetadata(GetMetadataRequest {
                contract_version: CONTRACT_VERSION.to_string(),
                plugin_config: self.merged_config(request),
            }))
            .await?
            .into_metadata()?;
        metadata.validate()?;
        debug!(
            "signing with plugin {} {} (key {})",
            metadata.name, metadata.version, self.key_id
        );

        if metadata.has_capability(&Capability::SignatureGenerator) {
            self.generate_signature(desc, request).await
        } else if metadata.has_capability(&Capability::EnvelopeGenerator) {
            self.generate_envelope(desc, request).await
        } else {
            Err(PluginError::CapabilityMissing {
                name: metadata.name,
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeySpec, SignatureAlgorithm, SigningKey};
    use crate::envelope::{self, SignatureMediaType};
    use crate::oci::MEDIA_TYPE_IMAGE_MANIFEST;
    use crate::plugin::{PluginMetadata, PluginResult, Response};
    use std::sync::Mutex;

    const LEAF_PEM: &[u8] = include_bytes!("../../test_data/certs/leaf.pem");
    const LEAF_KEY_PEM: &[u8] = include_bytes!("../../test_data/certs/leaf.key");
    const CA_PEM: &[u8] = include_bytes!("../../test_data/certs/ca.pem");

    fn test_chain_der() -> Vec<Vec<u8>> {
        let mut chain = Certificate::from_pem_chain(LEAF_PEM).unwrap();
        chain.extend(Certificate::from_pem_chain(CA_PEM).unwrap());
        chain.into_iter().map(|c| c.as_der().to_vec()).collect()
    }

    fn test_key() -> SigningKey {
        let der = x509_parser::pem::Pem::iter_from_buffer(LEAF_KEY_PEM)
            .next()
            .unwrap()
            .unwrap()
            .contents;
        SigningKey::from_pkcs8_der(KeySpec::Ec256, &der).unwrap()
    }

    fn metadata(capabilities: Vec<Capability>) -> PluginMetadata {
        PluginMetadata {
            name: "com.example.inprocess".to_string(),
            description: String::new(),
            version: "0.1.0".to_string(),
            url: String::new(),
            supported_contract_versions: vec![CONTRACT_VERSION.to_string()],
            capabilities,
        }
    }

    /// An in-process signature-generator plugin; `key_id_override` lets
    /// tests exercise the key mismatch contract.
    struct FakeRawPlugin {
        key_id: String,
        describe_key_id: String,
        seen_configs: Mutex<Vec<BTreeMap<String, String>>>,
    }

    #[async_trait]
    impl Runner for FakeRawPlugin {
        async fn run(&self, request: &Request) -> PluginResult<Response> {
            match request {
                Request::GetMetadata(_) => Ok(Response::Metadata(metadata(vec![
                    Capability::SignatureGenerator,
                ]))),
                Request::DescribeKey(req) => {
                    self.seen_configs
                        .lock()
                        .unwrap()
                        .push(req.plugin_config.clone());
                    Ok(Response::DescribeKey(DescribeKeyResponse {
                        key_id: self.describe_key_id.clone(),
                        key_spec: KeySpec::Ec256,
                    }))
                }
                Request::GenerateSignature(req) => {
                    let signature = test_key()
                        .sign(SignatureAlgorithm::EcdsaSha256, &req.payload)
                        .unwrap();
                    Ok(Response::GenerateSignature(
                        crate::plugin::GenerateSignatureResponse {
                            key_id: self.key_id.clone(),
                            signature,
                            signing_algorithm: SignatureAlgorithm::EcdsaSha256,
                            certificate_chain: test_chain_der(),
                        },
                    ))
                }
                Request::GenerateEnvelope(_) => unreachable!("raw plugin"),
            }
        }
    }

    fn raw_plugin_signer(describe_key_id: &str) -> PluginSigner {
        PluginSigner::new(
            Box::new(FakeRawPlugin {
                key_id: "mine".to_string(),
                describe_key_id: describe_key_id.to_string(),
                seen_configs: Mutex::new(Vec::new()),
            }),
            "mine",
        )
    }

    #[tokio::test]
    async fn raw_plugin_flow_produces_valid_envelope() {
        let signer = raw_plugin_signer("mine");
        let desc = Descriptor::from_content(MEDIA_TYPE_IMAGE_MANIFEST, b"artifact");

        let output = signer
            .sign(&desc, &SignRequest::new(SignatureMediaType::Jws))
            .await
            .unwrap();

        let content = envelope::parse(SignatureMediaType::Jws, &output.envelope).unwrap();
        envelope::verify_integrity(&content, content.leaf_certificate().unwrap()).unwrap();
        assert_eq!(
            content.payload().unwrap().target_artifact.digest,
            desc.digest
        );
    }

    #[tokio::test]
    async fn describe_key_mismatch_fails() {
        let signer = raw_plugin_signer("other");
        let desc = Descriptor::from_content(MEDIA_TYPE_IMAGE_MANIFEST, b"artifact");

        let err = signer
            .sign(&desc, &SignRequest::new(SignatureMediaType::Jws))
            .await
            .unwrap_err();
        assert!(
            matches!(err, SignerError::Plugin(PluginError::KeyMismatch { .. })),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn per_request_config_overrides_base_config() {
        let runner = FakeRawPlugin {
            key_id: "mine".to_string(),
            describe_key_id: "mine".to_string(),
            seen_configs: Mutex::new(Vec::new()),
        };
        let signer = PluginSigner {
            runner: Box::new(runner),
            key_id: "mine".to_string(),
            plugin_config: BTreeMap::from([
                ("region".to_string(), "eu".to_string()),
                ("debug".to_string(), "false".to_string()),
            ]),
        };
        let mut request = SignRequest::new(SignatureMediaType::Jws);
        request.plugin_config = BTreeMap::from([("region".to_string(), "us".to_string())]);

        let merged = signer.merged_config(&request);
        assert_eq!(merged["region"], "us");
        assert_eq!(merged["debug"], "false");
    }

    /// An in-process envelope-generator plugin built on the local signing
    /// primitives.
    struct FakeEnvelopePlugin;

    #[async_trait]
    impl Runner for FakeEnvelopePlugin {
        async fn run(&self, request: &Request) -> PluginResult<Response> {
            match request {
                Request::GetMetadata(_) => Ok(Response::Metadata(metadata(vec![
                    Capability::EnvelopeGenerator,
                ]))),
                Request::GenerateEnvelope(req) => {
                    let chain: Vec<Certificate> = test_chain_der()
                        .into_iter()
                        .map(|der| Certificate::from_der(der).unwrap())
                        .collect();
                    let builder = EnvelopeBuilder::new(
                        SignatureMediaType::Jws,
                        req.payload.clone(),
                        SignatureAlgorithm::EcdsaSha256,
                        SigningScheme::NotaryX509,
                        Utc::now(),
                        None,
                    )
                    .unwrap();
                    let signature = test_key()
                        .sign(SignatureAlgorithm::EcdsaSha256, &builder.signing_input())
                        .unwrap();
                    let raw = builder
                        .assemble(&signature, &chain, &UnsignedAttributes::default())
                        .unwrap();
                    Ok(Response::GenerateEnvelope(
                        crate::plugin::GenerateEnvelopeResponse {
                            signature_envelope: raw,
                            signature_envelope_type: req.signature_envelope_type.clone(),
                            annotations: BTreeMap::from([(
                                "com.example.vendor".to_string(),
                                "hsm-7".to_string(),
                            )]),
                        },
                    ))
                }
                _ => unreachable!("envelope plugin"),
            }
        }
    }

    #[tokio::test]
    async fn envelope_plugin_flow_validates_and_surfaces_annotations() {
        let signer = PluginSigner::new(Box::new(FakeEnvelopePlugin), "mine");
        let desc = Descriptor::from_content(MEDIA_TYPE_IMAGE_MANIFEST, b"artifact");

        let output = signer
            .sign(&desc, &SignRequest::new(SignatureMediaType::Jws))
            .await
            .unwrap();
        assert_eq!(output.annotations["com.example.vendor"], "hsm-7");

        let content = envelope::parse(SignatureMediaType::Jws, &output.envelope).unwrap();
        envelope::verify_integrity(&content, content.leaf_certificate().unwrap()).unwrap();
    }
}
