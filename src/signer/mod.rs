// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Artifact signers: the [`Signer`] boundary used by the signing flow, and
//! the in-process key signer. Plugin delegation lives in [`plugin`].

pub mod plugin;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::crypto::certificate::{Certificate, CertificateError};
use crate::crypto::{CryptoError, SigningKey};
use crate::envelope::{
    self, EnvelopeBuilder, EnvelopeContent, EnvelopeError, Payload, SignatureMediaType,
    SignerInfo, SigningScheme, UnsignedAttributes,
};
use crate::oci::Descriptor;
use crate::plugin::PluginError;

pub use plugin::PluginSigner;

pub type SignerResult<T> = std::result::Result<T, SignerError>;

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("signing certificate does not declare the code-signing extended key usage")]
    CertificateNotForCodeSigning,

    #[error("certificate chain must not be empty")]
    EmptyCertificateChain,

    #[error("signature produced for the wrong content: {0}")]
    InconsistentEnvelope(String),

    #[error("signature does not verify against the signing certificate")]
    SignatureVerificationFailed(#[source] CryptoError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// Parameters of a single signing operation, prepared by the signing flow.
#[derive(Clone, Debug)]
pub struct SignRequest {
    pub signature_media_type: SignatureMediaType,

    /// Already validated by the flow: non-negative, whole seconds.
    pub expiry_duration: Option<Duration>,

    /// Per-request plugin configuration, overlaid on the signer's base
    /// configuration.
    pub plugin_config: BTreeMap<String, String>,

    pub signing_agent: Option<String>,
}

impl SignRequest {
    pub fn new(signature_media_type: SignatureMediaType) -> Self {
        Self {
            signature_media_type,
            expiry_duration: None,
            plugin_config: BTreeMap::new(),
            signing_agent: None,
        }
    }

    fn expiry_from(&self, signing_time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expiry_duration.map(|d| signing_time + d)
    }
}

/// The result of signing one descriptor.
#[derive(Debug)]
pub struct SignerOutput {
    /// The encoded signature envelope.
    pub envelope: Vec<u8>,

    /// The signed attributes parsed back out of the produced envelope.
    pub signer_info: SignerInfo,

    /// Signature manifest annotations contributed by the signer (plugins
    /// may return them from envelope generation).
    pub annotations: BTreeMap<String, String>,
}

/// Signs an artifact descriptor into a signature envelope. Implementations
/// may hold local keys or delegate to an external plugin.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, desc: &Descriptor, request: &SignRequest) -> SignerResult<SignerOutput>;
}

/// Every produced envelope is parsed back and its signature re-verified
/// against the leaf before it leaves the signer.
fn check_self_consistency(
    media_type: SignatureMediaType,
    raw: &[u8],
    desc: &Descriptor,
) -> SignerResult<EnvelopeContent> {
    let content = envelope::parse(media_type, raw)?;
    let payload = content.payload()?;
    if !payload.target_artifact.same_content(desc) {
        return Err(SignerError::InconsistentEnvelope(format!(
            "payload describes {}, expected {}",
            payload.target_artifact.digest, desc.digest
        )));
    }
    let leaf = content.leaf_certificate()?;
    if !leaf.has_code_signing_eku()? {
        return Err(SignerError::CertificateNotForCodeSigning);
    }
    envelope::verify_integrity(&content, leaf)?;
    Ok(content)
}

/// Signs with an in-process private key and certificate chain.
pub struct LocalSigner {
    key: SigningKey,
    chain: Vec<Certificate>,
}

impl LocalSigner {
    pub fn new(key: SigningKey, chain: Vec<Certificate>) -> SignerResult<Self> {
        if chain.is_empty() {
            return Err(SignerError::EmptyCertificateChain);
        }
        Ok(Self { key, chain })
    }

    /// Loads a PKCS#8 PEM key and PEM certificate chain, leaf first.
    pub fn from_pem(key_pem: &[u8], chain_pem: &[u8]) -> SignerResult<Self> {
        let chain = Certificate::from_pem_chain(chain_pem)?;
        let key_spec = chain[0].key_spec()?;
        let key_der = x509_parser::pem::Pem::iter_from_buffer(key_pem)
            .next()
            .transpose()
            .map_err(|e| CertificateError::Malformed(e.to_string()))?
            .ok_or(CertificateError::EmptyPem)?
            .contents;
        let key = SigningKey::from_pkcs8_der(key_spec, &key_der)?;
        Self::new(key, chain)
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn sign(&self, desc: &Descriptor, request: &SignRequest) -> SignerResult<SignerOutput> {
        let algorithm = self.chain[0].key_spec()?.signature_algorithm()?;
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

        let signature = self.key.sign(algorithm, &builder.signing_input())?;
        let unsigned = UnsignedAttributes {
            signing_agent: request.signing_agent.clone(),
            timestamp_token: None,
        };
        let raw = builder.assemble(&signature, &self.chain, &unsigned)?;

        let content = check_self_consistency(request.signature_media_type, &raw, desc)?;
        Ok(SignerOutput {
            envelope: raw,
            signer_info: content.signer_info,
            annotations: BTreeMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::MEDIA_TYPE_IMAGE_MANIFEST;

    const LEAF_PEM: &[u8] = include_bytes!("../../test_data/certs/leaf.pem");
    const LEAF_KEY_PEM: &[u8] = include_bytes!("../../test_data/certs/leaf.key");
    const CA_PEM: &[u8] = include_bytes!("../../test_data/certs/ca.pem");
    const NOEKU_PEM: &[u8] = include_bytes!("../../test_data/certs/noeku.pem");
    const NOEKU_KEY_PEM: &[u8] = include_bytes!("../../test_data/certs/noeku.key");

    fn chain_pem() -> Vec<u8> {
        [LEAF_PEM, CA_PEM].concat()
    }

    #[tokio::test]
    async fn local_signer_produces_verifiable_envelopes() {
        let signer = LocalSigner::from_pem(LEAF_KEY_PEM, &chain_pem()).unwrap();
        let desc = Descriptor::from_content(MEDIA_TYPE_IMAGE_MANIFEST, b"artifact");

        for media_type in [SignatureMediaType::Jws, SignatureMediaType::Cose] {
            let output = signer
                .sign(&desc, &SignRequest::new(media_type))
                .await
                .unwrap();
            assert_eq!(output.signer_info.certificate_chain.len(), 2);
            assert!(output.annotations.is_empty());

            let content = envelope::parse(media_type, &output.envelope).unwrap();
            envelope::verify_integrity(&content, content.leaf_certificate().unwrap()).unwrap();
        }
    }

    #[tokio::test]
    async fn local_signer_applies_expiry() {
        let signer = LocalSigner::from_pem(LEAF_KEY_PEM, &chain_pem()).unwrap();
        let desc = Descriptor::from_content(MEDIA_TYPE_IMAGE_MANIFEST, b"artifact");

        let mut request = SignRequest::new(SignatureMediaType::Jws);
        request.expiry_duration = Some(Duration::hours(24));
        let output = signer.sign(&desc, &request).await.unwrap();

        let expiry = output.signer_info.expiry.expect("expiry must be set");
        let lifetime = expiry - output.signer_info.signing_time;
        assert_eq!(lifetime, Duration::hours(24));
    }

    #[tokio::test]
    async fn leaf_without_code_signing_eku_is_rejected() {
        let chain = [NOEKU_PEM, CA_PEM].concat();
        let signer = LocalSigner::from_pem(NOEKU_KEY_PEM, &chain).unwrap();
        let desc = Descriptor::from_content(MEDIA_TYPE_IMAGE_MANIFEST, b"artifact");

        let err = signer
            .sign(&desc, &SignRequest::new(SignatureMediaType::Jws))
            .await
            .unwrap_err();
        assert!(matches!(err, SignerError::CertificateNotForCodeSigning));
    }
}
