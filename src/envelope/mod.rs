// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Signature envelope codecs: opaque envelope bytes in, a parsed
//! [`EnvelopeContent`] out, and the builder used when producing new
//! envelopes. JWS and COSE Sign1 are supported.

mod cose;
mod jws;
pub mod payload;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::certificate::Certificate;
use crate::crypto::{self, CryptoError, SignatureAlgorithm};

pub use payload::{Payload, MEDIA_TYPE_PAYLOAD_V1};

pub type EnvelopeResult<T> = std::result::Result<T, EnvelopeError>;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("malformed signature envelope: {0}")]
    Malformed(String),

    #[error("unsupported signature envelope media type {0:?}")]
    UnsupportedMediaType(String),

    #[error("unsupported signing algorithm {0:?} in signature envelope")]
    UnsupportedAlgorithm(String),

    #[error("signature envelope integrity check failed: {0}")]
    IntegrityFailed(#[source] CryptoError),
}

/// Envelope media types of the signature formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SignatureMediaType {
    Jws,
    Cose,
}

impl SignatureMediaType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SignatureMediaType::Jws => "application/jose+json",
            SignatureMediaType::Cose => "application/cose",
        }
    }
}

impl FromStr for SignatureMediaType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> EnvelopeResult<Self> {
        match s {
            "application/jose+json" => Ok(SignatureMediaType::Jws),
            "application/cose" => Ok(SignatureMediaType::Cose),
            other => Err(EnvelopeError::UnsupportedMediaType(other.to_string())),
        }
    }
}

impl TryFrom<String> for SignatureMediaType {
    type Error = EnvelopeError;

    fn try_from(s: String) -> EnvelopeResult<Self> {
        s.parse()
    }
}

impl From<SignatureMediaType> for String {
    fn from(m: SignatureMediaType) -> Self {
        m.as_str().to_string()
    }
}

impl fmt::Display for SignatureMediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The signing scheme claimed by the envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SigningScheme {
    /// Keys owned by the artifact publisher.
    #[default]
    NotaryX509,
    /// Keys owned by a signing authority.
    NotaryX509SigningAuthority,
}

impl SigningScheme {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SigningScheme::NotaryX509 => "notary.x509",
            SigningScheme::NotaryX509SigningAuthority => "notary.x509.signingAuthority",
        }
    }

    pub fn parse(s: &str) -> EnvelopeResult<Self> {
        match s {
            "notary.x509" => Ok(SigningScheme::NotaryX509),
            "notary.x509.signingAuthority" => Ok(SigningScheme::NotaryX509SigningAuthority),
            other => Err(EnvelopeError::Malformed(format!(
                "unknown signing scheme {other:?}"
            ))),
        }
    }
}

/// The signed portion of a parsed envelope.
#[derive(Clone, Debug)]
pub struct SignerInfo {
    pub signing_scheme: SigningScheme,

    pub signing_algorithm: SignatureAlgorithm,

    /// Ordered certificate chain, leaf first.
    pub certificate_chain: Vec<Certificate>,

    pub signing_time: DateTime<Utc>,

    pub expiry: Option<DateTime<Utc>>,

    /// Set by signing authorities in place of the signing time claim.
    pub authentic_signing_time: Option<DateTime<Utc>>,

    pub signature: Vec<u8>,
}

/// Attributes outside the signed region.
#[derive(Clone, Debug, Default)]
pub struct UnsignedAttributes {
    pub signing_agent: Option<String>,

    /// Opaque RFC 3161 timestamp countersignature, when present.
    pub timestamp_token: Option<Vec<u8>>,
}

/// A parsed view over raw envelope bytes.
#[derive(Clone, Debug)]
pub struct EnvelopeContent {
    pub payload: Vec<u8>,

    pub payload_content_type: String,

    /// The exact bytes covered by the signature, reconstructed from the
    /// envelope; integrity verification runs over these.
    pub signed_bytes: Vec<u8>,

    pub signer_info: SignerInfo,

    pub unsigned: UnsignedAttributes,
}

impl EnvelopeContent {
    /// Parses the payload into its target-artifact form.
    pub fn payload(&self) -> EnvelopeResult<Payload> {
        Payload::from_bytes(&self.payload)
    }

    pub fn leaf_certificate(&self) -> EnvelopeResult<&Certificate> {
        self.signer_info
            .certificate_chain
            .first()
            .ok_or_else(|| EnvelopeError::Malformed("empty certificate chain".to_string()))
    }
}

/// Parses envelope bytes of the given media type.
pub fn parse(media_type: SignatureMediaType, bytes: &[u8]) -> EnvelopeResult<EnvelopeContent> {
    let content = match media_type {
        SignatureMediaType::Jws => jws::parse(bytes)?,
        SignatureMediaType::Cose => cose::parse(bytes)?,
    };
    // Any envelope must carry a well-formed target-artifact payload.
    content.payload()?;
    if content.signer_info.certificate_chain.is_empty() {
        return Err(EnvelopeError::Malformed(
            "empty certificate chain".to_string(),
        ));
    }
    Ok(content)
}

/// Cryptographically verifies the envelope signature against `cert`, using
/// the envelope's declared algorithm over its signed region. This is the
/// only integrity primitive the verification pipeline invokes.
pub fn verify_integrity(content: &EnvelopeContent, cert: &Certificate) -> EnvelopeResult<()> {
    crypto::verify_signature(
        content.signer_info.signing_algorithm,
        cert,
        &content.signed_bytes,
        &content.signer_info.signature,
    )
    .map_err(EnvelopeError::IntegrityFailed)
}

/// Builds a new envelope in two phases: the signing input is computed
/// first, signed out-of-band (local key or plugin), and the envelope is
/// then assembled around the returned signature. Both phases share the
/// serialized protected headers, so the signed bytes are exactly the
/// headers the envelope carries.
pub struct EnvelopeBuilder {
    media_type: SignatureMediaType,
    algorithm: SignatureAlgorithm,
    payload: Vec<u8>,
    repr: ProtectedRepr,
}

enum ProtectedRepr {
    Jws {
        protected_b64: String,
        payload_b64: String,
    },
    Cose {
        protected: Vec<u8>,
    },
}

impl EnvelopeBuilder {
    pub fn new(
        media_type: SignatureMediaType,
        payload: Vec<u8>,
        algorithm: SignatureAlgorithm,
        signing_scheme: SigningScheme,
        signing_time: DateTime<Utc>,
        expiry: Option<DateTime<Utc>>,
    ) -> EnvelopeResult<Self> {
        let repr = match media_type {
            SignatureMediaType::Jws => {
                jws::protected_repr(&payload, algorithm, signing_scheme, signing_time, expiry)?
            }
            SignatureMediaType::Cose => {
                cose::protected_repr(algorithm, signing_scheme, signing_time, expiry)?
            }
        };
        Ok(Self {
            media_type,
            algorithm,
            payload,
            repr,
        })
    }

    pub fn media_type(&self) -> SignatureMediaType {
        self.media_type
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// The exact bytes to be signed.
    pub fn signing_input(&self) -> Vec<u8> {
        match &self.repr {
            ProtectedRepr::Jws {
                protected_b64,
                payload_b64,
            } => format!("{protected_b64}.{payload_b64}").into_bytes(),
            ProtectedRepr::Cose { protected } => cose::sig_structure(protected, &self.payload),
        }
    }

    /// Assembles the final envelope around `signature`.
    pub fn assemble(
        self,
        signature: &[u8],
        certificate_chain: &[Certificate],
        unsigned: &UnsignedAttributes,
    ) -> EnvelopeResult<Vec<u8>> {
        if certificate_chain.is_empty() {
            return Err(EnvelopeError::Malformed(
                "empty certificate chain".to_string(),
            ));
        }
        match self.repr {
            ProtectedRepr::Jws {
                protected_b64,
                payload_b64,
            } => jws::assemble(
                protected_b64,
                payload_b64,
                signature,
                certificate_chain,
                unsigned,
            ),
            ProtectedRepr::Cose { protected } => cose::assemble(
                protected,
                self.payload,
                signature,
                certificate_chain,
                unsigned,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeySpec, SigningKey};
    use crate::oci::{Descriptor, MEDIA_TYPE_IMAGE_MANIFEST};
    use x509_parser::pem::Pem;

    const LEAF_PEM: &[u8] = include_bytes!("../../test_data/certs/leaf.pem");
    const LEAF_KEY_PEM: &[u8] = include_bytes!("../../test_data/certs/leaf.key");
    const CA_PEM: &[u8] = include_bytes!("../../test_data/certs/ca.pem");

    fn test_chain() -> Vec<Certificate> {
        let mut chain = Certificate::from_pem_chain(LEAF_PEM).unwrap();
        chain.extend(Certificate::from_pem_chain(CA_PEM).unwrap());
        chain
    }

    fn test_key() -> SigningKey {
        let der = Pem::iter_from_buffer(LEAF_KEY_PEM)
            .next()
            .unwrap()
            .unwrap()
            .contents;
        SigningKey::from_pkcs8_der(KeySpec::Ec256, &der).unwrap()
    }

    fn build_envelope(media_type: SignatureMediaType, expiry: Option<DateTime<Utc>>) -> Vec<u8> {
        let desc = Descriptor::from_content(MEDIA_TYPE_IMAGE_MANIFEST, b"the artifact");
        let payload = Payload::new(desc).to_bytes().unwrap();
        let builder = EnvelopeBuilder::new(
            media_type,
            payload,
            SignatureAlgorithm::EcdsaSha256,
            SigningScheme::NotaryX509,
            Utc::now(),
            expiry,
        )
        .unwrap();
        let signature = test_key()
            .sign(SignatureAlgorithm::EcdsaSha256, &builder.signing_input())
            .unwrap();
        let unsigned = UnsignedAttributes {
            signing_agent: Some("notation-rs/0.1".to_string()),
            timestamp_token: None,
        };
        builder
            .assemble(&signature, &test_chain(), &unsigned)
            .unwrap()
    }

    #[test]
    fn jws_build_parse_verify() {
        let raw = build_envelope(SignatureMediaType::Jws, None);
        let content = parse(SignatureMediaType::Jws, &raw).unwrap();

        assert_eq!(content.payload_content_type, MEDIA_TYPE_PAYLOAD_V1);
        assert_eq!(content.signer_info.certificate_chain.len(), 2);
        assert_eq!(
            content.unsigned.signing_agent.as_deref(),
            Some("notation-rs/0.1")
        );
        verify_integrity(&content, content.leaf_certificate().unwrap()).unwrap();
    }

    #[test]
    fn cose_build_parse_verify() {
        let raw = build_envelope(SignatureMediaType::Cose, None);
        let content = parse(SignatureMediaType::Cose, &raw).unwrap();

        assert_eq!(content.payload_content_type, MEDIA_TYPE_PAYLOAD_V1);
        assert_eq!(content.signer_info.certificate_chain.len(), 2);
        verify_integrity(&content, content.leaf_certificate().unwrap()).unwrap();
    }

    #[test]
    fn expiry_round_trips() {
        let expiry = Utc::now() + chrono::Duration::hours(1);
        for media_type in [SignatureMediaType::Jws, SignatureMediaType::Cose] {
            let raw = build_envelope(media_type, Some(expiry));
            let content = parse(media_type, &raw).unwrap();
            let parsed_expiry = content.signer_info.expiry.unwrap();
            assert!((parsed_expiry - expiry).num_seconds().abs() <= 1);
        }
    }

    #[test]
    fn tampered_payload_fails_integrity() {
        for media_type in [SignatureMediaType::Jws, SignatureMediaType::Cose] {
            let raw = build_envelope(media_type, None);
            let content = parse(media_type, &raw).unwrap();

            let mut tampered = content.clone();
            tampered.signed_bytes[0] ^= 0xff;
            let err = verify_integrity(&tampered, tampered.leaf_certificate().unwrap());
            assert!(err.is_err(), "{media_type}: tampering must be detected");
        }
    }

    #[test]
    fn structural_garbage_is_malformed() {
        assert!(parse(SignatureMediaType::Jws, b"not json").is_err());
        assert!(parse(SignatureMediaType::Cose, b"\xff\xff\xff").is_err());
    }

    #[test]
    fn media_type_strings() {
        assert_eq!(
            "application/jose+json".parse::<SignatureMediaType>().unwrap(),
            SignatureMediaType::Jws
        );
        assert_eq!(
            "application/cose".parse::<SignatureMediaType>().unwrap(),
            SignatureMediaType::Cose
        );
        assert!("application/pgp".parse::<SignatureMediaType>().is_err());
    }
}
