// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Signature algorithm model and the single place where raw signing and
//! verification primitives are invoked.

pub mod certificate;

use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, UnparsedPublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use certificate::{Certificate, CertificateError, PublicKeyKind};

pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("unsupported key spec: {0}")]
    UnsupportedKeySpec(String),

    #[error("signing algorithm {alg:?} cannot be used with the given {key} key")]
    AlgorithmKeyMismatch { alg: SignatureAlgorithm, key: &'static str },

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("malformed signing key: {0}")]
    MalformedKey(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// Key specification reported by plugins and derived from certificates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeySpec {
    #[serde(rename = "RSA-2048")]
    Rsa2048,
    #[serde(rename = "RSA-3072")]
    Rsa3072,
    #[serde(rename = "RSA-4096")]
    Rsa4096,
    #[serde(rename = "EC-256")]
    Ec256,
    #[serde(rename = "EC-384")]
    Ec384,
    #[serde(rename = "EC-521")]
    Ec521,
}

impl KeySpec {
    /// The signature algorithm mandated for this key spec.
    ///
    /// EC-521 is recognized on the wire but has no supported algorithm
    /// in this implementation.
    pub fn signature_algorithm(&self) -> CryptoResult<SignatureAlgorithm> {
        match self {
            KeySpec::Rsa2048 => Ok(SignatureAlgorithm::RsassaPssSha256),
            KeySpec::Rsa3072 => Ok(SignatureAlgorithm::RsassaPssSha384),
            KeySpec::Rsa4096 => Ok(SignatureAlgorithm::RsassaPssSha512),
            KeySpec::Ec256 => Ok(SignatureAlgorithm::EcdsaSha256),
            KeySpec::Ec384 => Ok(SignatureAlgorithm::EcdsaSha384),
            KeySpec::Ec521 => Err(CryptoError::UnsupportedKeySpec("EC-521".to_string())),
        }
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        match self {
            KeySpec::Rsa2048 | KeySpec::Ec256 => HashAlgorithm::Sha256,
            KeySpec::Rsa3072 | KeySpec::Ec384 => HashAlgorithm::Sha384,
            KeySpec::Rsa4096 | KeySpec::Ec521 => HashAlgorithm::Sha512,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[serde(rename = "SHA-256")]
    Sha256,
    #[serde(rename = "SHA-384")]
    Sha384,
    #[serde(rename = "SHA-512")]
    Sha512,
}

/// Signature algorithms of the envelope formats. RSA keys use RSASSA-PSS,
/// EC keys use plain ECDSA with the matching curve hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    #[serde(rename = "RSASSA-PSS-SHA-256")]
    RsassaPssSha256,
    #[serde(rename = "RSASSA-PSS-SHA-384")]
    RsassaPssSha384,
    #[serde(rename = "RSASSA-PSS-SHA-512")]
    RsassaPssSha512,
    #[serde(rename = "ECDSA-SHA-256")]
    EcdsaSha256,
    #[serde(rename = "ECDSA-SHA-384")]
    EcdsaSha384,
}

impl SignatureAlgorithm {
    /// The JOSE `alg` header value.
    pub fn jws_name(&self) -> &'static str {
        match self {
            SignatureAlgorithm::RsassaPssSha256 => "PS256",
            SignatureAlgorithm::RsassaPssSha384 => "PS384",
            SignatureAlgorithm::RsassaPssSha512 => "PS512",
            SignatureAlgorithm::EcdsaSha256 => "ES256",
            SignatureAlgorithm::EcdsaSha384 => "ES384",
        }
    }

    pub fn from_jws_name(name: &str) -> Option<Self> {
        match name {
            "PS256" => Some(SignatureAlgorithm::RsassaPssSha256),
            "PS384" => Some(SignatureAlgorithm::RsassaPssSha384),
            "PS512" => Some(SignatureAlgorithm::RsassaPssSha512),
            "ES256" => Some(SignatureAlgorithm::EcdsaSha256),
            "ES384" => Some(SignatureAlgorithm::EcdsaSha384),
            _ => None,
        }
    }

    /// The COSE algorithm identifier.
    pub fn cose_value(&self) -> i64 {
        match self {
            SignatureAlgorithm::RsassaPssSha256 => -37,
            SignatureAlgorithm::RsassaPssSha384 => -38,
            SignatureAlgorithm::RsassaPssSha512 => -39,
            SignatureAlgorithm::EcdsaSha256 => -7,
            SignatureAlgorithm::EcdsaSha384 => -35,
        }
    }

    pub fn from_cose_value(value: i64) -> Option<Self> {
        match value {
            -37 => Some(SignatureAlgorithm::RsassaPssSha256),
            -38 => Some(SignatureAlgorithm::RsassaPssSha384),
            -39 => Some(SignatureAlgorithm::RsassaPssSha512),
            -7 => Some(SignatureAlgorithm::EcdsaSha256),
            -35 => Some(SignatureAlgorithm::EcdsaSha384),
            _ => None,
        }
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        match self {
            SignatureAlgorithm::RsassaPssSha256 | SignatureAlgorithm::EcdsaSha256 => {
                HashAlgorithm::Sha256
            }
            SignatureAlgorithm::RsassaPssSha384 | SignatureAlgorithm::EcdsaSha384 => {
                HashAlgorithm::Sha384
            }
            SignatureAlgorithm::RsassaPssSha512 => HashAlgorithm::Sha512,
        }
    }
}

/// Verifies `signature` over `message` with the public key of `cert`,
/// using the declared algorithm. ECDSA signatures are in the raw `r || s`
/// form both envelope formats use.
pub fn verify_signature(
    alg: SignatureAlgorithm,
    cert: &Certificate,
    message: &[u8],
    sig: &[u8],
) -> CryptoResult<()> {
    let key = cert.public_key_kind()?;
    let verifier: (&'static dyn signature::VerificationAlgorithm, &[u8]) = match (alg, &key) {
        (SignatureAlgorithm::EcdsaSha256, PublicKeyKind::Ec256(point)) => {
            (&signature::ECDSA_P256_SHA256_FIXED, point.as_slice())
        }
        (SignatureAlgorithm::EcdsaSha384, PublicKeyKind::Ec384(point)) => {
            (&signature::ECDSA_P384_SHA384_FIXED, point.as_slice())
        }
        (SignatureAlgorithm::RsassaPssSha256, PublicKeyKind::Rsa(der)) => {
            (&signature::RSA_PSS_2048_8192_SHA256, der.as_slice())
        }
        (SignatureAlgorithm::RsassaPssSha384, PublicKeyKind::Rsa(der)) => {
            (&signature::RSA_PSS_2048_8192_SHA384, der.as_slice())
        }
        (SignatureAlgorithm::RsassaPssSha512, PublicKeyKind::Rsa(der)) => {
            (&signature::RSA_PSS_2048_8192_SHA512, der.as_slice())
        }
        _ => {
            return Err(CryptoError::AlgorithmKeyMismatch {
                alg,
                key: key.kind_name(),
            })
        }
    };

    UnparsedPublicKey::new(verifier.0, verifier.1)
        .verify(message, sig)
        .map_err(|_| CryptoError::SignatureInvalid)
}

/// An in-process signing key, PKCS#8 encoded on disk.
pub enum SigningKey {
    EcdsaP256(EcdsaKeyPair),
    EcdsaP384(EcdsaKeyPair),
    Rsa(ring::rsa::KeyPair),
}

impl SigningKey {
    /// Loads a PKCS#8 DER key matching `spec`.
    pub fn from_pkcs8_der(spec: KeySpec, der: &[u8]) -> CryptoResult<Self> {
        let rng = SystemRandom::new();
        match spec {
            KeySpec::Ec256 => {
                let pair = EcdsaKeyPair::from_pkcs8(
                    &signature::ECDSA_P256_SHA256_FIXED_SIGNING,
                    der,
                    &rng,
                )
                .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
                Ok(SigningKey::EcdsaP256(pair))
            }
            KeySpec::Ec384 => {
                let pair = EcdsaKeyPair::from_pkcs8(
                    &signature::ECDSA_P384_SHA384_FIXED_SIGNING,
                    der,
                    &rng,
                )
                .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
                Ok(SigningKey::EcdsaP384(pair))
            }
            KeySpec::Rsa2048 | KeySpec::Rsa3072 | KeySpec::Rsa4096 => {
                let pair = ring::rsa::KeyPair::from_pkcs8(der)
                    .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
                Ok(SigningKey::Rsa(pair))
            }
            KeySpec::Ec521 => Err(CryptoError::UnsupportedKeySpec("EC-521".to_string())),
        }
    }

    /// Signs `message` with `alg`. The algorithm must match the key type.
    pub fn sign(&self, alg: SignatureAlgorithm, message: &[u8]) -> CryptoResult<Vec<u8>> {
        let rng = SystemRandom::new();
        match (self, alg) {
            (SigningKey::EcdsaP256(pair), SignatureAlgorithm::EcdsaSha256)
            | (SigningKey::EcdsaP384(pair), SignatureAlgorithm::EcdsaSha384) => pair
                .sign(&rng, message)
                .map(|sig| sig.as_ref().to_vec())
                .map_err(|e| CryptoError::SigningFailed(e.to_string())),
            (SigningKey::Rsa(pair), SignatureAlgorithm::RsassaPssSha256)
            | (SigningKey::Rsa(pair), SignatureAlgorithm::RsassaPssSha384)
            | (SigningKey::Rsa(pair), SignatureAlgorithm::RsassaPssSha512) => {
                let padding: &'static dyn signature::RsaEncoding = match alg {
                    SignatureAlgorithm::RsassaPssSha256 => &signature::RSA_PSS_SHA256,
                    SignatureAlgorithm::RsassaPssSha384 => &signature::RSA_PSS_SHA384,
                    _ => &signature::RSA_PSS_SHA512,
                };
                let mut sig = vec![0u8; pair.public().modulus_len()];
                pair.sign(padding, &rng, message, &mut sig)
                    .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
                Ok(sig)
            }
            _ => Err(CryptoError::AlgorithmKeyMismatch {
                alg,
                key: match self {
                    SigningKey::Rsa(_) => "RSA",
                    _ => "EC",
                },
            }),
        }
    }
}
