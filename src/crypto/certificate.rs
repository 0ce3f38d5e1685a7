// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Owned DER certificate handle over `x509-parser`, with the checks the
//! signing and verification pipelines need: thumbprints, CA and
//! self-signed classification, issuer verification, extended key usage,
//! validity windows and revocation endpoint discovery.

use chrono::{DateTime, Utc};
use sha2::Digest as _;
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{DistributionPointName, GeneralName, ParsedExtension};
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;

use super::KeySpec;

const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_EC_CURVE_P256: &str = "1.2.840.10045.3.1.7";
const OID_EC_CURVE_P384: &str = "1.3.132.0.34";
const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_AD_OCSP: &str = "1.3.6.1.5.5.7.48.1";

pub type CertificateResult<T> = std::result::Result<T, CertificateError>;

#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("malformed certificate: {0}")]
    Malformed(String),

    #[error("no certificate found in PEM input")]
    EmptyPem,

    #[error("unsupported public key algorithm {oid}")]
    UnsupportedPublicKey { oid: String },
}

/// The public key material of a certificate in the form ring consumes.
pub enum PublicKeyKind {
    /// Uncompressed P-256 point.
    Ec256(Vec<u8>),
    /// Uncompressed P-384 point.
    Ec384(Vec<u8>),
    /// DER `RSAPublicKey`.
    Rsa(Vec<u8>),
}

impl PublicKeyKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            PublicKeyKind::Ec256(_) | PublicKeyKind::Ec384(_) => "EC",
            PublicKeyKind::Rsa(_) => "RSA",
        }
    }
}

/// An owned DER-encoded X.509 certificate.
///
/// The certificate is reparsed on demand; `x509-parser` borrows from the
/// input so the parsed view cannot be stored alongside the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject().unwrap_or_default())
            .field("thumbprint", &self.thumbprint())
            .finish()
    }
}

impl Certificate {
    pub fn from_der(der: Vec<u8>) -> CertificateResult<Self> {
        let cert = Self { der };
        cert.parsed_with(|_| Ok(()))?;
        Ok(cert)
    }

    /// Parses every CERTIFICATE block from a PEM buffer, in order.
    pub fn from_pem_chain(pem: &[u8]) -> CertificateResult<Vec<Self>> {
        let mut certs = Vec::new();
        for block in Pem::iter_from_buffer(pem) {
            let block = block.map_err(|e| CertificateError::Malformed(e.to_string()))?;
            if block.label != "CERTIFICATE" {
                continue;
            }
            certs.push(Self::from_der(block.contents)?);
        }
        if certs.is_empty() {
            return Err(CertificateError::EmptyPem);
        }
        Ok(certs)
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    /// Hex SHA-256 over the DER encoding.
    pub fn thumbprint(&self) -> String {
        format!("{:x}", sha2::Sha256::digest(&self.der))
    }

    fn parsed_with<T>(
        &self,
        f: impl FnOnce(&X509Certificate<'_>) -> CertificateResult<T>,
    ) -> CertificateResult<T> {
        let (rest, cert) = X509Certificate::from_der(&self.der)
            .map_err(|e| CertificateError::Malformed(e.to_string()))?;
        if !rest.is_empty() {
            return Err(CertificateError::Malformed(
                "trailing bytes after certificate".to_string(),
            ));
        }
        f(&cert)
    }

    pub fn subject(&self) -> CertificateResult<String> {
        self.parsed_with(|cert| Ok(cert.subject().to_string()))
    }

    pub fn issuer(&self) -> CertificateResult<String> {
        self.parsed_with(|cert| Ok(cert.issuer().to_string()))
    }

    pub fn is_ca(&self) -> CertificateResult<bool> {
        self.parsed_with(|cert| Ok(cert.is_ca()))
    }

    /// A certificate is self-signed when subject equals issuer and its
    /// signature verifies with its own public key.
    pub fn is_self_signed(&self) -> CertificateResult<bool> {
        self.parsed_with(|cert| {
            Ok(cert.subject().as_raw() == cert.issuer().as_raw()
                && cert.verify_signature(None).is_ok())
        })
    }

    /// Whether this certificate was issued and signed by `issuer`.
    pub fn verify_issued_by(&self, issuer: &Certificate) -> CertificateResult<bool> {
        self.parsed_with(|child| {
            issuer.parsed_with(|parent| {
                Ok(child.issuer().as_raw() == parent.subject().as_raw()
                    && child.verify_signature(Some(parent.public_key())).is_ok())
            })
        })
    }

    pub fn has_code_signing_eku(&self) -> CertificateResult<bool> {
        self.parsed_with(|cert| {
            let eku = cert
                .extended_key_usage()
                .map_err(|e| CertificateError::Malformed(e.to_string()))?;
            Ok(eku.map(|ext| ext.value.code_signing).unwrap_or(false))
        })
    }

    pub fn valid_at(&self, at: DateTime<Utc>) -> CertificateResult<bool> {
        self.parsed_with(|cert| {
            let t = at.timestamp();
            let validity = cert.validity();
            Ok(validity.not_before.timestamp() <= t && t <= validity.not_after.timestamp())
        })
    }

    pub fn public_key_kind(&self) -> CertificateResult<PublicKeyKind> {
        self.parsed_with(|cert| {
            let spki = cert.public_key();
            let alg = spki.algorithm.algorithm.to_id_string();
            let key_bytes = spki.subject_public_key.data.to_vec();
            match alg.as_str() {
                OID_RSA_ENCRYPTION => Ok(PublicKeyKind::Rsa(key_bytes)),
                OID_EC_PUBLIC_KEY => {
                    let curve = spki
                        .algorithm
                        .parameters
                        .as_ref()
                        .and_then(|p| p.as_oid().ok())
                        .map(|o| o.to_id_string());
                    match curve.as_deref() {
                        Some(OID_EC_CURVE_P256) => Ok(PublicKeyKind::Ec256(key_bytes)),
                        Some(OID_EC_CURVE_P384) => Ok(PublicKeyKind::Ec384(key_bytes)),
                        other => Err(CertificateError::UnsupportedPublicKey {
                            oid: other.unwrap_or("missing curve").to_string(),
                        }),
                    }
                }
                other => Err(CertificateError::UnsupportedPublicKey {
                    oid: other.to_string(),
                }),
            }
        })
    }

    /// Derives the key spec from the certificate public key.
    pub fn key_spec(&self) -> CertificateResult<KeySpec> {
        match self.public_key_kind()? {
            PublicKeyKind::Ec256(_) => Ok(KeySpec::Ec256),
            PublicKeyKind::Ec384(_) => Ok(KeySpec::Ec384),
            PublicKeyKind::Rsa(der) => {
                // RSAPublicKey ::= SEQUENCE { modulus INTEGER, ... }; the
                // modulus length keys the spec. Parse just enough of it.
                let bits = rsa_modulus_bits(&der).ok_or_else(|| CertificateError::Malformed(
                    "invalid RSAPublicKey encoding".to_string(),
                ))?;
                match bits {
                    2048 => Ok(KeySpec::Rsa2048),
                    3072 => Ok(KeySpec::Rsa3072),
                    4096 => Ok(KeySpec::Rsa4096),
                    other => Err(CertificateError::UnsupportedPublicKey {
                        oid: format!("RSA-{other}"),
                    }),
                }
            }
        }
    }

    /// Revocation endpoints advertised by the certificate, used to decide
    /// whether a revocation status can be determined at all.
    pub fn revocation_endpoints(&self) -> CertificateResult<RevocationEndpoints> {
        self.parsed_with(|cert| {
            let mut endpoints = RevocationEndpoints::default();
            for ext in cert.extensions() {
                match ext.parsed_extension() {
                    ParsedExtension::AuthorityInfoAccess(aia) => {
                        for desc in &aia.accessdescs {
                            if desc.access_method.to_id_string() == OID_AD_OCSP {
                                if let GeneralName::URI(uri) = &desc.access_location {
                                    endpoints.ocsp.push(uri.to_string());
                                }
                            }
                        }
                    }
                    ParsedExtension::CRLDistributionPoints(points) => {
                        for point in &points.points {
                            if let Some(DistributionPointName::FullName(names)) =
                                &point.distribution_point
                            {
                                for name in names {
                                    if let GeneralName::URI(uri) = name {
                                        endpoints.crl.push(uri.to_string());
                                    }
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(endpoints)
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct RevocationEndpoints {
    pub ocsp: Vec<String>,
    pub crl: Vec<String>,
}

impl RevocationEndpoints {
    pub fn is_empty(&self) -> bool {
        self.ocsp.is_empty() && self.crl.is_empty()
    }
}

/// Reads the modulus bit length out of a DER `RSAPublicKey`.
fn rsa_modulus_bits(der: &[u8]) -> Option<usize> {
    use x509_parser::der_parser::ber::{parse_ber_sequence, BerObjectContent};

    let (_, seq) = parse_ber_sequence(der).ok()?;
    let objects = seq.as_sequence().ok()?;
    let BerObjectContent::Integer(modulus) = objects.first()?.content else {
        return None;
    };
    // Positive INTEGERs with the high bit set carry a leading zero octet.
    let significant = modulus.iter().position(|&b| b != 0)?;
    Some((modulus.len() - significant) * 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA_PEM: &[u8] = include_bytes!("../../test_data/certs/ca.pem");
    const LEAF_PEM: &[u8] = include_bytes!("../../test_data/certs/leaf.pem");
    const OTHER_CA_PEM: &[u8] = include_bytes!("../../test_data/certs/other-ca.pem");
    const NOEKU_PEM: &[u8] = include_bytes!("../../test_data/certs/noeku.pem");

    fn load(pem: &[u8]) -> Certificate {
        Certificate::from_pem_chain(pem).unwrap().remove(0)
    }

    #[test]
    fn classify_ca_and_leaf() {
        let ca = load(CA_PEM);
        let leaf = load(LEAF_PEM);

        assert!(ca.is_ca().unwrap());
        assert!(ca.is_self_signed().unwrap());
        assert!(!leaf.is_ca().unwrap());
        assert!(!leaf.is_self_signed().unwrap());
    }

    #[test]
    fn issuer_verification() {
        let ca = load(CA_PEM);
        let other = load(OTHER_CA_PEM);
        let leaf = load(LEAF_PEM);

        assert!(leaf.verify_issued_by(&ca).unwrap());
        assert!(!leaf.verify_issued_by(&other).unwrap());
    }

    #[test]
    fn code_signing_eku() {
        assert!(load(LEAF_PEM).has_code_signing_eku().unwrap());
        assert!(!load(NOEKU_PEM).has_code_signing_eku().unwrap());
    }

    #[test]
    fn key_spec_of_test_leaf() {
        assert_eq!(load(LEAF_PEM).key_spec().unwrap(), KeySpec::Ec256);
    }

    #[test]
    fn thumbprint_is_hex_sha256() {
        let tp = load(CA_PEM).thumbprint();
        assert_eq!(tp.len(), 64);
        assert!(tp.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn validity_window() {
        let leaf = load(LEAF_PEM);
        assert!(leaf.valid_at(Utc::now()).unwrap());
        let past = DateTime::from_timestamp(0, 0).unwrap();
        assert!(!leaf.valid_at(past).unwrap());
    }

    #[test]
    fn test_fixtures_have_no_revocation_endpoints() {
        assert!(load(LEAF_PEM).revocation_endpoints().unwrap().is_empty());
    }
}
