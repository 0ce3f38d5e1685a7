// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The JWS JSON serialization envelope.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    EnvelopeContent, EnvelopeError, EnvelopeResult, ProtectedRepr, SignerInfo, SigningScheme,
    UnsignedAttributes, MEDIA_TYPE_PAYLOAD_V1,
};
use crate::crypto::certificate::Certificate;
use crate::crypto::SignatureAlgorithm;

const HEADER_SIGNING_SCHEME: &str = "io.cncf.notary.signingScheme";
const HEADER_SIGNING_TIME: &str = "io.cncf.notary.signingTime";
const HEADER_AUTHENTIC_SIGNING_TIME: &str = "io.cncf.notary.authenticSigningTime";
const HEADER_EXPIRY: &str = "io.cncf.notary.expiry";

/// Flattened JWS JSON serialization.
#[derive(Serialize, Deserialize)]
struct JwsEnvelope {
    payload: String,

    protected: String,

    header: UnprotectedHeader,

    signature: String,
}

#[derive(Serialize, Deserialize, Default)]
struct UnprotectedHeader {
    /// DER certificate chain, standard base64, leaf first.
    x5c: Vec<String>,

    #[serde(
        rename = "io.cncf.notary.signingAgent",
        skip_serializing_if = "Option::is_none"
    )]
    signing_agent: Option<String>,

    #[serde(
        rename = "io.cncf.notary.timestampSignature",
        skip_serializing_if = "Option::is_none"
    )]
    timestamp_signature: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ProtectedHeader {
    alg: String,

    cty: String,

    crit: Vec<String>,

    #[serde(rename = "io.cncf.notary.signingScheme")]
    signing_scheme: String,

    #[serde(
        rename = "io.cncf.notary.signingTime",
        skip_serializing_if = "Option::is_none"
    )]
    signing_time: Option<DateTime<Utc>>,

    #[serde(
        rename = "io.cncf.notary.authenticSigningTime",
        skip_serializing_if = "Option::is_none"
    )]
    authentic_signing_time: Option<DateTime<Utc>>,

    #[serde(
        rename = "io.cncf.notary.expiry",
        skip_serializing_if = "Option::is_none"
    )]
    expiry: Option<DateTime<Utc>>,
}

pub(super) fn protected_repr(
    payload: &[u8],
    algorithm: SignatureAlgorithm,
    signing_scheme: SigningScheme,
    signing_time: DateTime<Utc>,
    expiry: Option<DateTime<Utc>>,
) -> EnvelopeResult<ProtectedRepr> {
    let mut crit = vec![HEADER_SIGNING_SCHEME.to_string()];
    if expiry.is_some() {
        crit.push(HEADER_EXPIRY.to_string());
    }

    // Signing authorities claim an authentic signing time instead of the
    // plain signing time.
    let (signing_time, authentic_signing_time) = match signing_scheme {
        SigningScheme::NotaryX509 => (Some(signing_time), None),
        SigningScheme::NotaryX509SigningAuthority => {
            crit.push(HEADER_AUTHENTIC_SIGNING_TIME.to_string());
            (None, Some(signing_time))
        }
    };

    let protected = ProtectedHeader {
        alg: algorithm.jws_name().to_string(),
        cty: MEDIA_TYPE_PAYLOAD_V1.to_string(),
        crit,
        signing_scheme: signing_scheme.as_str().to_string(),
        signing_time,
        authentic_signing_time,
        expiry,
    };
    let protected_json =
        serde_json::to_vec(&protected).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

    Ok(ProtectedRepr::Jws {
        protected_b64: URL_SAFE_NO_PAD.encode(protected_json),
        payload_b64: URL_SAFE_NO_PAD.encode(payload),
    })
}

pub(super) fn assemble(
    protected_b64: String,
    payload_b64: String,
    signature: &[u8],
    certificate_chain: &[Certificate],
    unsigned: &UnsignedAttributes,
) -> EnvelopeResult<Vec<u8>> {
    let envelope = JwsEnvelope {
        payload: payload_b64,
        protected: protected_b64,
        header: UnprotectedHeader {
            x5c: certificate_chain
                .iter()
                .map(|c| STANDARD.encode(c.as_der()))
                .collect(),
            signing_agent: unsigned.signing_agent.clone(),
            timestamp_signature: unsigned
                .timestamp_token
                .as_ref()
                .map(|t| STANDARD.encode(t)),
        },
        signature: URL_SAFE_NO_PAD.encode(signature),
    };
    serde_json::to_vec(&envelope).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

pub(super) fn parse(bytes: &[u8]) -> EnvelopeResult<EnvelopeContent> {
    let envelope: JwsEnvelope = serde_json::from_slice(bytes)
        .map_err(|e| EnvelopeError::Malformed(format!("invalid JWS envelope: {e}")))?;

    let protected_json = URL_SAFE_NO_PAD
        .decode(&envelope.protected)
        .map_err(|e| EnvelopeError::Malformed(format!("invalid protected header: {e}")))?;
    let protected: ProtectedHeader = serde_json::from_slice(&protected_json)
        .map_err(|e| EnvelopeError::Malformed(format!("invalid protected header: {e}")))?;

    let signing_algorithm = SignatureAlgorithm::from_jws_name(&protected.alg)
        .ok_or_else(|| EnvelopeError::UnsupportedAlgorithm(protected.alg.clone()))?;
    let signing_scheme = SigningScheme::parse(&protected.signing_scheme)?;

    let payload = URL_SAFE_NO_PAD
        .decode(&envelope.payload)
        .map_err(|e| EnvelopeError::Malformed(format!("invalid payload encoding: {e}")))?;
    let signature = URL_SAFE_NO_PAD
        .decode(&envelope.signature)
        .map_err(|e| EnvelopeError::Malformed(format!("invalid signature encoding: {e}")))?;

    let mut certificate_chain = Vec::with_capacity(envelope.header.x5c.len());
    for cert_b64 in &envelope.header.x5c {
        let der = STANDARD
            .decode(cert_b64)
            .map_err(|e| EnvelopeError::Malformed(format!("invalid x5c encoding: {e}")))?;
        let cert =
            Certificate::from_der(der).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        certificate_chain.push(cert);
    }

    let timestamp_token = match &envelope.header.timestamp_signature {
        Some(token_b64) => Some(STANDARD.decode(token_b64).map_err(|e| {
            EnvelopeError::Malformed(format!("invalid timestamp signature encoding: {e}"))
        })?),
        None => None,
    };

    let signing_time = protected
        .signing_time
        .or(protected.authentic_signing_time)
        .ok_or_else(|| {
            EnvelopeError::Malformed("envelope carries no signing time claim".to_string())
        })?;

    // The signed region of a JWS is the ASCII `protected.payload` pair.
    let signed_bytes = format!("{}.{}", envelope.protected, envelope.payload).into_bytes();

    Ok(EnvelopeContent {
        payload,
        payload_content_type: protected.cty,
        signed_bytes,
        signer_info: SignerInfo {
            signing_scheme,
            signing_algorithm,
            certificate_chain,
            signing_time,
            expiry: protected.expiry,
            authentic_signing_time: protected.authentic_signing_time,
            signature,
        },
        unsigned: UnsignedAttributes {
            signing_agent: envelope.header.signing_agent,
            timestamp_token,
        },
    })
}
