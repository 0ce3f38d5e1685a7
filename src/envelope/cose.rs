// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The COSE Sign1 envelope, hand-assembled over CBOR values.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_cbor::tags::Tagged;
use serde_cbor::Value;

use super::{
    EnvelopeContent, EnvelopeError, EnvelopeResult, ProtectedRepr, SignerInfo, SigningScheme,
    UnsignedAttributes, MEDIA_TYPE_PAYLOAD_V1,
};
use crate::crypto::certificate::Certificate;
use crate::crypto::SignatureAlgorithm;

/// COSE_Sign1 tag.
const TAG_COSE_SIGN1: u64 = 18;

const LABEL_ALG: i128 = 1;
const LABEL_CRIT: i128 = 2;
const LABEL_CTY: i128 = 3;
const LABEL_X5CHAIN: i128 = 33;

const HEADER_SIGNING_SCHEME: &str = "io.cncf.notary.signingScheme";
const HEADER_SIGNING_TIME: &str = "io.cncf.notary.signingTime";
const HEADER_AUTHENTIC_SIGNING_TIME: &str = "io.cncf.notary.authenticSigningTime";
const HEADER_EXPIRY: &str = "io.cncf.notary.expiry";
const HEADER_SIGNING_AGENT: &str = "io.cncf.notary.signingAgent";
const HEADER_TIMESTAMP_SIGNATURE: &str = "io.cncf.notary.timestampSignature";

fn malformed(msg: impl Into<String>) -> EnvelopeError {
    EnvelopeError::Malformed(msg.into())
}

pub(super) fn protected_repr(
    algorithm: SignatureAlgorithm,
    signing_scheme: SigningScheme,
    signing_time: DateTime<Utc>,
    expiry: Option<DateTime<Utc>>,
) -> EnvelopeResult<ProtectedRepr> {
    let mut map: BTreeMap<Value, Value> = BTreeMap::new();
    map.insert(
        Value::Integer(LABEL_ALG),
        Value::Integer(algorithm.cose_value() as i128),
    );
    map.insert(
        Value::Integer(LABEL_CTY),
        Value::Text(MEDIA_TYPE_PAYLOAD_V1.to_string()),
    );
    map.insert(
        Value::Text(HEADER_SIGNING_SCHEME.to_string()),
        Value::Text(signing_scheme.as_str().to_string()),
    );

    let mut crit = vec![Value::Text(HEADER_SIGNING_SCHEME.to_string())];
    let time_header = match signing_scheme {
        SigningScheme::NotaryX509 => HEADER_SIGNING_TIME,
        SigningScheme::NotaryX509SigningAuthority => {
            crit.push(Value::Text(HEADER_AUTHENTIC_SIGNING_TIME.to_string()));
            HEADER_AUTHENTIC_SIGNING_TIME
        }
    };
    map.insert(
        Value::Text(time_header.to_string()),
        Value::Integer(signing_time.timestamp() as i128),
    );
    if let Some(expiry) = expiry {
        crit.push(Value::Text(HEADER_EXPIRY.to_string()));
        map.insert(
            Value::Text(HEADER_EXPIRY.to_string()),
            Value::Integer(expiry.timestamp() as i128),
        );
    }
    map.insert(Value::Integer(LABEL_CRIT), Value::Array(crit));

    let protected =
        serde_cbor::to_vec(&Value::Map(map)).map_err(|e| malformed(e.to_string()))?;
    Ok(ProtectedRepr::Cose { protected })
}

/// `Sig_structure` for COSE_Sign1 with no external data.
pub(super) fn sig_structure(protected: &[u8], payload: &[u8]) -> Vec<u8> {
    let structure = Value::Array(vec![
        Value::Text("Signature1".to_string()),
        Value::Bytes(protected.to_vec()),
        Value::Bytes(Vec::new()),
        Value::Bytes(payload.to_vec()),
    ]);
    // Serialization of CBOR values cannot fail.
    serde_cbor::to_vec(&structure).unwrap_or_default()
}

pub(super) fn assemble(
    protected: Vec<u8>,
    payload: Vec<u8>,
    signature: &[u8],
    certificate_chain: &[Certificate],
    unsigned: &UnsignedAttributes,
) -> EnvelopeResult<Vec<u8>> {
    let mut unprotected: BTreeMap<Value, Value> = BTreeMap::new();
    unprotected.insert(
        Value::Integer(LABEL_X5CHAIN),
        Value::Array(
            certificate_chain
                .iter()
                .map(|c| Value::Bytes(c.as_der().to_vec()))
                .collect(),
        ),
    );
    if let Some(agent) = &unsigned.signing_agent {
        unprotected.insert(
            Value::Text(HEADER_SIGNING_AGENT.to_string()),
            Value::Text(agent.clone()),
        );
    }
    if let Some(token) = &unsigned.timestamp_token {
        unprotected.insert(
            Value::Text(HEADER_TIMESTAMP_SIGNATURE.to_string()),
            Value::Bytes(token.clone()),
        );
    }

    let sign1 = Value::Array(vec![
        Value::Bytes(protected),
        Value::Map(unprotected),
        Value::Bytes(payload),
        Value::Bytes(signature.to_vec()),
    ]);
    serde_cbor::to_vec(&Tagged::new(Some(TAG_COSE_SIGN1), sign1))
        .map_err(|e| malformed(e.to_string()))
}

pub(super) fn parse(bytes: &[u8]) -> EnvelopeResult<EnvelopeContent> {
    let tagged: Tagged<Value> =
        serde_cbor::from_slice(bytes).map_err(|e| malformed(format!("invalid COSE: {e}")))?;
    if let Some(tag) = tagged.tag {
        if tag != TAG_COSE_SIGN1 {
            return Err(malformed(format!("unexpected CBOR tag {tag}")));
        }
    }
    let Value::Array(items) = tagged.value else {
        return Err(malformed("COSE_Sign1 must be an array"));
    };
    let [Value::Bytes(protected), Value::Map(unprotected), Value::Bytes(payload), Value::Bytes(signature)] =
        items.as_slice()
    else {
        return Err(malformed("COSE_Sign1 must have four entries"));
    };

    let Value::Map(headers) = serde_cbor::from_slice(protected)
        .map_err(|e| malformed(format!("invalid protected header: {e}")))?
    else {
        return Err(malformed("protected header must be a map"));
    };

    let alg = match headers.get(&Value::Integer(LABEL_ALG)) {
        Some(Value::Integer(alg)) => SignatureAlgorithm::from_cose_value(*alg as i64)
            .ok_or_else(|| EnvelopeError::UnsupportedAlgorithm(alg.to_string()))?,
        _ => return Err(malformed("missing algorithm header")),
    };
    let payload_content_type = match headers.get(&Value::Integer(LABEL_CTY)) {
        Some(Value::Text(cty)) => cty.clone(),
        _ => return Err(malformed("missing content type header")),
    };
    let signing_scheme = match headers.get(&Value::Text(HEADER_SIGNING_SCHEME.to_string())) {
        Some(Value::Text(scheme)) => SigningScheme::parse(scheme)?,
        _ => return Err(malformed("missing signing scheme header")),
    };

    let time_at = |key: &str| -> EnvelopeResult<Option<DateTime<Utc>>> {
        match headers.get(&Value::Text(key.to_string())) {
            Some(Value::Integer(secs)) => Ok(Some(
                DateTime::from_timestamp(*secs as i64, 0)
                    .ok_or_else(|| malformed(format!("{key} is out of range")))?,
            )),
            Some(_) => Err(malformed(format!("{key} must be an epoch integer"))),
            None => Ok(None),
        }
    };
    let claimed_signing_time = time_at(HEADER_SIGNING_TIME)?;
    let authentic_signing_time = time_at(HEADER_AUTHENTIC_SIGNING_TIME)?;
    let expiry = time_at(HEADER_EXPIRY)?;
    let signing_time = claimed_signing_time
        .or(authentic_signing_time)
        .ok_or_else(|| malformed("envelope carries no signing time claim"))?;

    let mut certificate_chain = Vec::new();
    if let Some(Value::Array(certs)) = unprotected.get(&Value::Integer(LABEL_X5CHAIN)) {
        for cert in certs {
            let Value::Bytes(der) = cert else {
                return Err(malformed("x5chain entries must be byte strings"));
            };
            certificate_chain.push(
                Certificate::from_der(der.clone()).map_err(|e| malformed(e.to_string()))?,
            );
        }
    }

    let signing_agent = match unprotected.get(&Value::Text(HEADER_SIGNING_AGENT.to_string())) {
        Some(Value::Text(agent)) => Some(agent.clone()),
        _ => None,
    };
    let timestamp_token =
        match unprotected.get(&Value::Text(HEADER_TIMESTAMP_SIGNATURE.to_string())) {
            Some(Value::Bytes(token)) => Some(token.clone()),
            _ => None,
        };

    Ok(EnvelopeContent {
        payload: payload.clone(),
        payload_content_type,
        signed_bytes: sig_structure(protected, payload),
        signer_info: SignerInfo {
            signing_scheme,
            signing_algorithm: alg,
            certificate_chain,
            signing_time,
            expiry,
            authentic_signing_time,
            signature: signature.clone(),
        },
        unsigned: UnsignedAttributes {
            signing_agent,
            timestamp_token,
        },
    })
}
