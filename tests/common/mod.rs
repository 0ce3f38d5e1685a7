// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Shared fixtures for the end-to-end signing and verification tests.
#![allow(dead_code)]

use std::collections::BTreeMap;

use notation_rs::crypto::certificate::Certificate;
use notation_rs::oci::{Descriptor, MEDIA_TYPE_IMAGE_MANIFEST};
use notation_rs::policy::{SignatureVerification, TrustPolicyDocument, TrustPolicyStatement};
use notation_rs::registry::{MemoryRegistry, Repository};
use notation_rs::signer::LocalSigner;
use notation_rs::truststore::{TrustStore, TrustStoreType};
use notation_rs::verifier::TrustPolicyVerifier;

pub const CA_PEM: &[u8] = include_bytes!("../../test_data/certs/ca.pem");
pub const LEAF_PEM: &[u8] = include_bytes!("../../test_data/certs/leaf.pem");
pub const LEAF_KEY_PEM: &[u8] = include_bytes!("../../test_data/certs/leaf.key");
pub const OTHER_CA_PEM: &[u8] = include_bytes!("../../test_data/certs/other-ca.pem");

pub fn signing_chain() -> Vec<Certificate> {
    let mut chain = Certificate::from_pem_chain(LEAF_PEM).unwrap();
    chain.extend(Certificate::from_pem_chain(CA_PEM).unwrap());
    chain
}

pub fn local_signer() -> LocalSigner {
    LocalSigner::from_pem(LEAF_KEY_PEM, &[LEAF_PEM, CA_PEM].concat()).unwrap()
}

pub fn trust_store_with(ca_pem: &[u8]) -> TrustStore {
    let mut store = TrustStore::new();
    store
        .add_store(
            TrustStoreType::Ca,
            "acme",
            Certificate::from_pem_chain(ca_pem).unwrap(),
        )
        .unwrap();
    store
}

pub fn policy_with_level(level: &str) -> TrustPolicyDocument {
    let skip = level == "skip";
    TrustPolicyDocument {
        version: "1.0".to_string(),
        trust_policies: vec![TrustPolicyStatement {
            name: "default".to_string(),
            registry_scopes: vec!["*".to_string()],
            signature_verification: SignatureVerification {
                level: level.to_string(),
                overrides: BTreeMap::new(),
            },
            trust_stores: if skip {
                Vec::new()
            } else {
                vec!["ca:acme".to_string()]
            },
            trusted_identities: if skip {
                Vec::new()
            } else {
                vec!["*".to_string()]
            },
        }],
    }
}

pub fn verifier_with_level(level: &str) -> TrustPolicyVerifier {
    let store = if level == "skip" {
        TrustStore::new()
    } else {
        trust_store_with(CA_PEM)
    };
    TrustPolicyVerifier::new(policy_with_level(level), store).unwrap()
}

/// A repository holding one tagged target artifact.
pub async fn seeded_repository() -> (Repository<MemoryRegistry>, Descriptor) {
    let registry = MemoryRegistry::new();
    let subject = registry
        .put_manifest(
            MEDIA_TYPE_IMAGE_MANIFEST,
            br#"{"schemaVersion":2,"config":{},"layers":[]}"#.to_vec(),
            Some("v1"),
        )
        .await;
    (Repository::new(registry), subject)
}
