// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Signing and verifying artifacts held in a local OCI image layout.

mod common;

use std::collections::BTreeMap;

use notation_rs::envelope::SignatureMediaType;
use notation_rs::oci::MEDIA_TYPE_IMAGE_MANIFEST;
use notation_rs::registry::{OciLayout, Repository};
use notation_rs::{
    sign_artifact, verify_local_content, ArtifactSignOptions, LocalVerifyOptions, VerifyError,
};

use common::*;

async fn layout_with_artifact(dir: &tempfile::TempDir) -> (Repository<OciLayout>, notation_rs::oci::Descriptor) {
    let layout = OciLayout::create(dir.path()).await.unwrap();
    let subject = layout
        .import_manifest(
            MEDIA_TYPE_IMAGE_MANIFEST,
            br#"{"schemaVersion":2,"config":{},"layers":[]}"#.to_vec(),
            Some("v1"),
        )
        .await
        .unwrap();
    (Repository::new(layout), subject)
}

fn local_options(reference: &str) -> LocalVerifyOptions {
    LocalVerifyOptions {
        layout_reference: reference.to_string(),
        trust_policy_scope: "local/artifacts".to_string(),
        max_signature_attempts: 10,
        user_metadata: BTreeMap::new(),
    }
}

#[tokio::test]
async fn sign_and_verify_local_layout_content() {
    let dir = tempfile::tempdir().unwrap();
    let (repository, subject) = layout_with_artifact(&dir).await;

    // Sign the descriptor directly, then attach the envelope to the
    // layout.
    let signed = sign_artifact(
        &local_signer(),
        subject.clone(),
        &ArtifactSignOptions::new(SignatureMediaType::Cose),
    )
    .await
    .unwrap();
    repository
        .push_signature(
            SignatureMediaType::Cose.as_str(),
            signed.envelope,
            &signed.descriptor,
            signed.annotations,
            true,
        )
        .await
        .unwrap();

    let verifier = verifier_with_level("strict");
    let (desc, outcomes) =
        verify_local_content(&verifier, &repository, local_options("v1"))
            .await
            .unwrap();
    assert_eq!(desc.digest, subject.digest);
    assert!(outcomes[0].is_success());

    // Verification by digest works the same way.
    verify_local_content(
        &verifier,
        &repository,
        local_options(subject.digest.as_str()),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn unsigned_layout_content_reports_signature_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (repository, _) = layout_with_artifact(&dir).await;

    let verifier = verifier_with_level("strict");
    let err = verify_local_content(&verifier, &repository, local_options("v1"))
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::SignatureNotFound { .. }), "{err:?}");
}
