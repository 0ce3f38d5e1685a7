// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The verification flow: resolve the artifact, discover its signatures
//! through the referrers listing, and verify them one by one until the
//! first success.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use oci_client::Reference;
use thiserror::Error;

use crate::oci::Descriptor;
use crate::registry::{RegistryBackend, Repository};
use crate::verifier::{
    CheckFailure, SignatureVerifyOptions, VerificationOutcome, Verifier, VerifierError,
};

pub type VerifyResult<T> = std::result::Result<T, VerifyError>;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("max_signature_attempts expects a positive number")]
    InvalidMaxSignatureAttempts,

    #[error("invalid artifact reference {reference:?}: {message}")]
    InvalidReference { reference: String, message: String },

    #[error("no signature is associated with {reference:?}, make sure the artifact was signed successfully")]
    SignatureNotFound { reference: String },

    #[error("signature retrieval failed: {0}")]
    SignatureRetrievalFailed(String),

    #[error("signature verification failed for all signatures associated with {reference:?}")]
    VerificationFailed {
        reference: String,
        outcomes: Vec<VerificationOutcome>,
    },

    #[error("required user metadata was missing or mismatched in every signature of {reference:?}")]
    UserMetadataVerificationFailed {
        reference: String,
        outcomes: Vec<VerificationOutcome>,
    },

    #[error("total number of signatures associated with the artifact should be less than {max}")]
    MaxSignatureAttemptsExceeded {
        max: usize,
        outcomes: Vec<VerificationOutcome>,
    },

    #[error(transparent)]
    Verifier(#[from] VerifierError),
}

/// Options for verifying an artifact against its attached signatures.
#[derive(Clone, Debug)]
pub struct VerifyOptions {
    /// Tag or digest reference of the artifact to verify.
    pub artifact_reference: String,

    /// Upper bound on the number of signature envelopes processed.
    pub max_signature_attempts: usize,

    /// Key/value pairs that must be present in a signature for it to
    /// verify.
    pub user_metadata: BTreeMap<String, String>,

    /// Overrides trust policy statement selection; used when the artifact
    /// reference carries no meaningful registry scope (local layouts).
    pub trust_policy_scope: Option<String>,
}

impl VerifyOptions {
    pub fn new(artifact_reference: impl Into<String>, max_signature_attempts: usize) -> Self {
        Self {
            artifact_reference: artifact_reference.into(),
            max_signature_attempts,
            user_metadata: BTreeMap::new(),
            trust_policy_scope: None,
        }
    }
}

/// Options for verifying an artifact held in an OCI image layout.
#[derive(Clone, Debug)]
pub struct LocalVerifyOptions {
    /// Tag or digest of the target artifact inside the layout.
    pub layout_reference: String,

    /// The registry scope under which the trust policy statement is
    /// selected; layouts carry no registry identity of their own.
    pub trust_policy_scope: String,

    pub max_signature_attempts: usize,

    pub user_metadata: BTreeMap<String, String>,
}

/// Verifies the artifact behind `opts.artifact_reference`. On success the
/// resolved descriptor and the successful outcome are returned; the first
/// verified signature wins and stops the listing.
pub async fn verify<B: RegistryBackend>(
    verifier: &dyn Verifier,
    repository: &Repository<B>,
    opts: VerifyOptions,
) -> VerifyResult<(Descriptor, Vec<VerificationOutcome>)> {
    if opts.max_signature_attempts == 0 {
        return Err(VerifyError::InvalidMaxSignatureAttempts);
    }
    let reference = parse_reference(&opts.artifact_reference)?;

    let artifact_desc = repository
        .resolve(&opts.artifact_reference)
        .await
        .map_err(|e| VerifyError::SignatureRetrievalFailed(e.to_string()))?;
    if reference.digest().is_none() {
        info!(
            "resolved artifact tag `{}` to digest `{}` before verification",
            reference.tag().unwrap_or_default(),
            artifact_desc.digest
        );
        warn!("the resolved digest may not point to the same signed artifact, since tags are mutable");
    }

    let sig_opts = SignatureVerifyOptions {
        artifact_reference: Some(opts.artifact_reference.clone()),
        trust_policy_scope: opts.trust_policy_scope.clone(),
        signature_media_type: None,
        user_metadata: opts.user_metadata.clone(),
    };
    verify_signatures(
        verifier,
        repository,
        artifact_desc,
        sig_opts,
        opts.max_signature_attempts,
        opts.artifact_reference,
    )
    .await
}

/// Verifies an artifact inside an OCI image layout. Shares the signature
/// pipeline with [`verify`]; only resolution and policy scoping differ.
pub async fn verify_local_content(
    verifier: &dyn Verifier,
    repository: &Repository<crate::registry::OciLayout>,
    opts: LocalVerifyOptions,
) -> VerifyResult<(Descriptor, Vec<VerificationOutcome>)> {
    if opts.max_signature_attempts == 0 {
        return Err(VerifyError::InvalidMaxSignatureAttempts);
    }

    let artifact_desc = repository
        .resolve(&opts.layout_reference)
        .await
        .map_err(|e| VerifyError::SignatureRetrievalFailed(e.to_string()))?;
    if opts.layout_reference != artifact_desc.digest.as_str() {
        warn!(
            "always verify the artifact using a digest rather than the tag `{}`; tags are mutable",
            opts.layout_reference
        );
    }

    let sig_opts = SignatureVerifyOptions {
        artifact_reference: None,
        trust_policy_scope: Some(opts.trust_policy_scope),
        signature_media_type: None,
        user_metadata: opts.user_metadata,
    };
    verify_signatures(
        verifier,
        repository,
        artifact_desc,
        sig_opts,
        opts.max_signature_attempts,
        opts.layout_reference,
    )
    .await
}

/// The shared per-artifact loop: walk the signature listing, verify each
/// envelope, stop on the first success, and aggregate failures at the end.
async fn verify_signatures<B: RegistryBackend>(
    verifier: &dyn Verifier,
    repository: &Repository<B>,
    artifact_desc: Descriptor,
    mut sig_opts: SignatureVerifyOptions,
    max_signature_attempts: usize,
    reference: String,
) -> VerifyResult<(Descriptor, Vec<VerificationOutcome>)> {
    // A policy statement at the skip level ends verification before any
    // signature is fetched.
    if let Some(level) = verifier.check_skip(&sig_opts).await? {
        info!("signature verification skipped for {reference}");
        return Ok((artifact_desc, vec![VerificationOutcome::skipped(level)]));
    }

    let mut failed_outcomes: Vec<VerificationOutcome> = Vec::new();
    let mut processed = 0usize;

    let mut pager = repository.list_signatures(&artifact_desc);
    while let Some(page) = pager.next_page().await {
        let page = page.map_err(|e| VerifyError::SignatureRetrievalFailed(e.to_string()))?;
        for sig_manifest_desc in page {
            if processed >= max_signature_attempts {
                break;
            }
            processed += 1;
            debug!(
                "processing signature with manifest media type {} and digest {}",
                sig_manifest_desc.media_type, sig_manifest_desc.digest
            );

            let (sig_blob, sig_desc) = repository
                .fetch_signature_blob(&sig_manifest_desc)
                .await
                .map_err(|e| {
                    VerifyError::SignatureRetrievalFailed(format!(
                        "unable to retrieve digital signature with digest {} associated with {reference:?}: {e}",
                        sig_manifest_desc.digest
                    ))
                })?;

            // The envelope format comes from the stored blob descriptor.
            sig_opts.signature_media_type = sig_desc.media_type.parse().ok();

            let outcome = verifier.verify(&artifact_desc, &sig_blob, &sig_opts).await?;
            if outcome.is_success() {
                debug!(
                    "signature verification succeeded for {} with signature digest {}",
                    artifact_desc.digest, sig_desc.digest
                );
                return Ok((artifact_desc, vec![outcome]));
            }
            if let Some(error) = &outcome.error {
                warn!(
                    "signature {} failed verification: {error}",
                    sig_desc.digest
                );
            }
            failed_outcomes.push(outcome);
        }

        // Reaching the cap without a success is the dedicated failure,
        // even when it lands exactly on the last signature.
        if processed >= max_signature_attempts {
            return Err(VerifyError::MaxSignatureAttemptsExceeded {
                max: max_signature_attempts,
                outcomes: failed_outcomes,
            });
        }
    }

    if processed == 0 {
        return Err(VerifyError::SignatureNotFound { reference });
    }

    // All processed signatures failed; compute the terminal error from the
    // collected outcomes, preferring the user-metadata failure kind.
    let has_metadata_failure = failed_outcomes.iter().any(|outcome| {
        matches!(
            outcome.error,
            Some(CheckFailure::UserMetadataMismatch { .. })
        )
    });
    Err(if has_metadata_failure {
        VerifyError::UserMetadataVerificationFailed {
            reference,
            outcomes: failed_outcomes,
        }
    } else {
        VerifyError::VerificationFailed {
            reference,
            outcomes: failed_outcomes,
        }
    })
}

fn parse_reference(reference: &str) -> VerifyResult<Reference> {
    let parsed = Reference::try_from(reference).map_err(|e| VerifyError::InvalidReference {
        reference: reference.to_string(),
        message: e.to_string(),
    })?;
    if parsed.tag().is_none() && parsed.digest().is_none() {
        return Err(VerifyError::InvalidReference {
            reference: reference.to_string(),
            message: "reference is missing digest or tag".to_string(),
        });
    }
    Ok(parsed)
}
