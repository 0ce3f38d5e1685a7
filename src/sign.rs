// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The signing flow: resolve the artifact, fold in user metadata, delegate
//! to a [`Signer`], and attach the produced envelope to the artifact
//! through the referrers relationship.

use std::collections::BTreeMap;

use chrono::Duration;
use log::{info, warn};
use oci_client::Reference;
use thiserror::Error;

use crate::oci::{Descriptor, ANNOTATION_X509_CHAIN_THUMBPRINT, RESERVED_ANNOTATION_PREFIX};
use crate::registry::{RegistryBackend, RegistryError, Repository};
use crate::signer::{SignRequest, Signer, SignerError, SignerOutput};
use crate::envelope::SignatureMediaType;

pub type SignResult<T> = std::result::Result<T, SignError>;

#[derive(Error, Debug)]
pub enum SignError {
    #[error("expiry duration cannot be a negative value")]
    NegativeExpiry,

    #[error("expiry duration supports a minimum granularity of seconds")]
    SubSecondExpiry,

    #[error("invalid artifact reference {reference:?}: {message}")]
    InvalidReference { reference: String, message: String },

    #[error("user metadata key {0:?} uses the reserved prefix {RESERVED_ANNOTATION_PREFIX:?}")]
    ReservedMetadataKey(String),

    #[error("user metadata key {0:?} is already present in the target artifact")]
    MetadataKeyCollision(String),

    #[error("failed to push the signature: {0}")]
    PushSignatureFailed(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Signer(#[from] SignerError),
}

/// Options for signing an artifact held in a signature store.
#[derive(Clone, Debug)]
pub struct SignOptions {
    /// Tag or digest reference of the artifact to sign.
    pub artifact_reference: String,

    pub signature_media_type: SignatureMediaType,

    /// Lifetime of the produced signature; `None` means no expiry.
    pub expiry_duration: Option<Duration>,

    /// Per-request plugin configuration overrides.
    pub plugin_config: BTreeMap<String, String>,

    pub signing_agent: Option<String>,

    /// Key/value pairs added to the signed payload. Keys must be outside
    /// the reserved namespace and must not collide with existing artifact
    /// annotations.
    pub user_metadata: BTreeMap<String, String>,

    /// Pack the signature as an OCI image manifest instead of an OCI
    /// artifact manifest.
    pub use_oci_image_manifest: bool,
}

impl SignOptions {
    pub fn new(artifact_reference: impl Into<String>, media_type: SignatureMediaType) -> Self {
        Self {
            artifact_reference: artifact_reference.into(),
            signature_media_type: media_type,
            expiry_duration: None,
            plugin_config: BTreeMap::new(),
            signing_agent: None,
            user_metadata: BTreeMap::new(),
            use_oci_image_manifest: true,
        }
    }
}

/// Options for signing a descriptor directly, without a signature store.
#[derive(Clone, Debug)]
pub struct ArtifactSignOptions {
    pub signature_media_type: SignatureMediaType,

    pub expiry_duration: Option<Duration>,

    pub plugin_config: BTreeMap<String, String>,

    pub signing_agent: Option<String>,

    pub user_metadata: BTreeMap<String, String>,
}

impl ArtifactSignOptions {
    pub fn new(media_type: SignatureMediaType) -> Self {
        Self {
            signature_media_type: media_type,
            expiry_duration: None,
            plugin_config: BTreeMap::new(),
            signing_agent: None,
            user_metadata: BTreeMap::new(),
        }
    }
}

/// The result of signing local content: the annotated descriptor, the
/// envelope, and the annotations for a signature manifest.
#[derive(Debug)]
pub struct SignedArtifact {
    pub descriptor: Descriptor,

    pub envelope: Vec<u8>,

    pub annotations: BTreeMap<String, String>,
}

/// Signs the artifact behind `opts.artifact_reference` and pushes the
/// signature to the store. Returns the descriptor of the signed content.
pub async fn sign<B: RegistryBackend>(
    signer: &dyn Signer,
    repository: &Repository<B>,
    opts: SignOptions,
) -> SignResult<Descriptor> {
    validate_expiry(opts.expiry_duration)?;
    let reference = parse_reference(&opts.artifact_reference)?;

    let target_desc = repository.resolve(&opts.artifact_reference).await?;
    if reference.digest().is_none() {
        // Tags are mutable; surface that the signature binds the digest.
        warn!(
            "always sign the artifact using a digest (`@sha256:...`) rather than a tag (`:{}`); tags are mutable and a tag reference can point to a different artifact than the one signed",
            reference.tag().unwrap_or_default()
        );
        info!(
            "resolved artifact tag `{}` to digest `{}` before signing",
            reference.tag().unwrap_or_default(),
            target_desc.digest
        );
    }

    let artifact_opts = ArtifactSignOptions {
        signature_media_type: opts.signature_media_type,
        expiry_duration: opts.expiry_duration,
        plugin_config: opts.plugin_config,
        signing_agent: opts.signing_agent,
        user_metadata: opts.user_metadata,
    };
    let signed = sign_artifact(signer, target_desc, &artifact_opts).await?;

    repository
        .push_signature(
            opts.signature_media_type.as_str(),
            signed.envelope,
            &signed.descriptor,
            signed.annotations,
            opts.use_oci_image_manifest,
        )
        .await
        .map_err(|e| SignError::PushSignatureFailed(e.to_string()))?;

    Ok(signed.descriptor)
}

/// Signs `desc` directly. The caller is responsible for storing the
/// returned envelope and annotations.
pub async fn sign_artifact(
    signer: &dyn Signer,
    desc: Descriptor,
    opts: &ArtifactSignOptions,
) -> SignResult<SignedArtifact> {
    validate_expiry(opts.expiry_duration)?;
    let desc = add_user_metadata(desc, &opts.user_metadata)?;

    let request = SignRequest {
        signature_media_type: opts.signature_media_type,
        expiry_duration: opts.expiry_duration,
        plugin_config: opts.plugin_config.clone(),
        signing_agent: opts.signing_agent.clone(),
    };
    let output = signer.sign(&desc, &request).await?;

    let annotations = signature_manifest_annotations(&output);
    Ok(SignedArtifact {
        descriptor: desc,
        envelope: output.envelope,
        annotations,
    })
}

fn validate_expiry(expiry: Option<Duration>) -> SignResult<()> {
    let Some(expiry) = expiry else {
        return Ok(());
    };
    if expiry < Duration::zero() {
        return Err(SignError::NegativeExpiry);
    }
    if expiry != Duration::seconds(expiry.num_seconds()) {
        return Err(SignError::SubSecondExpiry);
    }
    Ok(())
}

fn parse_reference(reference: &str) -> SignResult<Reference> {
    let parsed = Reference::try_from(reference).map_err(|e| SignError::InvalidReference {
        reference: reference.to_string(),
        message: e.to_string(),
    })?;
    if parsed.tag().is_none() && parsed.digest().is_none() {
        return Err(SignError::InvalidReference {
            reference: reference.to_string(),
            message: "reference is missing digest or tag".to_string(),
        });
    }
    Ok(parsed)
}

/// Folds user metadata into the descriptor annotations, rejecting reserved
/// keys and collisions with existing annotations.
fn add_user_metadata(
    mut desc: Descriptor,
    user_metadata: &BTreeMap<String, String>,
) -> SignResult<Descriptor> {
    if user_metadata.is_empty() {
        return Ok(desc);
    }
    let annotations = desc.annotations.get_or_insert_with(BTreeMap::new);
    for (key, value) in user_metadata {
        if key.starts_with(RESERVED_ANNOTATION_PREFIX) {
            return Err(SignError::ReservedMetadataKey(key.clone()));
        }
        if annotations.contains_key(key) {
            return Err(SignError::MetadataKeyCollision(key.clone()));
        }
        annotations.insert(key.clone(), value.clone());
    }
    Ok(desc)
}

/// The signature manifest annotations: any annotations the signer
/// contributed plus the certificate chain thumbprint list, leaf first.
fn signature_manifest_annotations(output: &SignerOutput) -> BTreeMap<String, String> {
    let thumbprints: Vec<String> = output
        .signer_info
        .certificate_chain
        .iter()
        .map(|cert| cert.thumbprint())
        .collect();
    let mut annotations = output.annotations.clone();
    // Thumbprints are plain hex strings; serialization cannot fail.
    annotations.insert(
        ANNOTATION_X509_CHAIN_THUMBPRINT.to_string(),
        serde_json::to_string(&thumbprints).unwrap_or_default(),
    );
    annotations
}
