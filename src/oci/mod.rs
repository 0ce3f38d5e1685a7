// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The subset of the OCI image/artifact wire model needed to attach
//! signatures to manifests through the referrers relationship.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::ContentDigest;

/// Artifact type identifying Notary Project signature manifests.
pub const ARTIFACT_TYPE_NOTATION: &str = "application/vnd.cncf.notary.signature";

/// Signature manifest annotation carrying the hex SHA-256 thumbprints of the
/// signing certificate chain, leaf first.
pub const ANNOTATION_X509_CHAIN_THUMBPRINT: &str = "io.cncf.notary.x509chain.thumbprint#S256";

/// Annotation keys with this prefix are reserved and rejected in
/// user-supplied metadata.
pub const RESERVED_ANNOTATION_PREFIX: &str = "io.cncf.notary";

pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_ARTIFACT_MANIFEST: &str = "application/vnd.oci.artifact.manifest.v1+json";
pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_EMPTY_JSON: &str = "application/vnd.oci.empty.v1+json";

/// Tag-style reference annotation used by the OCI image layout index.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// A content descriptor: media type, digest and size, with optional
/// annotations. Annotations are kept sorted so serialized descriptors are
/// deterministic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,

    pub digest: ContentDigest,

    pub size: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    /// Describes `content` with the given media type.
    pub fn from_content(media_type: &str, content: &[u8]) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest: ContentDigest::from_bytes(content),
            size: content.len() as i64,
            artifact_type: None,
            annotations: None,
        }
    }

    /// The empty JSON config descriptor used when packing signature
    /// manifests in OCI image manifest form.
    pub fn empty_json() -> Self {
        Self::from_content(MEDIA_TYPE_EMPTY_JSON, b"{}")
    }

    /// Two descriptors refer to the same content if media type, digest and
    /// size all match. Annotations are not part of content identity.
    pub fn same_content(&self, other: &Descriptor) -> bool {
        self.media_type == other.media_type
            && self.digest == other.digest
            && self.size == other.size
    }
}

/// OCI image manifest, restricted to the fields the signature storage model
/// uses: a `subject` link and a single signature layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: i32,

    pub media_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// OCI artifact manifest. Superseded in the distribution spec but still
/// accepted when fetching signatures pushed by older clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactManifest {
    pub media_type: String,

    pub artifact_type: String,

    pub blobs: Vec<Descriptor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// OCI image index, used by the image layout backend.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    pub manifests: Vec<Descriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_from_content() {
        let desc = Descriptor::from_content(MEDIA_TYPE_IMAGE_MANIFEST, b"{}");
        assert_eq!(desc.size, 2);
        assert_eq!(
            desc.digest.as_str(),
            "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn descriptor_serialization_is_camel_case_and_sparse() {
        let desc = Descriptor::from_content(MEDIA_TYPE_EMPTY_JSON, b"{}");
        let value = serde_json::to_value(&desc).unwrap();
        assert_eq!(value["mediaType"], MEDIA_TYPE_EMPTY_JSON);
        assert!(value.get("annotations").is_none());
        assert!(value.get("artifactType").is_none());
    }

    #[test]
    fn same_content_ignores_annotations() {
        let mut a = Descriptor::from_content(MEDIA_TYPE_IMAGE_MANIFEST, b"data");
        let b = a.clone();
        a.annotations = Some(BTreeMap::from([("k".to_string(), "v".to_string())]));
        assert!(a.same_content(&b));
    }

    #[test]
    fn image_manifest_round_trip() {
        let blob = Descriptor::from_content("application/jose+json", b"sig");
        let subject = Descriptor::from_content(MEDIA_TYPE_IMAGE_MANIFEST, b"target");
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_IMAGE_MANIFEST.to_string(),
            artifact_type: Some(ARTIFACT_TYPE_NOTATION.to_string()),
            config: Descriptor::empty_json(),
            layers: vec![blob],
            subject: Some(subject),
            annotations: None,
        };
        let bytes = serde_json::to_vec(&manifest).unwrap();
        let parsed: ImageManifest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.layers.len(), 1);
        assert_eq!(parsed.artifact_type.as_deref(), Some(ARTIFACT_TYPE_NOTATION));
        assert!(parsed.subject.is_some());
    }
}
