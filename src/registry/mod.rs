// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Registry adapter for signature storage: resolves references, walks the
//! referrers relationship, and fetches/pushes signature blobs and
//! manifests under hard size limits.

pub mod layout;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;

use crate::digest::ContentDigest;
use crate::oci::{
    ArtifactManifest, Descriptor, ImageManifest, ARTIFACT_TYPE_NOTATION,
    MEDIA_TYPE_ARTIFACT_MANIFEST, MEDIA_TYPE_IMAGE_MANIFEST,
};

pub use layout::OciLayout;
pub use memory::MemoryRegistry;

/// Signature envelope blobs above this size are rejected before download.
pub const MAX_BLOB_SIZE_LIMIT: i64 = 32 * 1024 * 1024; // 32 MiB

/// Signature manifests above this size are rejected before download.
pub const MAX_MANIFEST_SIZE_LIMIT: i64 = 4 * 1024 * 1024; // 4 MiB

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("reference {0:?} not found")]
    NotFound(String),

    #[error("not authorized to access {0:?}")]
    Unauthorized(String),

    #[error("{content} too large: {size} bytes, limit is {limit} bytes")]
    SizeExceeded {
        content: &'static str,
        size: i64,
        limit: i64,
    },

    #[error("fetched content digest {actual} does not match descriptor digest {expected}")]
    DigestMismatch {
        expected: ContentDigest,
        actual: ContentDigest,
    },

    #[error("invalid signature manifest: {0}")]
    InvalidSignatureManifest(String),

    #[error("registry transport error: {0}")]
    Transport(String),

    #[error("invalid reference {reference:?}: {message}")]
    InvalidReference { reference: String, message: String },
}

/// One page of the referrers listing.
#[derive(Debug, Default)]
pub struct ReferrerPage {
    pub referrers: Vec<Descriptor>,

    /// Continuation token of the next page, if any.
    pub next: Option<String>,
}

/// Low-level content operations of a signature store. The HTTP transport
/// of a real registry sits behind this boundary; the crate ships an
/// in-memory store and an OCI image layout store.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Resolves a tag or digest reference to a manifest descriptor.
    async fn resolve(&self, reference: &str) -> RegistryResult<Descriptor>;

    /// Fetches manifest bytes. Implementations must refuse to buffer more
    /// than `limit` bytes.
    async fn fetch_manifest(&self, desc: &Descriptor, limit: i64) -> RegistryResult<Vec<u8>>;

    /// Fetches blob bytes under the same contract as `fetch_manifest`.
    async fn fetch_blob(&self, desc: &Descriptor, limit: i64) -> RegistryResult<Vec<u8>>;

    async fn push_blob(&self, media_type: &str, content: Vec<u8>) -> RegistryResult<Descriptor>;

    /// Pushes manifest bytes. Implementations index the manifest's
    /// `subject` so it becomes discoverable through the referrers listing.
    async fn push_manifest(&self, media_type: &str, content: Vec<u8>)
        -> RegistryResult<Descriptor>;

    /// Lists one page of manifests whose subject is `subject`, filtered by
    /// artifact type.
    async fn referrers_page(
        &self,
        subject: &Descriptor,
        artifact_type: &str,
        page_token: Option<String>,
    ) -> RegistryResult<ReferrerPage>;
}

/// The signature storage protocol over any [`RegistryBackend`].
pub struct Repository<B> {
    backend: B,
}

impl<B: RegistryBackend> Repository<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Resolves a tag or digest reference to a manifest descriptor.
    pub async fn resolve(&self, reference: &str) -> RegistryResult<Descriptor> {
        self.backend.resolve(reference).await
    }

    /// Lazily pages through the signature manifests attached to `subject`.
    /// Dropping the pager stops the listing.
    pub fn list_signatures(&self, subject: &Descriptor) -> SignaturePager<'_, B> {
        SignaturePager {
            repository: self,
            subject: subject.clone(),
            next: None,
            started: false,
            done: false,
        }
    }

    /// Fetches the signature envelope referenced by a signature manifest.
    /// Returns the envelope bytes and the envelope blob descriptor.
    pub async fn fetch_signature_blob(
        &self,
        sig_manifest_desc: &Descriptor,
    ) -> RegistryResult<(Vec<u8>, Descriptor)> {
        if sig_manifest_desc.size > MAX_MANIFEST_SIZE_LIMIT {
            return Err(RegistryError::SizeExceeded {
                content: "signature manifest",
                size: sig_manifest_desc.size,
                limit: MAX_MANIFEST_SIZE_LIMIT,
            });
        }
        let manifest_bytes = self
            .backend
            .fetch_manifest(sig_manifest_desc, MAX_MANIFEST_SIZE_LIMIT)
            .await?;

        let blobs = signature_blobs(sig_manifest_desc, &manifest_bytes)?;
        let [blob_desc] = blobs.as_slice() else {
            return Err(RegistryError::InvalidSignatureManifest(format!(
                "expected exactly one signature envelope blob, got {}",
                blobs.len()
            )));
        };
        if blob_desc.size > MAX_BLOB_SIZE_LIMIT {
            return Err(RegistryError::SizeExceeded {
                content: "signature blob",
                size: blob_desc.size,
                limit: MAX_BLOB_SIZE_LIMIT,
            });
        }

        let blob = self.backend.fetch_blob(blob_desc, MAX_BLOB_SIZE_LIMIT).await?;
        let actual = ContentDigest::from_bytes(&blob);
        if actual != blob_desc.digest {
            return Err(RegistryError::DigestMismatch {
                expected: blob_desc.digest.clone(),
                actual,
            });
        }
        Ok((blob, blob_desc.clone()))
    }

    /// Uploads a signature envelope and the manifest binding it to
    /// `subject`. The packing form is selected by `use_oci_image_manifest`.
    pub async fn push_signature(
        &self,
        media_type: &str,
        envelope: Vec<u8>,
        subject: &Descriptor,
        annotations: BTreeMap<String, String>,
        use_oci_image_manifest: bool,
    ) -> RegistryResult<(Descriptor, Descriptor)> {
        let blob_desc = self.backend.push_blob(media_type, envelope).await?;

        let (manifest_media_type, manifest_bytes) = if use_oci_image_manifest {
            // The empty config blob must exist for the manifest to be
            // complete.
            self.backend
                .push_blob(crate::oci::MEDIA_TYPE_EMPTY_JSON, b"{}".to_vec())
                .await?;
            let manifest = ImageManifest {
                schema_version: 2,
                media_type: MEDIA_TYPE_IMAGE_MANIFEST.to_string(),
                artifact_type: Some(ARTIFACT_TYPE_NOTATION.to_string()),
                config: Descriptor::empty_json(),
                layers: vec![blob_desc.clone()],
                subject: Some(subject.clone()),
                annotations: Some(annotations),
            };
            (
                MEDIA_TYPE_IMAGE_MANIFEST,
                serde_json::to_vec(&manifest)
                    .map_err(|e| RegistryError::InvalidSignatureManifest(e.to_string()))?,
            )
        } else {
            let manifest = ArtifactManifest {
                media_type: MEDIA_TYPE_ARTIFACT_MANIFEST.to_string(),
                artifact_type: ARTIFACT_TYPE_NOTATION.to_string(),
                blobs: vec![blob_desc.clone()],
                subject: Some(subject.clone()),
                annotations: Some(annotations),
            };
            (
                MEDIA_TYPE_ARTIFACT_MANIFEST,
                serde_json::to_vec(&manifest)
                    .map_err(|e| RegistryError::InvalidSignatureManifest(e.to_string()))?,
            )
        };

        let manifest_desc = self
            .backend
            .push_manifest(manifest_media_type, manifest_bytes)
            .await?;
        debug!(
            "pushed signature manifest {} for subject {}",
            manifest_desc.digest, subject.digest
        );
        Ok((blob_desc, manifest_desc))
    }
}

/// Extracts the signature blob descriptors out of a signature manifest in
/// either packing form.
fn signature_blobs(
    sig_manifest_desc: &Descriptor,
    manifest_bytes: &[u8],
) -> RegistryResult<Vec<Descriptor>> {
    match sig_manifest_desc.media_type.as_str() {
        MEDIA_TYPE_IMAGE_MANIFEST => {
            let manifest: ImageManifest = serde_json::from_slice(manifest_bytes)
                .map_err(|e| RegistryError::InvalidSignatureManifest(e.to_string()))?;
            Ok(manifest.layers)
        }
        MEDIA_TYPE_ARTIFACT_MANIFEST => {
            let manifest: ArtifactManifest = serde_json::from_slice(manifest_bytes)
                .map_err(|e| RegistryError::InvalidSignatureManifest(e.to_string()))?;
            Ok(manifest.blobs)
        }
        other => Err(RegistryError::InvalidSignatureManifest(format!(
            "signature manifest media type must be {MEDIA_TYPE_IMAGE_MANIFEST:?} or {MEDIA_TYPE_ARTIFACT_MANIFEST:?}, got {other:?}"
        ))),
    }
}

/// Lazy page iterator over signature manifests; the verification flow
/// stops it by dropping it.
pub struct SignaturePager<'a, B> {
    repository: &'a Repository<B>,
    subject: Descriptor,
    next: Option<String>,
    started: bool,
    done: bool,
}

impl<B: RegistryBackend> SignaturePager<'_, B> {
    pub async fn next_page(&mut self) -> Option<RegistryResult<Vec<Descriptor>>> {
        if self.done {
            return None;
        }
        let token = self.next.take();
        if self.started && token.is_none() {
            self.done = true;
            return None;
        }
        self.started = true;

        match self
            .repository
            .backend
            .referrers_page(&self.subject, ARTIFACT_TYPE_NOTATION, token)
            .await
        {
            Ok(page) => {
                self.next = page.next;
                if self.next.is_none() {
                    self.done = true;
                }
                Some(Ok(page.referrers))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::ANNOTATION_X509_CHAIN_THUMBPRINT;

    async fn seeded() -> (Repository<MemoryRegistry>, Descriptor) {
        let registry = MemoryRegistry::new();
        let subject = registry
            .put_manifest(
                MEDIA_TYPE_IMAGE_MANIFEST,
                br#"{"schemaVersion":2}"#.to_vec(),
                Some("v1"),
            )
            .await;
        (Repository::new(registry), subject)
    }

    #[tokio::test]
    async fn push_and_list_and_fetch_round_trip() {
        let (repository, subject) = seeded().await;
        let annotations =
            BTreeMap::from([(ANNOTATION_X509_CHAIN_THUMBPRINT.to_string(), "[]".to_string())]);

        let (blob_desc, manifest_desc) = repository
            .push_signature(
                "application/jose+json",
                b"the envelope".to_vec(),
                &subject,
                annotations.clone(),
                true,
            )
            .await
            .unwrap();
        assert_eq!(blob_desc.media_type, "application/jose+json");

        let mut pager = repository.list_signatures(&subject);
        let page = pager.next_page().await.unwrap().unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].digest, manifest_desc.digest);
        assert_eq!(
            page[0].artifact_type.as_deref(),
            Some(ARTIFACT_TYPE_NOTATION)
        );
        assert_eq!(
            page[0].annotations.as_ref().unwrap()[ANNOTATION_X509_CHAIN_THUMBPRINT],
            "[]"
        );
        assert!(pager.next_page().await.is_none());

        let (blob, fetched_desc) = repository.fetch_signature_blob(&page[0]).await.unwrap();
        assert_eq!(blob, b"the envelope");
        assert_eq!(fetched_desc.digest, blob_desc.digest);
    }

    #[tokio::test]
    async fn artifact_manifest_form_round_trips() {
        let (repository, subject) = seeded().await;
        repository
            .push_signature(
                "application/cose",
                b"cose envelope".to_vec(),
                &subject,
                BTreeMap::new(),
                false,
            )
            .await
            .unwrap();

        let mut pager = repository.list_signatures(&subject);
        let page = pager.next_page().await.unwrap().unwrap();
        assert_eq!(page[0].media_type, MEDIA_TYPE_ARTIFACT_MANIFEST);
        let (blob, _) = repository.fetch_signature_blob(&page[0]).await.unwrap();
        assert_eq!(blob, b"cose envelope");
    }

    #[tokio::test]
    async fn oversized_descriptors_are_rejected_before_fetch() {
        let (repository, _) = seeded().await;

        let mut huge_manifest =
            Descriptor::from_content(MEDIA_TYPE_IMAGE_MANIFEST, b"whatever");
        huge_manifest.size = MAX_MANIFEST_SIZE_LIMIT + 1;
        let err = repository
            .fetch_signature_blob(&huge_manifest)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::SizeExceeded {
                content: "signature manifest",
                ..
            }
        ));
        // Nothing was fetched from the backend.
        assert_eq!(repository.backend().blob_fetch_count(), 0);
    }

    #[tokio::test]
    async fn oversized_blob_is_rejected_without_download() {
        let (repository, subject) = seeded().await;
        let (_, manifest_desc) = repository
            .push_signature(
                "application/jose+json",
                b"sig".to_vec(),
                &subject,
                BTreeMap::new(),
                true,
            )
            .await
            .unwrap();

        // Rewrite the stored signature manifest so its blob claims to be
        // oversized.
        let huge = MAX_BLOB_SIZE_LIMIT + 1;
        repository
            .backend()
            .rewrite_manifest(&manifest_desc.digest, |json| {
                json["layers"][0]["size"] = serde_json::json!(huge);
            })
            .await;

        let mut pager = repository.list_signatures(&subject);
        let page = pager.next_page().await.unwrap().unwrap();
        let err = repository.fetch_signature_blob(&page[0]).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::SizeExceeded {
                content: "signature blob",
                ..
            }
        ));
        assert_eq!(repository.backend().blob_fetch_count(), 0);
    }

    #[tokio::test]
    async fn multi_blob_manifest_is_rejected() {
        let (repository, subject) = seeded().await;
        let (_, manifest_desc) = repository
            .push_signature(
                "application/jose+json",
                b"sig".to_vec(),
                &subject,
                BTreeMap::new(),
                true,
            )
            .await
            .unwrap();

        repository
            .backend()
            .rewrite_manifest(&manifest_desc.digest, |json| {
                let layer = json["layers"][0].clone();
                json["layers"].as_array_mut().unwrap().push(layer);
            })
            .await;

        let mut pager = repository.list_signatures(&subject);
        let page = pager.next_page().await.unwrap().unwrap();
        let err = repository.fetch_signature_blob(&page[0]).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSignatureManifest(_)));
    }

    #[tokio::test]
    async fn pager_walks_pages_lazily() {
        let registry = MemoryRegistry::with_page_size(2);
        let subject = registry
            .put_manifest(
                MEDIA_TYPE_IMAGE_MANIFEST,
                br#"{"schemaVersion":2}"#.to_vec(),
                None,
            )
            .await;
        let repository = Repository::new(registry);
        for i in 0..5u8 {
            repository
                .push_signature(
                    "application/jose+json",
                    vec![i],
                    &subject,
                    BTreeMap::new(),
                    true,
                )
                .await
                .unwrap();
        }

        let mut pager = repository.list_signatures(&subject);
        let mut sizes = Vec::new();
        while let Some(page) = pager.next_page().await {
            sizes.push(page.unwrap().len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }
}
