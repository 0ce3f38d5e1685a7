// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! OCI image layout backend: signature storage for artifacts held in a
//! local layout directory instead of a remote registry.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use oci_client::Reference;
use tokio::sync::Mutex;

use super::{RegistryBackend, RegistryError, RegistryResult, ReferrerPage, MAX_MANIFEST_SIZE_LIMIT};
use crate::digest::ContentDigest;
use crate::oci::{Descriptor, ImageIndex, ANNOTATION_REF_NAME, MEDIA_TYPE_IMAGE_INDEX};

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_FILE: &str = "index.json";

/// An OCI image layout directory. The layout index tracks manifests; the
/// referrers listing is computed by scanning indexed manifests for a
/// matching `subject`.
pub struct OciLayout {
    root: PathBuf,
    // Serializes index read-modify-write cycles.
    index_lock: Mutex<()>,
}

impl OciLayout {
    /// Opens an existing layout directory.
    pub async fn open(root: impl Into<PathBuf>) -> RegistryResult<Self> {
        let root = root.into();
        if !root.join(OCI_LAYOUT_FILE).is_file() || !root.join(INDEX_FILE).is_file() {
            return Err(RegistryError::Transport(format!(
                "{} is not an OCI image layout",
                root.display()
            )));
        }
        Ok(Self {
            root,
            index_lock: Mutex::new(()),
        })
    }

    /// Creates a fresh layout directory (or opens it when already one).
    pub async fn create(root: impl Into<PathBuf>) -> RegistryResult<Self> {
        let root = root.into();
        if root.join(OCI_LAYOUT_FILE).is_file() {
            return Self::open(root).await;
        }
        tokio::fs::create_dir_all(root.join("blobs").join("sha256"))
            .await
            .map_err(|e| RegistryError::Transport(e.to_string()))?;
        tokio::fs::write(root.join(OCI_LAYOUT_FILE), OCI_LAYOUT_CONTENT)
            .await
            .map_err(|e| RegistryError::Transport(e.to_string()))?;
        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_IMAGE_INDEX.to_string()),
            manifests: Vec::new(),
        };
        tokio::fs::write(
            root.join(INDEX_FILE),
            serde_json::to_vec(&index).map_err(|e| RegistryError::Transport(e.to_string()))?,
        )
        .await
        .map_err(|e| RegistryError::Transport(e.to_string()))?;
        Ok(Self {
            root,
            index_lock: Mutex::new(()),
        })
    }

    fn blob_path(&self, digest: &ContentDigest) -> PathBuf {
        let (algorithm, hex) = digest
            .as_str()
            .split_once(':')
            .unwrap_or(("sha256", digest.as_str()));
        self.root.join("blobs").join(algorithm).join(hex)
    }

    async fn read_index(&self) -> RegistryResult<ImageIndex> {
        let bytes = tokio::fs::read(self.root.join(INDEX_FILE))
            .await
            .map_err(|e| RegistryError::Transport(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| RegistryError::Transport(e.to_string()))
    }

    async fn write_index(&self, index: &ImageIndex) -> RegistryResult<()> {
        let bytes =
            serde_json::to_vec(index).map_err(|e| RegistryError::Transport(e.to_string()))?;
        tokio::fs::write(self.root.join(INDEX_FILE), bytes)
            .await
            .map_err(|e| RegistryError::Transport(e.to_string()))
    }

    /// Reads a content file, refusing to buffer past `limit`. The length
    /// check runs against file metadata before any bytes are read.
    async fn read_limited(&self, path: &Path, limit: i64) -> RegistryResult<Vec<u8>> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|_| RegistryError::NotFound(path.display().to_string()))?;
        if meta.len() > limit as u64 {
            return Err(RegistryError::SizeExceeded {
                content: "content file",
                size: meta.len() as i64,
                limit,
            });
        }
        tokio::fs::read(path)
            .await
            .map_err(|e| RegistryError::Transport(e.to_string()))
    }

    async fn write_blob(&self, content: &[u8]) -> RegistryResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(content);
        let path = self.blob_path(&digest);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RegistryError::Transport(e.to_string()))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| RegistryError::Transport(e.to_string()))?;
        Ok(digest)
    }

    /// Tags an already-stored manifest in the layout index.
    pub async fn tag(&self, desc: &Descriptor, name: &str) -> RegistryResult<()> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        for entry in &mut index.manifests {
            if entry.digest == desc.digest {
                entry
                    .annotations
                    .get_or_insert_with(Default::default)
                    .insert(ANNOTATION_REF_NAME.to_string(), name.to_string());
                return self.write_index(&index).await;
            }
        }
        Err(RegistryError::NotFound(desc.digest.to_string()))
    }

    /// Imports a manifest into the layout, optionally tagging it. The
    /// local-content signing and verification flows start from here.
    pub async fn import_manifest(
        &self,
        media_type: &str,
        content: Vec<u8>,
        tag: Option<&str>,
    ) -> RegistryResult<Descriptor> {
        let desc = self.push_manifest(media_type, content).await?;
        if let Some(tag) = tag {
            self.tag(&desc, tag).await?;
        }
        Ok(desc)
    }
}

#[async_trait]
impl RegistryBackend for OciLayout {
    async fn resolve(&self, reference: &str) -> RegistryResult<Descriptor> {
        // Bare digests and tags are accepted alongside full references.
        let (tag, digest) = if let Ok(digest) = reference.parse::<ContentDigest>() {
            (None, Some(digest))
        } else {
            match Reference::try_from(reference) {
                Ok(parsed) => match (parsed.digest(), parsed.tag()) {
                    (Some(d), _) => (
                        None,
                        Some(d.parse::<ContentDigest>().map_err(|e| {
                            RegistryError::InvalidReference {
                                reference: reference.to_string(),
                                message: e.to_string(),
                            }
                        })?),
                    ),
                    (None, Some(tag)) => (Some(tag.to_string()), None),
                    // A repository-only parse means the input was a bare
                    // layout tag.
                    (None, None) => (Some(reference.to_string()), None),
                },
                Err(_) => (Some(reference.to_string()), None),
            }
        };

        let index = self.read_index().await?;
        for entry in &index.manifests {
            if let Some(digest) = &digest {
                if entry.digest == *digest {
                    return Ok(entry.clone());
                }
            }
            if let (Some(tag), Some(annotations)) = (&tag, &entry.annotations) {
                if annotations.get(ANNOTATION_REF_NAME) == Some(tag) {
                    return Ok(entry.clone());
                }
            }
        }
        Err(RegistryError::NotFound(reference.to_string()))
    }

    async fn fetch_manifest(&self, desc: &Descriptor, limit: i64) -> RegistryResult<Vec<u8>> {
        if desc.size > limit {
            return Err(RegistryError::SizeExceeded {
                content: "manifest",
                size: desc.size,
                limit,
            });
        }
        self.read_limited(&self.blob_path(&desc.digest), limit).await
    }

    async fn fetch_blob(&self, desc: &Descriptor, limit: i64) -> RegistryResult<Vec<u8>> {
        if desc.size > limit {
            return Err(RegistryError::SizeExceeded {
                content: "blob",
                size: desc.size,
                limit,
            });
        }
        self.read_limited(&self.blob_path(&desc.digest), limit).await
    }

    async fn push_blob(&self, media_type: &str, content: Vec<u8>) -> RegistryResult<Descriptor> {
        let desc = Descriptor::from_content(media_type, &content);
        self.write_blob(&content).await?;
        Ok(desc)
    }

    async fn push_manifest(
        &self,
        media_type: &str,
        content: Vec<u8>,
    ) -> RegistryResult<Descriptor> {
        let mut desc = Descriptor::from_content(media_type, &content);
        if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&content) {
            desc.artifact_type = json
                .get("artifactType")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| {
                    json.pointer("/config/mediaType")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                });
            desc.annotations = json
                .get("annotations")
                .and_then(|v| serde_json::from_value(v.clone()).ok());
        }
        self.write_blob(&content).await?;

        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        if !index.manifests.iter().any(|m| m.digest == desc.digest) {
            index.manifests.push(desc.clone());
            self.write_index(&index).await?;
        }
        Ok(desc)
    }

    async fn referrers_page(
        &self,
        subject: &Descriptor,
        artifact_type: &str,
        _page_token: Option<String>,
    ) -> RegistryResult<ReferrerPage> {
        let index = self.read_index().await?;
        let mut referrers = Vec::new();
        for entry in &index.manifests {
            if entry.artifact_type.as_deref() != Some(artifact_type) {
                continue;
            }
            if entry.size > MAX_MANIFEST_SIZE_LIMIT {
                continue;
            }
            let bytes = self
                .read_limited(&self.blob_path(&entry.digest), MAX_MANIFEST_SIZE_LIMIT)
                .await?;
            let Ok(json) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
                continue;
            };
            if json.pointer("/subject/digest").and_then(|v| v.as_str())
                == Some(subject.digest.as_str())
            {
                referrers.push(entry.clone());
            }
        }
        Ok(ReferrerPage {
            referrers,
            next: None,
        })
    }
}
